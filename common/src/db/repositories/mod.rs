// Repository implementations for the jobs and batches collections

pub mod batch;
pub mod job;

pub use batch::{BatchFilter, BatchRepository};
pub use job::{JobFilter, JobRepository, StatusUpdate};
