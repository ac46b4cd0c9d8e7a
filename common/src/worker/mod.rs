// Worker manager: polling scheduler with a bounded pool

pub mod manager;

pub use manager::{WorkerManager, WorkerManagerConfig};
