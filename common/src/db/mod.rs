// Persistence layer: MongoDB store handle and repositories

pub mod repositories;
pub mod store;

pub use store::Store;
