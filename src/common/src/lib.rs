pub mod cli;
pub mod config;
pub mod cron;
pub mod id;
pub mod job;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use id::EntityId;
pub use store::DocumentStore;
