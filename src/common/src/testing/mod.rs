//! Test utilities for Cadenza.
//!
//! This module provides reusable test utilities: configuration builders and
//! conservatory document fixtures for seeding a store.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::store::MemoryStore;
//! use common::testing::{TestConfigBuilder, fixtures};
//!
//! let store = MemoryStore::new();
//! let scenario = fixtures::seed_student_scenario(&store).await?;
//! let config = TestConfigBuilder::new().without_scheduler().build();
//! ```

mod config_builder;
pub mod fixtures;

pub use config_builder::TestConfigBuilder;
