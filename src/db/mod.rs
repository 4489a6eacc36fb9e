//! Database module for taskq
//!
//! Provides SQLite persistence for task records.

pub mod connection;
pub mod models;
pub mod tasks;

pub use connection::{create_pool, create_pool_from_env, DbPool};
pub use models::*;
pub use tasks::TaskStore;
