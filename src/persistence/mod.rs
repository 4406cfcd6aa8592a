//! Persistence layer modules.

pub mod connection_registry;
pub mod db;
pub mod kv_store;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
