//! Durable storage for the job queue engine.
//!
//! This crate provides the SurrealDB-backed [`SurrealStore`] and the
//! map-backed [`MemoryStore`], both implementing the store interfaces of
//! `queue_core`.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory SurrealDB storage
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod memory;
mod schema;
mod store;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryStore;
pub use schema::init_schema;
pub use store::SurrealStore;
