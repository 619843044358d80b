//! Database layer for vidqa
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Row-level helpers for sessions, indexing status, and ingest claims
//! - Transactional read-modify-write via [`Database::write`]

pub mod repo;
pub mod schema;

pub use repo::Database;
