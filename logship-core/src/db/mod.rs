//! Database layer for logship
//!
//! This module provides the durable queue using SQLite with:
//! - Schema migrations and validation
//! - Capacity-bounded per-group log storage
//! - Batch claiming with crash recovery

pub mod schema;
pub mod store;

pub use store::{GroupStats, LogStore};
