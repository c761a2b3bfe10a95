//! Persistence layer for the execution engine.
//!
//! The engine runs on a single host, so the store is an embedded SQLite
//! database. [`models`] holds the row types and status enums, [`queries`]
//! the per-table query modules, [`pool`] the pool construction and embedded
//! migrations.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
