//! Per-table query modules. Free functions over a [`sqlx::SqlitePool`],
//! returning the row types from [`crate::models`].

pub mod conversations;
pub mod credentials;
pub mod environments;
pub mod execution_logs;
pub mod projects;
pub mod results;
pub mod tasks;
