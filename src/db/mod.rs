//! Database module: stored-row models and SQL repositories.
//!
//! - `model`: row wrappers and aggregate views returned by queries.
//! - `repo`: SQL-only functions (pool setup, bulk insert, dedup, reads).
//!
//! Callers import from `healthsync::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use model::{Stored, WeeklyRecovery, WeeklySleep};
pub use repo::*;
