//! Database module: row models and SQL repositories.
//!
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `backfill_engine::db`; the repository API and the
//! common row models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{Counter, QueuedJobRow, StoredRecordRef};
