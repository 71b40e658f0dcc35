//! Database module: stored-row models and SQL repositories.
//!
//! - `model`: rows as they come back from the items and progress tables.
//! - `repo`: SQL-only functions; the record store and the progress store.
//!
//! Callers import from `xkcd_sync::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ProgressRow, StoredItem};
