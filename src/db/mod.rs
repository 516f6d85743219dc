//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models and write models passed to/from repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `coursepulse::db`; the repository
//! API and commonly used models are re-exported for convenience.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ClaimedEntry, ItemForQueue, StatusCounts, WorkItemUpsert};
