pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod geometry;
pub mod model;
pub mod query;
pub mod session;
pub mod store;
pub mod triage;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Result, ReviewError};
pub use session::{InferenceSummary, ReviewSession};
pub use store::{Partition, Provenance, ResultStore, TriageState};
pub use triage::TriageEngine;
