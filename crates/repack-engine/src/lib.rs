//! repack-engine - dispatch loop over a kit graph, a status ledger and an executor

pub mod engine;
pub mod summary;

pub use engine::{run_request, Engine};
pub use summary::RunSummary;
