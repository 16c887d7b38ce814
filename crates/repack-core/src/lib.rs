//! repack-core - kit/target model, dependency graph, and the status ledger

pub mod error;
pub mod graph;
pub mod ledger;
pub mod types;

pub use error::{Error, Result};
pub use graph::{expand_kit_dependencies, KitGraph};
pub use ledger::{LedgerRecords, StatusLedger, LEDGER_COLUMNS};
pub use types::*;
