//! repack - resumable, dependency-ordered kit builds
//!
//! The binary wires three pieces together: a kit file ([`manifest`]), a run
//! configuration ([`config`]) and the engine from `repack-engine`.

pub mod config;
pub mod logging;
pub mod manifest;

pub use config::{RepackConfig, RunOverrides, DEFAULT_CONFIG_FILE};
pub use manifest::{select_kits, KitManifest};
