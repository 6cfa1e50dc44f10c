//! Surge load engine library
//!
//! Staged load generation against an HTTP target with live threshold
//! evaluation and post-run assessment. The binary is a thin wrapper around
//! `Engine`; everything is exported for integration tests and embedding.

pub mod assessment;
pub mod config;
pub mod driver;
pub mod engine;
pub mod metrics;
pub mod plan;
pub mod report;
pub mod scheduler;
pub mod threshold;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use assessment::{Assessment, AssessmentProfile, Tier};
pub use config::{ConfigError, Preset, RunConfig};
pub use driver::{HttpTarget, Target, TargetResponse, TransportError};
pub use engine::{Engine, EngineError};
pub use report::RunReport;
