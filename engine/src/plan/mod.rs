//! Stage plan module
//!
//! This module provides:
//! - `Stage`, one time-boxed segment with a target concurrency
//! - `StagePlan`, the validated ordered sequence and its concurrency curve

mod stage;

pub use stage::{PlanError, Stage, StageKind, StagePlan};
