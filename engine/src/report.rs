//! Machine-readable run report
//!
//! One JSON document per run; `passed` drives the process exit code.

use crate::assessment::Assessment;
use crate::config::RunConfig;
use crate::metrics::{AggregateSnapshot, EndpointStats, StageStats};
use crate::threshold::{Breach, Severity, ThresholdOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write report to {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    /// Effective seed; set `SURGE_SEED` to this value to replay the run
    pub seed: u64,
    pub config: RunConfig,
    pub completed_all_stages: bool,
    /// The breach that stopped the run early, if any
    pub aborted: Option<Breach>,
    pub forced_terminations: usize,
    pub peak_concurrency: usize,
    pub snapshot: AggregateSnapshot,
    pub stages: Vec<StageStats>,
    pub endpoints: BTreeMap<String, EndpointStats>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub assessment: Assessment,
    pub passed: bool,
}

/// A run passes only if it finished every stage, never aborted, and every
/// hard threshold passed at the end
pub fn run_passed(
    completed_all_stages: bool,
    aborted: Option<&Breach>,
    thresholds: &[ThresholdOutcome],
) -> bool {
    completed_all_stages
        && aborted.is_none()
        && thresholds
            .iter()
            .all(|t| t.passed || t.severity == Severity::Soft)
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.passed { EXIT_PASSED } else { EXIT_FAILED }
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serialize and write to `path`
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let json = self.to_json()?;
        fs::write(path, json).map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds.iter().filter(|t| !t.passed)
    }
}
