//! Post-run heuristics
//!
//! Two named profiles grade a finished run:
//! - **soak**: max/avg latency ratio over the full run, flagging a possible
//!   resource leak when it exceeds a configured multiple
//! - **spike**: failure rate restricted to ramp and elevated-hold stages,
//!   graded excellent / degraded / failing
//!
//! Both are pure functions of the run configuration, the final snapshot and
//! the threshold outcomes.

use crate::config::RunConfig;
use crate::metrics::FinalSnapshot;
use crate::plan::StageKind;
use crate::threshold::ThresholdOutcome;
use serde::{Deserialize, Serialize};

fn default_leak_ratio() -> f64 {
    10.0
}

fn default_excellent_below() -> f64 {
    0.01
}

fn default_degraded_below() -> f64 {
    0.05
}

/// Heuristic selected for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssessmentProfile {
    #[default]
    None,
    Soak {
        /// Max/avg latency multiple above which a leak is suspected
        #[serde(default = "default_leak_ratio")]
        leak_ratio: f64,
    },
    Spike {
        #[serde(default = "default_excellent_below")]
        excellent_below: f64,
        #[serde(default = "default_degraded_below")]
        degraded_below: f64,
    },
}

impl AssessmentProfile {
    pub fn soak() -> Self {
        AssessmentProfile::Soak {
            leak_ratio: default_leak_ratio(),
        }
    }

    pub fn spike() -> Self {
        AssessmentProfile::Spike {
            excellent_below: default_excellent_below(),
            degraded_below: default_degraded_below(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AssessmentProfile::None => "none",
            AssessmentProfile::Soak { .. } => "soak",
            AssessmentProfile::Spike { .. } => "spike",
        }
    }
}

/// Narrative grade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    NotAssessed,
    NoData,
    Stable,
    PossibleLeak,
    Excellent,
    Degraded,
    Failing,
}

/// Numbers a tier was derived from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentBasis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_to_avg_latency_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leak_ratio_threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spike_window_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spike_window_failures: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spike_failure_rate: Option<f64>,
    pub thresholds_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub profile: String,
    pub tier: Tier,
    pub narrative: String,
    pub basis: AssessmentBasis,
    /// Signals for a human to investigate; never fail the run
    pub warnings: Vec<String>,
}

/// Grade a finished run
pub fn assess(
    config: &RunConfig,
    snapshot: &FinalSnapshot,
    thresholds: &[ThresholdOutcome],
) -> Assessment {
    let thresholds_failed = thresholds.iter().filter(|t| !t.passed).count();

    let mut assessment = match &config.profile {
        AssessmentProfile::None => Assessment {
            profile: "none".to_string(),
            tier: Tier::NotAssessed,
            narrative: "No assessment profile selected".to_string(),
            basis: AssessmentBasis::default(),
            warnings: Vec::new(),
        },
        AssessmentProfile::Soak { leak_ratio } => assess_soak(*leak_ratio, snapshot),
        AssessmentProfile::Spike {
            excellent_below,
            degraded_below,
        } => assess_spike(
            *excellent_below,
            *degraded_below,
            config.rate_limited_expected,
            snapshot,
        ),
    };

    assessment.basis.thresholds_failed = thresholds_failed;
    if thresholds_failed > 0 {
        assessment
            .narrative
            .push_str(&format!("; {} threshold(s) failed", thresholds_failed));
    }
    assessment
}

fn assess_soak(leak_ratio: f64, snapshot: &FinalSnapshot) -> Assessment {
    let overall = &snapshot.overall;
    let mut basis = AssessmentBasis {
        leak_ratio_threshold: Some(leak_ratio),
        error_rate: overall.error_rate,
        ..Default::default()
    };

    let Some(latency) = &overall.latency else {
        return Assessment {
            profile: "soak".to_string(),
            tier: Tier::NoData,
            narrative: "No requests completed; stability cannot be judged".to_string(),
            basis,
            warnings: Vec::new(),
        };
    };

    let ratio = if latency.avg_ms > 0.0 {
        latency.max_ms / latency.avg_ms
    } else {
        1.0
    };
    basis.max_to_avg_latency_ratio = Some(ratio);
    basis.avg_latency_ms = Some(latency.avg_ms);
    basis.max_latency_ms = Some(latency.max_ms);

    let error_pct = overall.error_rate.unwrap_or(0.0) * 100.0;
    let mut warnings = Vec::new();

    let (tier, narrative) = if ratio > leak_ratio {
        warnings.push(format!(
            "max latency {:.1}ms is {:.1}x the {:.1}ms average (limit {:.1}x): possible resource leak",
            latency.max_ms, ratio, latency.avg_ms, leak_ratio
        ));
        (
            Tier::PossibleLeak,
            format!(
                "Latency drifted to {:.1}x average under sustained load ({:.2}% errors, {:.1}ms avg); investigate resource growth",
                ratio, error_pct, latency.avg_ms
            ),
        )
    } else {
        (
            Tier::Stable,
            format!(
                "Latency stayed within {:.1}x of average under sustained load ({:.2}% errors, {:.1}ms avg)",
                ratio, error_pct, latency.avg_ms
            ),
        )
    };

    Assessment {
        profile: "soak".to_string(),
        tier,
        narrative,
        basis,
        warnings,
    }
}

fn assess_spike(
    excellent_below: f64,
    degraded_below: f64,
    rate_limited_expected: bool,
    snapshot: &FinalSnapshot,
) -> Assessment {
    let (requests, failures) = snapshot
        .stages
        .iter()
        .filter(|s| s.kind != StageKind::Hold || s.elevated)
        .fold((0u64, 0u64), |(requests, failures), s| {
            let failed = if rate_limited_expected {
                s.failures.saturating_sub(s.rate_limited)
            } else {
                s.failures
            };
            (requests + s.requests, failures + failed)
        });

    let mut basis = AssessmentBasis {
        error_rate: snapshot.overall.error_rate,
        spike_window_requests: Some(requests),
        spike_window_failures: Some(failures),
        ..Default::default()
    };

    if requests == 0 {
        return Assessment {
            profile: "spike".to_string(),
            tier: Tier::NoData,
            narrative: "No requests were sent during ramp or peak stages".to_string(),
            basis,
            warnings: Vec::new(),
        };
    }

    let rate = failures as f64 / requests as f64;
    basis.spike_failure_rate = Some(rate);

    let tier = if rate < excellent_below {
        Tier::Excellent
    } else if rate < degraded_below {
        Tier::Degraded
    } else {
        Tier::Failing
    };
    let label = match tier {
        Tier::Excellent => "excellent",
        Tier::Degraded => "degraded",
        _ => "failing",
    };
    let rate_limit_note = if rate_limited_expected {
        " (429 treated as expected)"
    } else {
        ""
    };

    Assessment {
        profile: "spike".to_string(),
        tier,
        narrative: format!(
            "Spike resilience {}: {:.2}% of {} burst-window requests failed{}",
            label,
            rate * 100.0,
            requests,
            rate_limit_note
        ),
        basis,
        warnings: Vec::new(),
    }
}
