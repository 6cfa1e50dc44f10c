//! Run configuration
//!
//! A run is described by a JSON plan file or one of the built-in presets,
//! then adjusted from environment variables:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `SURGE_PLAN` | Plan file (when no path is given on the command line) |
//! | `SURGE_PRESET` | `smoke` (default), `soak` or `spike` when no plan file is given |
//! | `SURGE_BASE_URL` | Target base URL |
//! | `SURGE_REPORT_PATH` | Where the JSON report is written |
//! | `SURGE_SEED` | Fixed run seed |
//! | `SURGE_REQUEST_TIMEOUT_MS` | Per-request timeout |
//! | `SURGE_RATE_LIMITED_EXPECTED` | Treat 429 as expected in the spike assessment |

use crate::assessment::AssessmentProfile;
use crate::driver::{EndpointPolicy, ThinkTime, WeightedBranch};
use crate::metrics::AggregatorConfig;
use crate::plan::{PlanError, Stage, StagePlan};
use crate::scheduler::SchedulerConfig;
use crate::threshold::{Comparator, Metric, MonitorConfig, ThresholdRule};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PLAN: &str = "SURGE_PLAN";
pub const ENV_PRESET: &str = "SURGE_PRESET";
pub const ENV_BASE_URL: &str = "SURGE_BASE_URL";
pub const ENV_REPORT_PATH: &str = "SURGE_REPORT_PATH";
pub const ENV_SEED: &str = "SURGE_SEED";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "SURGE_REQUEST_TIMEOUT_MS";
pub const ENV_RATE_LIMITED_EXPECTED: &str = "SURGE_RATE_LIMITED_EXPECTED";

/// Rejections raised before any request is sent
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid stage plan: {0}")]
    Plan(#[from] PlanError),

    #[error("invalid base URL {url:?}: {reason}")]
    BaseUrl { url: String, reason: String },

    #[error("endpoint set is empty")]
    EmptyEndpoints,

    #[error("endpoint paths must be non-empty")]
    EmptyPath,

    #[error("weighted branch {index} needs a finite positive weight and at least one path")]
    InvalidBranch { index: usize },

    #[error("think time min {min:?} exceeds max {max:?}")]
    ThinkTime { min: Duration, max: Duration },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("window capacity must be greater than zero")]
    WindowCapacity,

    #[error("threshold {rule:?} has a non-finite bound")]
    InvalidBound { rule: String },

    #[error("soak leak ratio must be a finite value of at least 1, got {0}")]
    LeakRatio(f64),

    #[error("spike grades must satisfy 0 <= excellent_below <= degraded_below <= 1")]
    SpikeGrades,

    #[error("failed to read plan {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse plan {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("unknown preset {0:?} (expected smoke, soak or spike)")]
    Preset(String),
}

/// Live-evaluation and trailing-window settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// How often abort rules are checked
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Trailing window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Outcomes retained in the trailing window
    pub window_capacity: usize,
    /// Window samples required before a breach can be declared
    pub min_window_samples: u64,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        let aggregator = AggregatorConfig::default();
        Self {
            poll_interval: monitor.poll_interval,
            window: aggregator.window,
            window_capacity: aggregator.window_capacity,
            min_window_samples: monitor.min_window_samples,
        }
    }
}

impl EvaluationSettings {
    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: self.poll_interval,
            min_window_samples: self.min_window_samples,
        }
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            window: self.window,
            window_capacity: self.window_capacity,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_report_path() -> PathBuf {
    PathBuf::from("surge-report.json")
}

/// Everything a run needs, echoed into the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub stages: Vec<Stage>,
    pub endpoints: EndpointPolicy,
    #[serde(default)]
    pub think_time: ThinkTime,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
    #[serde(default)]
    pub profile: AssessmentProfile,
    /// 429 responses are an anticipated defence rather than a failure of resilience
    #[serde(default)]
    pub rate_limited_expected: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub evaluation: EvaluationSettings,
    #[serde(with = "humantime_serde", default = "default_progress_interval")]
    pub progress_interval: Duration,
    /// Drawn at random when absent; the effective value lands in the report
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stages: vec![Stage::new(1, Duration::from_secs(10))],
            endpoints: EndpointPolicy::Fixed {
                path: "/health".to_string(),
            },
            think_time: ThinkTime::default(),
            request_timeout: default_request_timeout(),
            thresholds: Vec::new(),
            profile: AssessmentProfile::None,
            rate_limited_expected: false,
            scheduler: SchedulerConfig::default(),
            evaluation: EvaluationSettings::default(),
            progress_interval: default_progress_interval(),
            seed: None,
            report_path: default_report_path(),
        }
    }
}

/// Built-in run shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Short ramp/hold/ramp-down over mixed endpoints
    Smoke,
    /// Long hold at moderate load with leak detection
    Soak,
    /// Baseline, sudden burst, recovery
    Spike,
}

impl FromStr for Preset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "smoke" => Ok(Preset::Smoke),
            "soak" => Ok(Preset::Soak),
            "spike" => Ok(Preset::Spike),
            _ => Err(ConfigError::Preset(s.to_string())),
        }
    }
}

const MIXED_PATHS: [&str; 3] = ["/health", "/api/stats", "/api/threat-actors"];

fn paths(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

impl RunConfig {
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Smoke => Self {
                stages: vec![
                    Stage::new(10, secs(30)),
                    Stage::new(10, secs(60)),
                    Stage::new(0, secs(10)),
                ],
                endpoints: EndpointPolicy::Uniform {
                    paths: paths(&MIXED_PATHS),
                },
                think_time: ThinkTime::fixed(secs(1)),
                thresholds: vec![
                    ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.01),
                    ThresholdRule::new(Metric::LatencyP95Ms, Comparator::Lt, 500.0),
                ],
                ..Self::default()
            },
            Preset::Soak => Self {
                stages: vec![
                    Stage::new(20, secs(120)),
                    Stage::new(20, secs(30 * 60)),
                    Stage::new(0, secs(120)),
                ],
                endpoints: EndpointPolicy::Weighted {
                    branches: vec![
                        WeightedBranch {
                            weight: 0.8,
                            paths: paths(&["/health", "/api/stats"]),
                        },
                        WeightedBranch {
                            weight: 0.2,
                            paths: paths(&["/api/threat-actors"]),
                        },
                    ],
                },
                think_time: ThinkTime::between(secs(1), secs(3)),
                thresholds: vec![
                    ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.05).aborting(),
                    ThresholdRule::new(Metric::LatencyP95Ms, Comparator::Lt, 1000.0),
                ],
                profile: AssessmentProfile::soak(),
                ..Self::default()
            },
            Preset::Spike => Self {
                stages: vec![
                    Stage::new(10, secs(30)),
                    Stage::new(10, secs(60)),
                    Stage::new(200, secs(10)),
                    Stage::new(200, secs(60)),
                    Stage::new(10, secs(10)),
                    Stage::new(10, secs(60)),
                    Stage::new(0, secs(10)),
                ],
                endpoints: EndpointPolicy::Uniform {
                    paths: paths(&MIXED_PATHS),
                },
                think_time: ThinkTime::between(Duration::from_millis(500), Duration::from_millis(1500)),
                thresholds: vec![
                    ThresholdRule::new(Metric::ErrorRateExcludingRateLimited, Comparator::Lt, 0.1),
                    ThresholdRule::new(Metric::LatencyP95Ms, Comparator::Lt, 2000.0).soft(),
                ],
                profile: AssessmentProfile::spike(),
                rate_limited_expected: true,
                ..Self::default()
            },
        }
    }

    /// Parse a JSON plan file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve plan file or preset, apply overrides and validate
    pub fn load(plan: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with(plan, |var| env::var(var).ok())
    }

    /// Like `load`, reading variables through `lookup`
    pub fn load_with<F>(plan: Option<PathBuf>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let plan = plan.or_else(|| {
            lookup(ENV_PLAN)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
        });

        let mut config = match plan {
            Some(path) => Self::from_file(&path)?,
            None => {
                let preset = match lookup(ENV_PRESET) {
                    Some(name) if !name.is_empty() => name.parse()?,
                    _ => Preset::Smoke,
                };
                Self::preset(preset)
            }
        };

        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SURGE_*` overrides on top of the loaded plan
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL)
            && !url.is_empty()
        {
            self.base_url = url;
        }
        if let Some(path) = lookup(ENV_REPORT_PATH)
            && !path.is_empty()
        {
            self.report_path = PathBuf::from(path);
        }
        if let Some(val) = lookup(ENV_SEED) {
            let seed = val.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_SEED,
                value: val.clone(),
            })?;
            self.seed = Some(seed);
        }
        if let Some(val) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            let ms: u64 = val.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_REQUEST_TIMEOUT_MS,
                value: val.clone(),
            })?;
            self.request_timeout = Duration::from_millis(ms);
        }
        if let Some(val) = lookup(ENV_RATE_LIMITED_EXPECTED) {
            self.rate_limited_expected = val.to_lowercase() == "true" || val == "1";
        }
        Ok(())
    }

    /// Validated stage plan
    pub fn stage_plan(&self) -> Result<StagePlan, ConfigError> {
        Ok(StagePlan::new(self.stages.clone())?)
    }

    /// Reject anything that would make the run meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.stage_plan()?;
        self.validate_base_url()?;
        self.validate_endpoints()?;

        if self.think_time.min > self.think_time.max {
            return Err(ConfigError::ThinkTime {
                min: self.think_time.min,
                max: self.think_time.max,
            });
        }

        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("scheduler.adjust_interval", self.scheduler.adjust_interval),
            ("evaluation.poll_interval", self.evaluation.poll_interval),
            ("evaluation.window", self.evaluation.window),
            ("progress_interval", self.progress_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.evaluation.window_capacity == 0 {
            return Err(ConfigError::WindowCapacity);
        }

        if let Some(rule) = self.thresholds.iter().find(|r| !r.bound.is_finite()) {
            return Err(ConfigError::InvalidBound { rule: rule.label() });
        }

        match self.profile {
            AssessmentProfile::Soak { leak_ratio } if !(leak_ratio.is_finite() && leak_ratio >= 1.0) => {
                Err(ConfigError::LeakRatio(leak_ratio))
            }
            AssessmentProfile::Spike {
                excellent_below,
                degraded_below,
            } if !(0.0..=1.0).contains(&excellent_below)
                || !(0.0..=1.0).contains(&degraded_below)
                || excellent_below > degraded_below =>
            {
                Err(ConfigError::SpikeGrades)
            }
            _ => Ok(()),
        }
    }

    fn validate_base_url(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::BaseUrl {
            url: self.base_url.clone(),
            reason,
        };
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        Ok(())
    }

    fn validate_endpoints(&self) -> Result<(), ConfigError> {
        if let EndpointPolicy::Weighted { branches } = &self.endpoints {
            if branches.is_empty() {
                return Err(ConfigError::EmptyEndpoints);
            }
            if let Some(index) = branches
                .iter()
                .position(|b| !(b.weight.is_finite() && b.weight > 0.0) || b.paths.is_empty())
            {
                return Err(ConfigError::InvalidBranch { index });
            }
        }

        let paths = self.endpoints.paths();
        if paths.is_empty() {
            return Err(ConfigError::EmptyEndpoints);
        }
        if paths.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::EmptyPath);
        }
        Ok(())
    }
}
