//! Endpoint selection and think-time policies
//!
//! Both draw from the caller's random source so a fixed seed replays the
//! same sequence of choices.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One probabilistic branch of a weighted mix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedBranch {
    /// Relative weight, strictly positive
    pub weight: f64,
    /// Paths picked uniformly once this branch is chosen
    pub paths: Vec<String>,
}

/// How each iteration picks its endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EndpointPolicy {
    /// Heavy single-target load
    Fixed { path: String },
    /// Mixed traffic, uniform over the set
    Uniform { paths: Vec<String> },
    /// Skewed traffic, e.g. 80% light endpoints and 20% a heavy one
    Weighted { branches: Vec<WeightedBranch> },
}

impl EndpointPolicy {
    /// Every path the policy can produce
    pub fn paths(&self) -> Vec<&str> {
        match self {
            EndpointPolicy::Fixed { path } => vec![path.as_str()],
            EndpointPolicy::Uniform { paths } => paths.iter().map(String::as_str).collect(),
            EndpointPolicy::Weighted { branches } => branches
                .iter()
                .flat_map(|b| b.paths.iter().map(String::as_str))
                .collect(),
        }
    }
}

enum Compiled {
    Fixed(Arc<str>),
    Uniform(Vec<Arc<str>>),
    Weighted {
        /// Running sum of branch weights
        cumulative: Vec<f64>,
        branches: Vec<Vec<Arc<str>>>,
    },
}

/// Immutable selector shared by every virtual user of a run
pub struct EndpointSelector {
    compiled: Compiled,
}

fn intern(paths: &[String]) -> Vec<Arc<str>> {
    paths.iter().map(|p| Arc::from(p.as_str())).collect()
}

impl EndpointSelector {
    /// Build from a validated policy
    pub fn new(policy: &EndpointPolicy) -> Self {
        let compiled = match policy {
            EndpointPolicy::Fixed { path } => Compiled::Fixed(Arc::from(path.as_str())),
            EndpointPolicy::Uniform { paths } => Compiled::Uniform(intern(paths)),
            EndpointPolicy::Weighted { branches } => {
                let mut total = 0.0;
                let cumulative = branches
                    .iter()
                    .map(|b| {
                        total += b.weight;
                        total
                    })
                    .collect();
                Compiled::Weighted {
                    cumulative,
                    branches: branches.iter().map(|b| intern(&b.paths)).collect(),
                }
            }
        };
        Self { compiled }
    }

    fn pick_uniform<R: Rng + ?Sized>(paths: &[Arc<str>], rng: &mut R) -> Arc<str> {
        if paths.len() == 1 {
            return paths[0].clone();
        }
        paths[rng.random_range(0..paths.len())].clone()
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> Arc<str> {
        match &self.compiled {
            Compiled::Fixed(path) => path.clone(),
            Compiled::Uniform(paths) => Self::pick_uniform(paths, rng),
            Compiled::Weighted {
                cumulative,
                branches,
            } => {
                let total = cumulative.last().copied().unwrap_or(0.0);
                let roll = rng.random::<f64>() * total;
                let idx = cumulative
                    .iter()
                    .position(|edge| roll < *edge)
                    .unwrap_or(branches.len() - 1);
                Self::pick_uniform(&branches[idx], rng)
            }
        }
    }
}

/// Pause between iterations, fixed when `min == max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl ThinkTime {
    pub fn fixed(pause: Duration) -> Self {
        Self {
            min: pause,
            max: pause,
        }
    }

    pub fn between(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_nanos() as u64;
        let hi = self.max.as_nanos() as u64;
        Duration::from_nanos(rng.random_range(lo..=hi))
    }
}
