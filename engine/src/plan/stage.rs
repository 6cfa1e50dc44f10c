//! Stage definitions and the desired-concurrency curve
//!
//! Concurrency moves linearly from the previous stage's target (0 before the
//! first stage) to the current stage's target across the stage's duration.
//! Equal consecutive targets form a flat hold.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a plan
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("stage list is empty")]
    Empty,

    #[error("stage {index} has a zero duration")]
    ZeroDuration { index: usize },
}

/// A single stage: reach `target` virtual users over `duration`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Target concurrency at the end of the stage
    pub target: u32,
    /// Stage length, strictly positive
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl Stage {
    pub fn new(target: u32, duration: Duration) -> Self {
        Self { target, duration }
    }
}

/// Shape of a stage relative to its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    RampUp,
    RampDown,
    Hold,
}

/// Validated, immutable stage sequence
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<Stage>,
    /// Cumulative start offset of each stage
    starts: Vec<Duration>,
    total: Duration,
    peak: u32,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PlanError> {
        if stages.is_empty() {
            return Err(PlanError::Empty);
        }
        if let Some(index) = stages.iter().position(|s| s.duration.is_zero()) {
            return Err(PlanError::ZeroDuration { index });
        }

        let mut starts = Vec::with_capacity(stages.len());
        let mut total = Duration::ZERO;
        for stage in &stages {
            starts.push(total);
            total += stage.duration;
        }
        let peak = stages.iter().map(|s| s.target).max().unwrap_or(0);

        Ok(Self {
            stages,
            starts,
            total,
            peak,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target in the plan
    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn start_of(&self, index: usize) -> Duration {
        self.starts[index]
    }

    /// Target the stage at `index` starts from
    fn from_target(&self, index: usize) -> u32 {
        if index == 0 {
            0
        } else {
            self.stages[index - 1].target
        }
    }

    /// Index of the stage covering `elapsed`, `None` once the plan is over
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        if elapsed >= self.total {
            return None;
        }
        // starts is sorted; the covering stage is the last start <= elapsed
        let idx = self.starts.partition_point(|start| *start <= elapsed);
        Some(idx.saturating_sub(1))
    }

    /// Interpolated desired concurrency at `elapsed`
    pub fn desired_at(&self, elapsed: Duration) -> f64 {
        let Some(index) = self.stage_index_at(elapsed) else {
            return self.stages[self.stages.len() - 1].target as f64;
        };
        let stage = &self.stages[index];
        let from = self.from_target(index) as f64;
        let to = stage.target as f64;
        let progress =
            (elapsed - self.starts[index]).as_secs_f64() / stage.duration.as_secs_f64();
        from + (to - from) * progress.clamp(0.0, 1.0)
    }

    /// Desired concurrency rounded to a whole number of users
    pub fn desired_users_at(&self, elapsed: Duration) -> usize {
        self.desired_at(elapsed).round().max(0.0) as usize
    }

    pub fn kind(&self, index: usize) -> StageKind {
        let from = self.from_target(index);
        let to = self.stages[index].target;
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => StageKind::RampUp,
            std::cmp::Ordering::Less => StageKind::RampDown,
            std::cmp::Ordering::Equal => StageKind::Hold,
        }
    }

    /// A hold at the plan's peak with at least one user
    pub fn is_elevated_hold(&self, index: usize) -> bool {
        self.kind(index) == StageKind::Hold
            && self.stages[index].target == self.peak
            && self.peak > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ramp_hold_down() -> StagePlan {
        StagePlan::new(vec![
            Stage::new(10, secs(10)),
            Stage::new(10, secs(20)),
            Stage::new(0, secs(5)),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_plan() {
        assert_eq!(StagePlan::new(vec![]).unwrap_err(), PlanError::Empty);
    }

    #[test]
    fn test_rejects_zero_duration() {
        let err = StagePlan::new(vec![Stage::new(5, secs(1)), Stage::new(5, Duration::ZERO)])
            .unwrap_err();
        assert_eq!(err, PlanError::ZeroDuration { index: 1 });
    }

    #[test]
    fn test_first_stage_ramps_from_zero() {
        let plan = ramp_hold_down();
        assert_eq!(plan.desired_at(Duration::ZERO), 0.0);
        assert!((plan.desired_at(secs(5)) - 5.0).abs() < 1e-9);
        assert_eq!(plan.desired_users_at(Duration::from_millis(2_600)), 3);
    }

    #[test]
    fn test_hold_is_flat() {
        let plan = ramp_hold_down();
        for t in [10, 15, 29] {
            assert_eq!(plan.desired_users_at(secs(t)), 10);
        }
    }

    #[test]
    fn test_ramp_down_and_end() {
        let plan = ramp_hold_down();
        assert!((plan.desired_at(Duration::from_millis(32_500)) - 5.0).abs() < 1e-9);
        assert_eq!(plan.desired_users_at(secs(35)), 0);
        assert_eq!(plan.desired_users_at(secs(100)), 0);
        assert_eq!(plan.total_duration(), secs(35));
    }

    #[test]
    fn test_stage_index_boundaries() {
        let plan = ramp_hold_down();
        assert_eq!(plan.stage_index_at(Duration::ZERO), Some(0));
        assert_eq!(plan.stage_index_at(secs(10)), Some(1));
        assert_eq!(plan.stage_index_at(Duration::from_millis(29_999)), Some(1));
        assert_eq!(plan.stage_index_at(secs(30)), Some(2));
        assert_eq!(plan.stage_index_at(secs(35)), None);
    }

    #[test]
    fn test_stage_kinds() {
        let plan = StagePlan::new(vec![
            Stage::new(5, secs(5)),
            Stage::new(5, secs(5)),
            Stage::new(50, secs(1)),
            Stage::new(50, secs(5)),
            Stage::new(5, secs(1)),
        ])
        .unwrap();

        assert_eq!(plan.kind(0), StageKind::RampUp);
        assert_eq!(plan.kind(1), StageKind::Hold);
        assert_eq!(plan.kind(2), StageKind::RampUp);
        assert_eq!(plan.kind(4), StageKind::RampDown);
        assert!(!plan.is_elevated_hold(1));
        assert!(plan.is_elevated_hold(3));
        assert_eq!(plan.peak(), 50);
    }

    #[test]
    fn test_zero_target_stage_is_valid() {
        let plan = StagePlan::new(vec![Stage::new(0, secs(3))]).unwrap();
        assert_eq!(plan.desired_users_at(secs(1)), 0);
        assert_eq!(plan.kind(0), StageKind::Hold);
        assert!(!plan.is_elevated_hold(0));
    }
}
