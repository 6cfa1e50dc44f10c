//! Per-run outcome store
//!
//! Appends happen from every virtual user concurrently. The lock guards only
//! the push (and the copy-out for a snapshot); percentile work always happens
//! after the lock is released so a virtual user never waits on it.
//!
//! Two read paths:
//! - `snapshot()` covers every outcome since the run started
//! - `window_snapshot()` covers a trailing window held in a bounded ring buffer

use super::outcome::{OutcomeClass, RequestOutcome};
use super::snapshot::{AggregateSnapshot, FinalSnapshot};
use crate::plan::StagePlan;
use metrics::{counter, histogram};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for the trailing window
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Trailing window length
    pub window: Duration,
    /// Maximum number of outcomes retained in the window
    pub window_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            window_capacity: 50_000,
        }
    }
}

#[derive(Default)]
struct AggregatorState {
    all: Vec<RequestOutcome>,
    recent: VecDeque<RequestOutcome>,
}

/// Thread-safe, append-only outcome aggregator
pub struct Aggregator {
    started: Instant,
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    /// Total recorded outcomes
    recorded: AtomicU64,
    /// Total recorded failures
    failed: AtomicU64,
}

impl Aggregator {
    /// Create an aggregator whose clock starts now
    pub fn new(config: AggregatorConfig) -> Self {
        Self::with_start(Instant::now(), config)
    }

    pub fn with_start(started: Instant, config: AggregatorConfig) -> Self {
        Self {
            started,
            config,
            state: Mutex::new(AggregatorState::default()),
            recorded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        // A panicking writer cannot leave a half-pushed outcome behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a completed request
    pub fn record(&self, outcome: RequestOutcome) {
        let class = outcome.class();
        counter!("surge_requests_total", "class" => class.as_str()).increment(1);
        histogram!("surge_request_latency_seconds").record(outcome.latency.as_secs_f64());

        self.recorded.fetch_add(1, Ordering::Relaxed);
        if class != OutcomeClass::Success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.lock();
        if state.recent.len() >= self.config.window_capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(outcome.clone());
        state.all.push(outcome);
    }

    /// Number of outcomes recorded so far
    pub fn count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Number of failed outcomes recorded so far
    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Copy of every outcome recorded so far
    pub fn outcomes(&self) -> Vec<RequestOutcome> {
        self.lock().all.clone()
    }

    /// Snapshot over the whole run so far
    pub fn snapshot(&self) -> AggregateSnapshot {
        let elapsed = self.elapsed();
        let outcomes = self.outcomes();
        AggregateSnapshot::from_outcomes(&outcomes, elapsed)
    }

    /// Snapshot over the trailing window
    pub fn window_snapshot(&self) -> AggregateSnapshot {
        let elapsed = self.elapsed();
        let span = elapsed.min(self.config.window);
        let cutoff = elapsed.saturating_sub(self.config.window);

        let recent: Vec<RequestOutcome> = {
            let mut state = self.lock();
            while state
                .recent
                .front()
                .is_some_and(|o| o.completed_at() < cutoff)
            {
                state.recent.pop_front();
            }
            state.recent.iter().cloned().collect()
        };

        AggregateSnapshot::from_outcomes(&recent, span)
    }

    /// Full-run snapshot with stage and endpoint breakdowns
    pub fn final_snapshot(&self, plan: &StagePlan, span: Duration) -> FinalSnapshot {
        let outcomes = self.outcomes();
        FinalSnapshot::build(&outcomes, span, plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outcome_at(aggregator: &Aggregator, status: Option<u16>, latency_ms: u64) -> RequestOutcome {
        let latency = Duration::from_millis(latency_ms);
        RequestOutcome {
            endpoint: Arc::from("/health"),
            status,
            latency,
            bytes: 64,
            sent_at: aggregator.elapsed().saturating_sub(latency),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_matches_full_run_when_covering_whole_run() {
        let aggregator = Aggregator::new(AggregatorConfig {
            window: Duration::from_secs(3600),
            window_capacity: 10_000,
        });

        for i in 0..200u64 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let status = if i % 7 == 0 { Some(500) } else { Some(200) };
            aggregator.record(outcome_at(&aggregator, status, 1 + i % 13));
        }

        assert_eq!(aggregator.snapshot(), aggregator.window_snapshot());
        assert_eq!(aggregator.count(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_drops_old_outcomes() {
        let aggregator = Aggregator::new(AggregatorConfig {
            window: Duration::from_secs(1),
            window_capacity: 10_000,
        });

        for _ in 0..10 {
            aggregator.record(outcome_at(&aggregator, Some(500), 1));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        for _ in 0..10 {
            aggregator.record(outcome_at(&aggregator, Some(200), 1));
        }

        let window = aggregator.window_snapshot();
        assert_eq!(window.count, 10);
        assert_eq!(window.error_rate, Some(0.0));
        assert_eq!(window.span_secs, 1.0);

        let full = aggregator.snapshot();
        assert_eq!(full.count, 20);
        assert_eq!(full.error_rate, Some(0.5));
        assert_eq!(aggregator.failures(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_capacity_is_bounded() {
        let aggregator = Aggregator::new(AggregatorConfig {
            window: Duration::from_secs(60),
            window_capacity: 5,
        });

        for _ in 0..20 {
            aggregator.record(outcome_at(&aggregator, Some(200), 1));
        }

        assert_eq!(aggregator.window_snapshot().count, 5);
        assert_eq!(aggregator.snapshot().count, 20);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..500 {
                    aggregator.record(outcome_at(&aggregator, Some(200), 1));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(aggregator.count(), 4_000);
        assert_eq!(aggregator.outcomes().len(), 4_000);
    }
}
