//! Derived metrics over a set of request outcomes
//!
//! Snapshots are pure functions of the outcomes they are built from. The
//! percentile estimator is rounded-rank: sort ascending and take index
//! `round(p / 100 * (n - 1))`. Empty inputs yield `None` rather than zero.

use super::outcome::{OutcomeClass, RequestOutcome};
use crate::plan::{StageKind, StagePlan};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Calculate percentile (0-100) over an ascending slice
pub fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }

    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

fn to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ratio(part: u64, total: u64) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(part as f64 / total as f64)
    }
}

/// Latency distribution in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
}

impl LatencySummary {
    /// Sorts `latencies` in place
    pub fn from_latencies(latencies: &mut [Duration]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();

        let total: Duration = latencies.iter().sum();
        let avg = total.as_secs_f64() * 1000.0 / latencies.len() as f64;

        Some(Self {
            p50_ms: to_ms(percentile(latencies, 50.0)?),
            p95_ms: to_ms(percentile(latencies, 95.0)?),
            p99_ms: to_ms(percentile(latencies, 99.0)?),
            max_ms: to_ms(*latencies.last()?),
            avg_ms: avg,
        })
    }
}

/// Aggregate view over a set of outcomes and the wall-clock span they cover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub transport_failures: u64,
    pub rate_limited: u64,
    pub http_failures: u64,
    /// Failures (including 429) over count
    pub error_rate: Option<f64>,
    /// Failures with 429 treated as non-failing, over count
    pub error_rate_excluding_rate_limited: Option<f64>,
    pub latency: Option<LatencySummary>,
    pub bytes_received: u64,
    pub throughput_bytes_per_sec: Option<f64>,
    pub requests_per_sec: Option<f64>,
    pub span_secs: f64,
}

impl AggregateSnapshot {
    pub fn empty(span: Duration) -> Self {
        Self::from_outcomes(&[], span)
    }

    pub fn from_outcomes(outcomes: &[RequestOutcome], span: Duration) -> Self {
        let mut successes = 0;
        let mut transport_failures = 0;
        let mut rate_limited = 0;
        let mut http_failures = 0;
        let mut bytes_received = 0;
        let mut latencies = Vec::with_capacity(outcomes.len());

        for outcome in outcomes {
            match outcome.class() {
                OutcomeClass::Success => successes += 1,
                OutcomeClass::RateLimited => rate_limited += 1,
                OutcomeClass::HttpError => http_failures += 1,
                OutcomeClass::TransportError => transport_failures += 1,
            }
            bytes_received += outcome.bytes;
            latencies.push(outcome.latency);
        }

        let count = outcomes.len() as u64;
        let failures = transport_failures + rate_limited + http_failures;
        let span_secs = span.as_secs_f64();
        let per_sec = |value: u64| {
            if span_secs > 0.0 {
                Some(value as f64 / span_secs)
            } else {
                None
            }
        };

        Self {
            count,
            successes,
            failures,
            transport_failures,
            rate_limited,
            http_failures,
            error_rate: ratio(failures, count),
            error_rate_excluding_rate_limited: ratio(failures - rate_limited, count),
            latency: LatencySummary::from_latencies(&mut latencies),
            bytes_received,
            throughput_bytes_per_sec: per_sec(bytes_received),
            requests_per_sec: per_sec(count),
            span_secs,
        }
    }
}

/// Outcome counts for the requests sent during one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub index: usize,
    pub target: u32,
    pub kind: StageKind,
    pub elevated: bool,
    pub requests: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub error_rate: Option<f64>,
}

/// Per-endpoint breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub requests: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub error_rate: Option<f64>,
    pub latency: Option<LatencySummary>,
}

/// Full-run snapshot plus stage and endpoint breakdowns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSnapshot {
    pub overall: AggregateSnapshot,
    pub stages: Vec<StageStats>,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

impl FinalSnapshot {
    pub fn build(outcomes: &[RequestOutcome], span: Duration, plan: &StagePlan) -> Self {
        let overall = AggregateSnapshot::from_outcomes(outcomes, span);

        let mut stages: Vec<StageStats> = plan
            .stages()
            .iter()
            .enumerate()
            .map(|(index, stage)| StageStats {
                index,
                target: stage.target,
                kind: plan.kind(index),
                elevated: plan.is_elevated_hold(index),
                requests: 0,
                failures: 0,
                rate_limited: 0,
                error_rate: None,
            })
            .collect();

        let mut per_endpoint: BTreeMap<String, (u64, u64, u64, Vec<Duration>)> = BTreeMap::new();

        for outcome in outcomes {
            let class = outcome.class();
            // Requests sent in the final adjustment tick belong to the last stage
            let index = plan
                .stage_index_at(outcome.sent_at)
                .unwrap_or(plan.len() - 1);
            let stage = &mut stages[index];
            stage.requests += 1;
            if class.is_failure() {
                stage.failures += 1;
            }
            if class == OutcomeClass::RateLimited {
                stage.rate_limited += 1;
            }

            let entry = per_endpoint
                .entry(outcome.endpoint.to_string())
                .or_insert_with(|| (0, 0, 0, Vec::new()));
            entry.0 += 1;
            if class.is_failure() {
                entry.1 += 1;
            }
            if class == OutcomeClass::RateLimited {
                entry.2 += 1;
            }
            entry.3.push(outcome.latency);
        }

        for stage in &mut stages {
            stage.error_rate = ratio(stage.failures, stage.requests);
        }

        let endpoints = per_endpoint
            .into_iter()
            .map(|(path, (requests, failures, rate_limited, mut latencies))| {
                let stats = EndpointStats {
                    requests,
                    failures,
                    rate_limited,
                    error_rate: ratio(failures, requests),
                    latency: LatencySummary::from_latencies(&mut latencies),
                };
                (path, stats)
            })
            .collect();

        Self {
            overall,
            stages,
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Stage;
    use std::sync::Arc;

    fn outcome(endpoint: &str, status: Option<u16>, latency_ms: u64, sent_ms: u64) -> RequestOutcome {
        RequestOutcome {
            endpoint: Arc::from(endpoint),
            status,
            latency: Duration::from_millis(latency_ms),
            bytes: 100,
            sent_at: Duration::from_millis(sent_ms),
        }
    }

    #[test]
    fn test_percentile_rounded_rank() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(Duration::from_millis(51)));
        assert_eq!(percentile(&sorted, 95.0), Some(Duration::from_millis(95)));
        assert_eq!(percentile(&sorted, 99.0), Some(Duration::from_millis(99)));
        assert_eq!(percentile(&sorted, 100.0), Some(Duration::from_millis(100)));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_percentile_single_sample() {
        let sorted = [Duration::from_millis(7)];
        assert_eq!(percentile(&sorted, 0.0), Some(Duration::from_millis(7)));
        assert_eq!(percentile(&sorted, 99.0), Some(Duration::from_millis(7)));
    }

    #[test]
    fn test_empty_snapshot_has_no_data() {
        let snapshot = AggregateSnapshot::empty(Duration::from_secs(1));
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.error_rate, None);
        assert_eq!(snapshot.latency, None);
        assert_eq!(snapshot.throughput_bytes_per_sec, Some(0.0));
    }

    #[test]
    fn test_zero_span_has_no_throughput() {
        let snapshot = AggregateSnapshot::from_outcomes(
            &[outcome("/health", Some(200), 10, 0)],
            Duration::ZERO,
        );
        assert_eq!(snapshot.throughput_bytes_per_sec, None);
        assert_eq!(snapshot.requests_per_sec, None);
    }

    #[test]
    fn test_error_accounting() {
        let outcomes = vec![
            outcome("/a", Some(200), 10, 0),
            outcome("/a", Some(429), 10, 0),
            outcome("/a", Some(500), 10, 0),
            outcome("/a", None, 10, 0),
        ];
        let snapshot = AggregateSnapshot::from_outcomes(&outcomes, Duration::from_secs(2));

        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.failures, 3);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.transport_failures, 1);
        assert_eq!(snapshot.error_rate, Some(0.75));
        assert_eq!(snapshot.error_rate_excluding_rate_limited, Some(0.5));
        assert_eq!(snapshot.throughput_bytes_per_sec, Some(200.0));
        assert_eq!(snapshot.requests_per_sec, Some(2.0));
    }

    #[test]
    fn test_latency_summary() {
        let outcomes: Vec<_> = (1..=10)
            .map(|i| outcome("/a", Some(200), i * 10, 0))
            .collect();
        let snapshot = AggregateSnapshot::from_outcomes(&outcomes, Duration::from_secs(1));
        let latency = snapshot.latency.unwrap();

        assert_eq!(latency.max_ms, 100.0);
        assert!((latency.avg_ms - 55.0).abs() < 1e-9);
        // index round(0.5 * 9) = 5 (round half away from zero)
        assert_eq!(latency.p50_ms, 60.0);
    }

    #[test]
    fn test_final_snapshot_breakdowns() {
        let plan = StagePlan::new(vec![
            Stage::new(10, Duration::from_secs(1)),
            Stage::new(10, Duration::from_secs(1)),
        ])
        .unwrap();
        let outcomes = vec![
            outcome("/health", Some(200), 5, 100),
            outcome("/stats", Some(500), 5, 1_500),
            outcome("/stats", Some(200), 5, 1_600),
            // Sent after the plan ended, attributed to the last stage
            outcome("/health", Some(200), 5, 2_050),
        ];

        let snapshot = FinalSnapshot::build(&outcomes, Duration::from_secs(2), &plan);

        assert_eq!(snapshot.stages[0].requests, 1);
        assert_eq!(snapshot.stages[1].requests, 3);
        assert_eq!(snapshot.stages[1].failures, 1);
        assert!(snapshot.stages[1].elevated);
        assert_eq!(snapshot.endpoints["/stats"].requests, 2);
        assert_eq!(snapshot.endpoints["/stats"].error_rate, Some(0.5));
        assert_eq!(snapshot.endpoints["/health"].failures, 0);
    }
}
