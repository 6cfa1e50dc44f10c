//! Threshold rules and evaluation
//!
//! Rules are independent predicates over an `AggregateSnapshot`. During a run
//! the `ThresholdMonitor` checks abort-on-breach rules against the trailing
//! window at a fixed cadence and raises the global stop on the first breach.
//! Every rule is evaluated once more against the final full-run snapshot.

use crate::metrics::{AggregateSnapshot, Aggregator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Selector into an `AggregateSnapshot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ErrorRate,
    ErrorRateExcludingRateLimited,
    LatencyP50Ms,
    LatencyP95Ms,
    LatencyP99Ms,
    LatencyMaxMs,
    LatencyAvgMs,
    ThroughputBytesPerSec,
    RequestsPerSec,
    RequestCount,
}

impl Metric {
    /// `None` when the snapshot has no data for this metric
    pub fn read(&self, snapshot: &AggregateSnapshot) -> Option<f64> {
        let latency = snapshot.latency.as_ref();
        match self {
            Metric::ErrorRate => snapshot.error_rate,
            Metric::ErrorRateExcludingRateLimited => snapshot.error_rate_excluding_rate_limited,
            Metric::LatencyP50Ms => latency.map(|l| l.p50_ms),
            Metric::LatencyP95Ms => latency.map(|l| l.p95_ms),
            Metric::LatencyP99Ms => latency.map(|l| l.p99_ms),
            Metric::LatencyMaxMs => latency.map(|l| l.max_ms),
            Metric::LatencyAvgMs => latency.map(|l| l.avg_ms),
            Metric::ThroughputBytesPerSec => snapshot.throughput_bytes_per_sec,
            Metric::RequestsPerSec => snapshot.requests_per_sec,
            Metric::RequestCount => Some(snapshot.count as f64),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::ErrorRate => "error_rate",
            Metric::ErrorRateExcludingRateLimited => "error_rate_excluding_rate_limited",
            Metric::LatencyP50Ms => "latency_p50_ms",
            Metric::LatencyP95Ms => "latency_p95_ms",
            Metric::LatencyP99Ms => "latency_p99_ms",
            Metric::LatencyMaxMs => "latency_max_ms",
            Metric::LatencyAvgMs => "latency_avg_ms",
            Metric::ThroughputBytesPerSec => "throughput_bytes_per_sec",
            Metric::RequestsPerSec => "requests_per_sec",
            Metric::RequestCount => "request_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
}

impl Comparator {
    pub fn holds(&self, value: f64, bound: f64) -> bool {
        match self {
            Comparator::Lt => value < bound,
            Comparator::Le => value <= bound,
            Comparator::Gt => value > bound,
            Comparator::Ge => value >= bound,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

/// Whether a failed rule fails the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Hard,
    Soft,
}

/// A pass/fail predicate `metric comparator bound`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub metric: Metric,
    pub comparator: Comparator,
    pub bound: f64,
    /// Stop the run the moment the live window breaches
    #[serde(default)]
    pub abort_on_breach: bool,
    #[serde(default)]
    pub severity: Severity,
}

impl ThresholdRule {
    pub fn new(metric: Metric, comparator: Comparator, bound: f64) -> Self {
        Self {
            name: None,
            metric,
            comparator,
            bound,
            abort_on_breach: false,
            severity: Severity::Hard,
        }
    }

    pub fn aborting(mut self) -> Self {
        self.abort_on_breach = true;
        self
    }

    pub fn soft(mut self) -> Self {
        self.severity = Severity::Soft;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.to_string(),
        }
    }

    /// Aborting rules are always hard
    pub fn effective_severity(&self) -> Severity {
        if self.abort_on_breach {
            Severity::Hard
        } else {
            self.severity
        }
    }

    pub fn check(&self, snapshot: &AggregateSnapshot) -> (Option<f64>, Verdict) {
        match self.metric.read(snapshot) {
            None => (None, Verdict::NoData),
            Some(value) if self.comparator.holds(value, self.bound) => (Some(value), Verdict::Pass),
            Some(value) => (Some(value), Verdict::Fail),
        }
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.metric.name(),
            self.comparator.symbol(),
            self.bound
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// Metric undefined for the snapshot (e.g. no samples)
    NoData,
}

/// Final verdict for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub rule: String,
    pub metric: Metric,
    pub comparator: Comparator,
    pub bound: f64,
    pub abort_on_breach: bool,
    pub severity: Severity,
    pub observed: Option<f64>,
    pub verdict: Verdict,
    /// `no_data` counts as not passed
    pub passed: bool,
}

/// Evaluate every rule against `snapshot`
pub fn evaluate(rules: &[ThresholdRule], snapshot: &AggregateSnapshot) -> Vec<ThresholdOutcome> {
    rules
        .iter()
        .map(|rule| {
            let (observed, verdict) = rule.check(snapshot);
            ThresholdOutcome {
                rule: rule.label(),
                metric: rule.metric,
                comparator: rule.comparator,
                bound: rule.bound,
                abort_on_breach: rule.abort_on_breach,
                severity: rule.effective_severity(),
                observed,
                verdict,
                passed: verdict == Verdict::Pass,
            }
        })
        .collect()
}

/// An abort-on-breach rule tripped during the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub rule: String,
    pub metric: Metric,
    pub observed: f64,
    pub bound: f64,
    /// Run time at which the breach was observed
    pub elapsed_secs: f64,
    /// Samples in the trailing window at that moment
    pub window_samples: u64,
}

/// Live evaluation cadence
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Window samples required before a breach can be declared
    pub min_window_samples: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            min_window_samples: 10,
        }
    }
}

/// Polls the trailing window and raises the global stop on a breach
pub struct ThresholdMonitor {
    rules: Vec<ThresholdRule>,
    aggregator: Arc<Aggregator>,
    config: MonitorConfig,
    stop: Arc<watch::Sender<bool>>,
}

impl ThresholdMonitor {
    /// Only abort-on-breach rules are watched live
    pub fn new(
        rules: &[ThresholdRule],
        aggregator: Arc<Aggregator>,
        config: MonitorConfig,
        stop: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            rules: rules.iter().filter(|r| r.abort_on_breach).cloned().collect(),
            aggregator,
            config,
            stop,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.rules.is_empty()
    }

    /// First abort rule breached by the current window, if any
    pub fn check_once(&self) -> Option<Breach> {
        let window = self.aggregator.window_snapshot();
        if window.count < self.config.min_window_samples {
            return None;
        }

        self.rules.iter().find_map(|rule| match rule.check(&window) {
            (Some(observed), Verdict::Fail) => Some(Breach {
                rule: rule.label(),
                metric: rule.metric,
                observed,
                bound: rule.bound,
                elapsed_secs: self.aggregator.elapsed().as_secs_f64(),
                window_samples: window.count,
            }),
            _ => None,
        })
    }

    /// Poll until `done` flips or a breach stops the run
    pub async fn run(self, mut done: watch::Receiver<bool>) -> Option<Breach> {
        if self.is_idle() {
            return None;
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately, with nothing to look at yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        debug!("Threshold monitor finished without breach");
                        return None;
                    }
                }
            }

            if let Some(breach) = self.check_once() {
                warn!(
                    "Threshold breached at {:.1}s: {} (observed {:.4})",
                    breach.elapsed_secs, breach.rule, breach.observed
                );
                let _ = self.stop.send(true);
                return Some(breach);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{AggregatorConfig, RequestOutcome};

    fn snapshot_with(statuses: &[Option<u16>], latency_ms: u64) -> AggregateSnapshot {
        let outcomes: Vec<RequestOutcome> = statuses
            .iter()
            .map(|status| RequestOutcome {
                endpoint: Arc::from("/health"),
                status: *status,
                latency: Duration::from_millis(latency_ms),
                bytes: 10,
                sent_at: Duration::ZERO,
            })
            .collect();
        AggregateSnapshot::from_outcomes(&outcomes, Duration::from_secs(1))
    }

    #[test]
    fn test_less_than_is_exact() {
        let rule = ThresholdRule::new(Metric::LatencyMaxMs, Comparator::Lt, 100.0);
        for latency in [1, 50, 99, 100, 101, 500] {
            let snapshot = snapshot_with(&[Some(200)], latency);
            let (observed, verdict) = rule.check(&snapshot);
            let value = observed.unwrap();
            if value >= 100.0 {
                assert_eq!(verdict, Verdict::Fail, "latency {latency}");
            } else {
                assert_eq!(verdict, Verdict::Pass, "latency {latency}");
            }
        }
    }

    #[test]
    fn test_comparators() {
        assert!(Comparator::Lt.holds(0.5, 1.0));
        assert!(!Comparator::Lt.holds(1.0, 1.0));
        assert!(Comparator::Le.holds(1.0, 1.0));
        assert!(Comparator::Gt.holds(2.0, 1.0));
        assert!(!Comparator::Gt.holds(1.0, 1.0));
        assert!(Comparator::Ge.holds(1.0, 1.0));
    }

    #[test]
    fn test_no_data_is_not_a_pass() {
        let rules = vec![ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.01)];
        let outcomes = evaluate(&rules, &AggregateSnapshot::empty(Duration::from_secs(1)));
        assert_eq!(outcomes[0].verdict, Verdict::NoData);
        assert!(!outcomes[0].passed);
    }

    #[test]
    fn test_evaluate_reports_each_rule() {
        let snapshot = snapshot_with(&[Some(200), Some(200), Some(429), Some(500)], 20);
        let rules = vec![
            ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.25).named("errors"),
            ThresholdRule::new(Metric::ErrorRateExcludingRateLimited, Comparator::Le, 0.25),
            ThresholdRule::new(Metric::LatencyP95Ms, Comparator::Lt, 50.0).soft(),
        ];

        let outcomes = evaluate(&rules, &snapshot);

        assert_eq!(outcomes[0].rule, "errors");
        assert_eq!(outcomes[0].observed, Some(0.5));
        assert!(!outcomes[0].passed);
        assert_eq!(outcomes[1].rule, "error_rate_excluding_rate_limited <= 0.25");
        assert!(outcomes[1].passed);
        assert!(outcomes[2].passed);
        assert_eq!(outcomes[2].severity, Severity::Soft);
    }

    #[test]
    fn test_aborting_rules_are_hard() {
        let rule = ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.1)
            .soft()
            .aborting();
        assert_eq!(rule.effective_severity(), Severity::Hard);
    }

    #[test]
    fn test_rule_deserializes_with_symbols() {
        let json = r#"{"metric":"latency_p95_ms","comparator":"<","bound":500,"abort_on_breach":true}"#;
        let rule: ThresholdRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.comparator, Comparator::Lt);
        assert_eq!(rule.severity, Severity::Hard);
        assert!(rule.abort_on_breach);
    }

    fn record(aggregator: &Aggregator, status: u16) {
        aggregator.record(RequestOutcome {
            endpoint: Arc::from("/health"),
            status: Some(status),
            latency: Duration::from_millis(1),
            bytes: 10,
            sent_at: aggregator.elapsed(),
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_waits_for_min_samples() {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()));
        let (stop_tx, _stop_rx) = watch::channel(false);
        let rules = vec![ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.25).aborting()];
        let monitor = ThresholdMonitor::new(
            &rules,
            aggregator.clone(),
            MonitorConfig::default(),
            Arc::new(stop_tx),
        );

        for _ in 0..5 {
            record(&aggregator, 500);
        }
        assert!(monitor.check_once().is_none());

        for _ in 0..5 {
            record(&aggregator, 500);
        }
        let breach = monitor.check_once().unwrap();
        assert_eq!(breach.observed, 1.0);
        assert_eq!(breach.window_samples, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_raises_stop_on_breach() {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (_done_tx, done_rx) = watch::channel(false);
        let rules = vec![
            ThresholdRule::new(Metric::LatencyP99Ms, Comparator::Lt, 1_000.0),
            ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.25).aborting(),
        ];
        let monitor = ThresholdMonitor::new(
            &rules,
            aggregator.clone(),
            MonitorConfig::default(),
            Arc::new(stop_tx),
        );
        let handle = tokio::spawn(monitor.run(done_rx));

        for i in 0..40 {
            record(&aggregator, if i % 2 == 0 { 500 } else { 200 });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let breach = handle.await.unwrap().expect("breach expected");
        assert_eq!(breach.rule, "error_rate < 0.25");
        assert!(breach.elapsed_secs <= 2.0);
        assert!(*stop_rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_without_abort_rules_is_idle() {
        let aggregator = Arc::new(Aggregator::new(AggregatorConfig::default()));
        let (stop_tx, _stop_rx) = watch::channel(false);
        let (_done_tx, done_rx) = watch::channel(false);
        let rules = vec![ThresholdRule::new(Metric::ErrorRate, Comparator::Lt, 0.25)];
        let monitor =
            ThresholdMonitor::new(&rules, aggregator, MonitorConfig::default(), Arc::new(stop_tx));

        assert!(monitor.is_idle());
        assert_eq!(monitor.run(done_rx).await, None);
    }
}
