//! Run orchestration
//!
//! Wires one run together: aggregator, scheduler, threshold monitor and the
//! progress ticker. The scheduler's join handle is the run's completion
//! future; the monitor (or ctrl-c) ends it early through a shared stop signal.

use crate::assessment::assess;
use crate::config::{ConfigError, RunConfig};
use crate::driver::{EndpointSelector, HttpTarget, Target, TransportError, UserContext};
use crate::metrics::{AggregateSnapshot, Aggregator};
use crate::plan::StagePlan;
use crate::report::{RunReport, run_passed};
use crate::scheduler::Scheduler;
use crate::threshold::{ThresholdMonitor, evaluate};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors that prevent a run from producing a report
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] TransportError),

    #[error("scheduler task failed: {0}")]
    Scheduler(#[from] JoinError),
}

/// A single configured run
pub struct Engine {
    config: RunConfig,
    target: Option<Arc<dyn Target>>,
    handle_interrupt: bool,
}

impl Engine {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            target: None,
            handle_interrupt: true,
        }
    }

    /// Drive `target` instead of an HTTP client built from `base_url`
    pub fn with_target(mut self, target: Arc<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    /// Whether ctrl-c stops the run gracefully (default true)
    pub fn handle_interrupt(mut self, enabled: bool) -> Self {
        self.handle_interrupt = enabled;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the plan to completion (or abort) and build the report
    pub async fn run(self) -> Result<RunReport, EngineError> {
        let Engine {
            config,
            target,
            handle_interrupt,
        } = self;

        config.validate()?;
        let plan = Arc::new(config.stage_plan()?);
        let seed = config.seed.unwrap_or_else(rand::random);

        let target: Arc<dyn Target> = match target {
            Some(target) => target,
            None => Arc::new(HttpTarget::new(
                &config.base_url,
                config.request_timeout,
                (plan.peak() as usize).max(1),
            )?),
        };

        info!(
            "Starting run against {} (seed {}, {} stages, {:?})",
            config.base_url,
            seed,
            plan.len(),
            plan.total_duration()
        );

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let aggregator = Arc::new(Aggregator::new(config.evaluation.aggregator()));
        let ctx = Arc::new(UserContext {
            target,
            selector: Arc::new(EndpointSelector::new(&config.endpoints)),
            think_time: config.think_time,
            request_timeout: config.request_timeout,
            aggregator: aggregator.clone(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (done_tx, done_rx) = watch::channel(false);

        let scheduler = Scheduler::new(plan.clone(), config.scheduler, ctx, seed, stop_rx);
        let live = scheduler.live_users();
        let mut scheduler_task = tokio::spawn(scheduler.run());

        let monitor = ThresholdMonitor::new(
            &config.thresholds,
            aggregator.clone(),
            config.evaluation.monitor(),
            stop_tx.clone(),
        );
        let monitor_task = tokio::spawn(monitor.run(done_rx.clone()));
        let progress_task = tokio::spawn(report_progress(
            aggregator.clone(),
            plan.clone(),
            live,
            config.progress_interval,
            done_rx,
        ));

        let mut listen_for_interrupt = handle_interrupt;
        let summary = loop {
            tokio::select! {
                result = &mut scheduler_task => break result?,
                signal = tokio::signal::ctrl_c(), if listen_for_interrupt => {
                    listen_for_interrupt = false;
                    if signal.is_ok() {
                        warn!("Interrupted, stopping virtual users");
                        let _ = stop_tx.send(true);
                    }
                }
            }
        };

        let _ = done_tx.send(true);
        let aborted = monitor_task.await.ok().flatten();
        let _ = progress_task.await;

        let span = aggregator.elapsed();
        let final_snapshot = aggregator.final_snapshot(&plan, span);
        let thresholds = evaluate(&config.thresholds, &final_snapshot.overall);
        let assessment = assess(&config, &final_snapshot, &thresholds);
        let passed = run_passed(summary.completed_all_stages, aborted.as_ref(), &thresholds);

        for failed in thresholds.iter().filter(|t| !t.passed) {
            warn!(
                "Threshold {} not met ({:?}, observed {:?})",
                failed.rule, failed.verdict, failed.observed
            );
        }
        for warning in &assessment.warnings {
            warn!("{}", warning);
        }
        info!(
            "Run finished in {:.1}s: {} requests, peak {} users, {} ({})",
            span.as_secs_f64(),
            final_snapshot.overall.count,
            summary.peak_concurrency,
            if passed { "PASSED" } else { "FAILED" },
            assessment.narrative
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: span.as_secs_f64(),
            seed,
            config,
            completed_all_stages: summary.completed_all_stages,
            aborted,
            forced_terminations: summary.forced_terminations,
            peak_concurrency: summary.peak_concurrency,
            snapshot: final_snapshot.overall,
            stages: final_snapshot.stages,
            endpoints: final_snapshot.endpoints,
            thresholds,
            assessment,
            passed,
        })
    }
}

fn ms(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.1}ms", v))
}

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}%", v * 100.0))
}

fn progress_line(
    elapsed: Duration,
    desired: usize,
    live: usize,
    window: &AggregateSnapshot,
) -> String {
    format!(
        "[{:>7.1}s] users {}/{} | p95 {} | errors {} | {:.1} req/s",
        elapsed.as_secs_f64(),
        live,
        desired,
        ms(window.latency.as_ref().map(|l| l.p95_ms)),
        pct(window.error_rate),
        window.requests_per_sec.unwrap_or(0.0)
    )
}

/// Periodic human-readable progress until `done` flips
async fn report_progress(
    aggregator: Arc<Aggregator>,
    plan: Arc<StagePlan>,
    live: Arc<AtomicUsize>,
    every: Duration,
    mut done: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
        }

        let elapsed = aggregator.elapsed();
        let window = aggregator.window_snapshot();
        info!(
            "{}",
            progress_line(
                elapsed,
                plan.desired_users_at(elapsed),
                live.load(Ordering::Relaxed),
                &window
            )
        );
    }
}
