//! Stage scheduler
//!
//! Polls the stage plan every adjustment interval and converges the live
//! virtual-user population to the desired concurrency:
//! - spawns users while live < desired
//! - retires the most recently spawned users while live > desired
//!
//! Retired users finish their current iteration before exiting. At the end of
//! the plan (or on a global stop) every user is signalled and awaited for the
//! grace period; stragglers are aborted and their in-flight request is never
//! recorded.

use crate::driver::{UserContext, VirtualUser};
use crate::plan::StagePlan;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Scheduler timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the population is adjusted
    #[serde(with = "humantime_serde")]
    pub adjust_interval: Duration,
    /// How long stopped users get to finish their iteration
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            adjust_interval: Duration::from_millis(100),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// What happened to the population over the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSummary {
    /// False when a global stop cut the plan short
    pub completed_all_stages: bool,
    /// Elapsed time at which users were told to stop
    pub stopped_at: Duration,
    pub peak_concurrency: usize,
    pub users_spawned: u64,
    /// Users aborted after the grace period
    pub forced_terminations: usize,
}

struct ActiveUser {
    id: u64,
    stop: watch::Sender<bool>,
}

/// Owns every virtual user of a run
pub struct Scheduler {
    plan: Arc<StagePlan>,
    config: SchedulerConfig,
    ctx: Arc<UserContext>,
    seed: u64,
    stop: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
}

impl Scheduler {
    /// `stop` flips to true when the run must end early
    pub fn new(
        plan: Arc<StagePlan>,
        config: SchedulerConfig,
        ctx: Arc<UserContext>,
        seed: u64,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            plan,
            config,
            ctx,
            seed,
            stop,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gauge of users currently scheduled (not yet retired)
    pub fn live_users(&self) -> Arc<AtomicUsize> {
        self.live.clone()
    }

    pub async fn run(mut self) -> SchedulerSummary {
        let clock = self.ctx.aggregator.clone();
        let total = self.plan.total_duration();

        let mut active: Vec<ActiveUser> = Vec::new();
        let mut tasks: JoinSet<u64> = JoinSet::new();
        let mut next_id = 0u64;
        let mut peak = 0usize;
        let mut stop_open = true;

        let mut ticker = tokio::time::interval(self.config.adjust_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Scheduler starting: {} stages over {:?}, peak {} users",
            self.plan.len(),
            total,
            self.plan.peak()
        );

        let completed_all_stages = loop {
            if *self.stop.borrow() {
                break false;
            }
            let elapsed = clock.elapsed();
            if elapsed >= total {
                break true;
            }

            let desired = self.plan.desired_users_at(elapsed);
            while active.len() < desired {
                let (tx, rx) = watch::channel(false);
                let user = VirtualUser::new(next_id, self.ctx.clone(), self.seed, rx);
                tasks.spawn(user.run());
                debug!("Spawned virtual user {}", next_id);
                active.push(ActiveUser { id: next_id, stop: tx });
                next_id += 1;
            }
            while active.len() > desired {
                if let Some(user) = active.pop() {
                    // Receiver already gone means the user has exited
                    let _ = user.stop.send(true);
                    debug!("Retiring virtual user {}", user.id);
                }
            }
            peak = peak.max(active.len());
            self.publish(active.len());

            // Reap users that finished draining
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    warn!("Virtual user task failed: {}", e);
                }
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.stop.changed(), if stop_open => {
                    if changed.is_err() {
                        stop_open = false;
                    }
                }
            }
        };

        let stopped_at = clock.elapsed();
        if completed_all_stages {
            info!("All stages complete at {:?}, stopping users", stopped_at);
        } else {
            warn!("Global stop at {:?}, stopping users", stopped_at);
        }

        for user in active.drain(..) {
            let _ = user.stop.send(true);
        }
        self.publish(0);

        let forced_terminations = self.drain(&mut tasks).await;

        SchedulerSummary {
            completed_all_stages,
            stopped_at,
            peak_concurrency: peak,
            users_spawned: next_id,
            forced_terminations,
        }
    }

    fn publish(&self, live: usize) {
        self.live.store(live, Ordering::SeqCst);
        gauge!("surge_virtual_users_active").set(live as f64);
    }

    /// Await every user for the grace period, then abort the rest
    async fn drain(&self, tasks: &mut JoinSet<u64>) -> usize {
        let graceful = async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Virtual user task failed: {}", e);
                }
            }
        };

        if tokio::time::timeout(self.config.grace_period, graceful)
            .await
            .is_ok()
        {
            return 0;
        }

        let stragglers = tasks.len();
        warn!(
            "{} virtual users exceeded the {:?} grace period, aborting",
            stragglers, self.config.grace_period
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        stragglers
    }
}
