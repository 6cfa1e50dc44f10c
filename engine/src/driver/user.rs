//! Virtual user loop
//!
//! Each iteration selects an endpoint, issues exactly one GET, records the
//! outcome, then sleeps a think time. Stop requests are observed between
//! iterations and during think time, never while a request is in flight.

use super::selector::{EndpointSelector, ThinkTime};
use super::target::{Target, TransportError};
use crate::metrics::{Aggregator, RequestOutcome};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Immutable per-run state shared by every virtual user
pub struct UserContext {
    pub target: Arc<dyn Target>,
    pub selector: Arc<EndpointSelector>,
    pub think_time: ThinkTime,
    pub request_timeout: Duration,
    pub aggregator: Arc<Aggregator>,
}

/// Derive an independent stream for each user from the run seed
pub fn user_seed(run_seed: u64, user_id: u64) -> u64 {
    run_seed ^ user_id.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// A single simulated client
pub struct VirtualUser {
    id: u64,
    ctx: Arc<UserContext>,
    rng: ChaCha8Rng,
    stop: watch::Receiver<bool>,
}

impl VirtualUser {
    pub fn new(id: u64, ctx: Arc<UserContext>, run_seed: u64, stop: watch::Receiver<bool>) -> Self {
        Self {
            id,
            ctx,
            rng: ChaCha8Rng::seed_from_u64(user_seed(run_seed, id)),
            stop,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run iterations until stopped; returns the number completed
    pub async fn run(mut self) -> u64 {
        let mut iterations = 0u64;

        while !self.stop_requested() {
            self.iterate().await;
            iterations += 1;

            let pause = self.ctx.think_time.sample(&mut self.rng);
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = self.stop.changed() => {
                    // Sender dropped: the scheduler is gone
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Virtual user {} exiting after {} iterations", self.id, iterations);
        iterations
    }

    /// One select/request/record step
    pub async fn iterate(&mut self) -> RequestOutcome {
        let endpoint = self.ctx.selector.select(&mut self.rng);
        let outcome = issue_request(&self.ctx, endpoint).await;
        self.ctx.aggregator.record(outcome.clone());
        outcome
    }
}

async fn issue_request(ctx: &UserContext, endpoint: Arc<str>) -> RequestOutcome {
    let sent_at = ctx.aggregator.elapsed();
    let start = Instant::now();

    let result = match tokio::time::timeout(ctx.request_timeout, ctx.target.get(&endpoint)).await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(ctx.request_timeout)),
    };
    let latency = start.elapsed();

    let (status, bytes) = match result {
        Ok(resp) => (Some(resp.status), resp.bytes),
        Err(e) => {
            debug!("Transport failure on {}: {}", endpoint, e);
            (None, 0)
        }
    };

    RequestOutcome {
        endpoint,
        status,
        latency,
        bytes,
        sent_at,
    }
}
