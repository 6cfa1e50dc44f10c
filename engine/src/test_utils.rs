//! Test Utilities Module
//!
//! In-process stub targets and context builders for unit tests.
//! This module is only compiled when running tests.

#![cfg(test)]

use crate::driver::{
    EndpointPolicy, EndpointSelector, Target, TargetResponse, ThinkTime, TransportError,
    UserContext,
};
use crate::metrics::{Aggregator, AggregatorConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type StatusFn = Box<dyn Fn(u64, &str) -> u16 + Send + Sync>;

/// Target that sleeps a fixed latency and answers with a computed status
pub struct StubTarget {
    latency: Duration,
    bytes: u64,
    status: StatusFn,
    calls: AtomicU64,
}

impl StubTarget {
    pub fn fixed(status: u16, latency: Duration) -> Self {
        Self::with_status(latency, move |_, _| status)
    }

    /// `status` receives the call number and the requested path
    pub fn with_status(
        latency: Duration,
        status: impl Fn(u64, &str) -> u16 + Send + Sync + 'static,
    ) -> Self {
        Self {
            latency,
            bytes: 512,
            status: Box::new(status),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Target for StubTarget {
    async fn get(&self, path: &str) -> Result<TargetResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        Ok(TargetResponse {
            status: (self.status)(n, path),
            bytes: self.bytes,
        })
    }
}

/// Context hitting `/health` on `target` with a fresh aggregator
pub fn user_context(target: Arc<dyn Target>, think_time: ThinkTime) -> Arc<UserContext> {
    Arc::new(UserContext {
        target,
        selector: Arc::new(EndpointSelector::new(&EndpointPolicy::Fixed {
            path: "/health".to_string(),
        })),
        think_time,
        request_timeout: Duration::from_secs(60),
        aggregator: Arc::new(Aggregator::new(AggregatorConfig::default())),
    })
}
