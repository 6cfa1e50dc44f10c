//! Common Test Utilities for Integration Tests
//!
//! In-process scripted targets, a real axum stub server and plan builders.

use async_trait::async_trait;
use axum::{Json, Router, http::StatusCode, routing::get};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use surge::driver::{EndpointPolicy, ThinkTime};
use surge::plan::Stage;
use surge::{Engine, RunConfig, RunReport, Target, TargetResponse, TransportError};

type StatusFn = Box<dyn Fn(u64, &str) -> u16 + Send + Sync>;

/// Target with a fixed latency and a scripted status per call
pub struct ScriptedTarget {
    latency: Duration,
    status: StatusFn,
    /// Answer 429 while more than this many requests are in flight
    concurrency_limit: Option<usize>,
    in_flight: AtomicUsize,
    calls: AtomicU64,
}

impl ScriptedTarget {
    pub fn ok(latency: Duration) -> Self {
        Self::with_status(latency, |_, _| 200)
    }

    pub fn with_status(
        latency: Duration,
        status: impl Fn(u64, &str) -> u16 + Send + Sync + 'static,
    ) -> Self {
        Self {
            latency,
            status: Box::new(status),
            concurrency_limit: None,
            in_flight: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
        }
    }

    pub fn rate_limited_above(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Target for ScriptedTarget {
    async fn get(&self, path: &str) -> Result<TargetResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = match self.concurrency_limit {
            Some(limit) if in_flight > limit => 429,
            _ => (self.status)(n, path),
        };
        Ok(TargetResponse { status, bytes: 256 })
    }
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

pub fn millis(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Plan hitting `/health` with a fixed seed and default settings
pub fn run_config(stages: Vec<Stage>, think_time: ThinkTime) -> RunConfig {
    RunConfig {
        stages,
        endpoints: EndpointPolicy::Fixed {
            path: "/health".to_string(),
        },
        think_time,
        seed: Some(7),
        ..RunConfig::default()
    }
}

/// Run `config` against an in-process target
pub async fn run_against(config: RunConfig, target: Arc<ScriptedTarget>) -> RunReport {
    Engine::new(config)
        .with_target(target)
        .handle_interrupt(false)
        .run()
        .await
        .expect("run should produce a report")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatsResponse {
    threat_actors: u32,
    campaigns: u32,
}

async fn stats() -> Json<StatsResponse> {
    Json(StatsResponse {
        threat_actors: 42,
        campaigns: 7,
    })
}

/// Serve a small API on an ephemeral local port
pub async fn spawn_stub_server() -> SocketAddr {
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/limited", get(|| async { StatusCode::TOO_MANY_REQUESTS }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("stub server address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });
    addr
}
