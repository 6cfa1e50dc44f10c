//! Request outcome collection and aggregation
//!
//! This module provides:
//! - `RequestOutcome`, the immutable record of one request
//! - `Aggregator`, the per-run concurrency-safe outcome store
//! - `AggregateSnapshot` and `FinalSnapshot`, derived on demand

mod aggregator;
mod outcome;
mod snapshot;

pub use aggregator::{Aggregator, AggregatorConfig};
pub use outcome::{OutcomeClass, RequestOutcome};
pub use snapshot::{
    AggregateSnapshot, EndpointStats, FinalSnapshot, LatencySummary, StageStats, percentile,
};
