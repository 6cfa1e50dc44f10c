//! Request driver module
//!
//! This module provides:
//! - `Target` trait for abstracting the system under load
//! - `HttpTarget`, the reqwest-backed implementation
//! - `EndpointSelector` and `ThinkTime` for per-iteration choices
//! - `VirtualUser`, the select/request/record/sleep loop

mod selector;
mod target;
mod user;

pub use selector::{EndpointPolicy, EndpointSelector, ThinkTime, WeightedBranch};
pub use target::{HttpTarget, Target, TargetResponse, TransportError};
pub use user::{UserContext, VirtualUser, user_seed};
