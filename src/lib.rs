//! Tollgate - Tiered Rate Limiting Service
//!
//! This crate implements a cost-based admission-control engine. Every request
//! category carries a point cost per time window (second, minute, hour, day),
//! and a request is admitted only while every window still has room for that
//! cost. Counters live in a shared key-value store (Redis in production) so
//! that all instances of the service enforce the same budget.

pub mod config;
pub mod error;
pub mod http;
pub mod monitor;
pub mod ratelimit;
pub mod store;
