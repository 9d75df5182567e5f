//! I/O-intensity-aware malleability decision service.
//!
//! A session consumes scheduling requests from a Redis stream, consults
//! the metric proxy for queue state, running jobs, historical profiles,
//! and modeled telemetry, and answers each request with a retain/modify
//! decision for the triggering job.

pub mod intensity;
pub mod proxy;
pub mod scheduler;
pub mod session;
