//! Shared observability plumbing: tracing initialization, the global metrics
//! registries and the HTTP endpoint that exposes them together with a
//! liveness probe.

pub mod metrics;
pub mod panic_hook;
pub mod tracing;
