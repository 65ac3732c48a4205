//! Asynchronous invocation dispatcher.
//!
//! Consumes queued invocations from the durable queue and executes them
//! against live function instances with a bounded retry loop, emitting a
//! causally-ordered trail of timeline and log events along the way.

pub mod api;
pub mod attempt;
pub mod config;
pub mod controller;
pub mod runtime;
pub mod stats;

pub use attempt::{InvocationProcessor, RetryPolicy};
pub use config::DispatcherConfig;
pub use runtime::DispatchRuntime;
pub use stats::DispatcherStats;
