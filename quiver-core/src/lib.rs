//! Core shared library for the Quiver platform.
//!
//! This crate exposes reusable primitives that the services depend on:
//! common errors, configuration loading, the database pool, the durable
//! queue client, the cluster collaborator traits, the event sink and
//! logging setup.

pub mod cluster;
pub mod config;
pub mod db;
pub mod errors;
pub mod logging;
pub mod queue;
pub mod sink;

pub use errors::{QuiverError, Result as CoreResult};
pub use queue::{Delivery, DurableQueue, QueueSubscription};
pub use sink::{EventRecorder, EventSink};
