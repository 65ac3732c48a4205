//! Wire formats shared by the Quiver invocation pipeline.
//!
//! Everything that crosses a process boundary is defined here: the queued
//! invocation envelope consumed by the asynchronous dispatcher, the
//! two-shaped event message published by both dispatchers, the optional
//! backend invoke envelope, and the reconstructed timeline view returned
//! by the read API.

pub mod event;
pub mod invocation;
pub mod invoke;
pub mod timeline;

pub use event::{is_error_status, EventKind, EventLog, EventMessage, TimelineLog};
pub use invocation::{InvocationRequest, QueuedInvocation};
pub use invoke::InvokeEnvelope;
pub use timeline::{Timeline, TimelineStep};

/// Topic carrying queued invocations for the asynchronous dispatcher.
pub const INVOCATIONS_TOPIC: &str = "quiver.invocations";

/// Topic carrying timeline/log event messages for the ingestion pipeline.
pub const EVENTS_TOPIC: &str = "quiver.events";
