//! evobridge: client bridge for long-lived evolution-engine workers.
//!
//! The worker is a separate OS process speaking newline-delimited JSON-RPC
//! over its standard streams. [`BridgeClient`] owns the worker's lifecycle,
//! correlates out-of-order responses to requests, multiplexes event
//! notifications, enforces per-request timeouts, and keeps latency/error
//! metrics. The [`worker`] module carries the child half of the protocol
//! for workers implemented in Rust.

mod api;
mod client;
mod config;
mod error;
mod events;
mod metrics;
mod supervisor;
mod tracker;

pub mod bridge;
pub mod worker;

pub use api::{HandshakeInfo, HealthReport, ToolOutcome, ToolSpec};
pub use bridge::protocol::{PROTOCOL_VERSION, Request, RequestId};
pub use client::{BridgeClient, BridgeState, BridgeStatus};
pub use config::BridgeConfig;
pub use error::{BridgeError, DecodeError, StartError};
pub use events::{EventBus, EventName, Subscription};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use supervisor::{
    CommandSpawner, ExitNotice, ProcessSupervisor, SpawnError, WorkerCommand, WorkerSpawner,
};
pub use tracker::RequestTracker;
