//! TCP relay core.
//!
//! This module provides:
//! - Listener management with a bounded accept loop
//! - Per-connection bridging to a fixed destination
//! - Classification of IO failures into expected teardown vs faults
//! - An observer seam for lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Bridge -> dial -> Destination
//!                          |
//!             client->dest  +  dest->client (concurrent, half-close on finish)
//!                          |
//!                 Observer <- ConnectionSummary
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use relay::{start, ListenerConfig, ListenerSpec, TracingObserver};
//!
//! let observer = Arc::new(TracingObserver::new("egress-1"));
//! let spec = ListenerSpec::new(8080, "10.0.0.5", 443, "HTTPS");
//! start(spec, ListenerConfig::new(), observer).await?;
//! ```

mod bridge;
mod classify;
mod listener;
mod observer;

pub use bridge::{
    Bridge, BridgeOutcome, Connection, ConnectionSummary, CopyOutcome, Destination, Direction,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_HALF_CLOSE_TIMEOUT,
};
pub use classify::{ClassifiedError, Classifier, ErrorClass, Matcher, Signature};
pub use listener::{
    serve, start, Accept, Listener, ListenerConfig, ListenerSpec, ListenerStats,
    DEFAULT_ACCEPT_ERROR_BACKOFF, DEFAULT_MAX_CONNECTIONS, MAX_CONNECTIONS_LIMIT,
};
pub use observer::{
    MemoryObserver, NoopObserver, Observer, RelayEvent, SharedObserver, TracingObserver,
};
