//! Lifecycle observer.
//!
//! Listeners and bridges never log directly. They emit [`RelayEvent`]s into
//! an [`Observer`], which is shared by every listener and connection in the
//! process and must tolerate concurrent calls.
//!
//! Implementations:
//! - [`TracingObserver`]: structured logs via `tracing` (production)
//! - [`MemoryObserver`]: records events in memory (tests)
//! - [`NoopObserver`]: discards everything

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use super::bridge::{Connection, ConnectionSummary, CopyOutcome};
use super::classify::ClassifiedError;

/// A lifecycle event emitted by the relay core.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// A listener is bound and about to accept.
    ListenerStarted {
        protocol_label: String,
        local_addr: SocketAddr,
        destination: String,
    },
    /// A listener could not bind its port and has stopped.
    BindFailed {
        protocol_label: String,
        addr: SocketAddr,
        error: String,
    },
    /// A listener task ended; `error` is set unless it exited cleanly.
    ListenerStopped {
        protocol_label: String,
        error: Option<String>,
    },
    /// A single accept call failed; the loop continues.
    AcceptFailed {
        protocol_label: String,
        error: ClassifiedError,
    },
    /// An accepted socket was closed because the listener is at capacity.
    ConnectionRejected {
        protocol_label: String,
        peer_addr: SocketAddr,
        max_connections: usize,
    },
    /// A client connection was accepted and handed to a bridge.
    ConnectionOpened(Connection),
    /// The destination dial succeeded.
    DestinationConnected {
        connection_id: u64,
        destination_addr: SocketAddr,
    },
    /// The destination dial failed; the client was closed.
    DialFailed {
        connection: Connection,
        error: ClassifiedError,
    },
    /// One copy direction finished.
    CopyFinished {
        connection_id: u64,
        outcome: CopyOutcome,
    },
    /// Terminal event for a connection.
    ConnectionClosed(ConnectionSummary),
}

/// Sink for relay lifecycle events.
pub trait Observer: Send + Sync {
    fn emit(&self, event: RelayEvent);
}

/// Observer handle shared across listeners and connections.
pub type SharedObserver = Arc<dyn Observer>;

/// Observer that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn emit(&self, _event: RelayEvent) {}
}

/// Observer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<RelayEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RelayEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of all events in emission order.
    pub fn events(&self) -> Vec<RelayEvent> {
        self.lock().clone()
    }

    /// Number of events recorded so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Terminal summaries recorded so far.
    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                RelayEvent::ConnectionClosed(summary) => Some(summary.clone()),
                _ => None,
            })
            .collect()
    }

    /// Count events matching a predicate.
    pub fn count(&self, predicate: impl Fn(&RelayEvent) -> bool) -> usize {
        self.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl Observer for MemoryObserver {
    fn emit(&self, event: RelayEvent) {
        self.lock().push(event);
    }
}

/// Observer that writes structured logs.
///
/// Copy errors classified as peer-closed are logged at debug level only.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    server_name: String,
}

impl TracingObserver {
    /// Create an observer tagging every record with the process identity.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
        }
    }
}

impl Observer for TracingObserver {
    fn emit(&self, event: RelayEvent) {
        let server = self.server_name.as_str();

        match event {
            RelayEvent::ListenerStarted {
                protocol_label,
                local_addr,
                destination,
            } => {
                info!(
                    server,
                    protocol = %protocol_label,
                    bind_addr = %local_addr,
                    destination = %destination,
                    "Listener ready"
                );
            }
            RelayEvent::BindFailed {
                protocol_label,
                addr,
                error,
            } => {
                error!(
                    server,
                    protocol = %protocol_label,
                    bind_addr = %addr,
                    error = %error,
                    "Failed to bind listener"
                );
            }
            RelayEvent::ListenerStopped {
                protocol_label,
                error: Some(error),
            } => {
                error!(
                    server,
                    protocol = %protocol_label,
                    error = %error,
                    "Listener stopped"
                );
            }
            RelayEvent::ListenerStopped {
                protocol_label,
                error: None,
            } => {
                warn!(server, protocol = %protocol_label, "Listener exited");
            }
            RelayEvent::AcceptFailed {
                protocol_label,
                error,
            } => {
                error!(
                    server,
                    protocol = %protocol_label,
                    error = %error,
                    "Accept error"
                );
            }
            RelayEvent::ConnectionRejected {
                protocol_label,
                peer_addr,
                max_connections,
            } => {
                warn!(
                    server,
                    protocol = %protocol_label,
                    peer_addr = %peer_addr,
                    max_connections,
                    "Connection rejected: max connections reached"
                );
            }
            RelayEvent::ConnectionOpened(connection) => {
                info!(
                    server,
                    connection_id = connection.id,
                    protocol = %connection.protocol_label,
                    client = %connection.client_endpoint,
                    destination = %connection.destination_endpoint,
                    "New connection"
                );
            }
            RelayEvent::DestinationConnected {
                connection_id,
                destination_addr,
            } => {
                debug!(
                    server,
                    connection_id,
                    destination_addr = %destination_addr,
                    "Connected to destination"
                );
            }
            RelayEvent::DialFailed { connection, error } => {
                warn!(
                    server,
                    connection_id = connection.id,
                    destination = %connection.destination_endpoint,
                    error_kind = error.kind_str(),
                    error = %error,
                    "Failed to connect to destination"
                );
            }
            RelayEvent::CopyFinished {
                connection_id,
                outcome,
            } => match &outcome.error {
                Some(error) if !error.is_expected() => {
                    warn!(
                        server,
                        connection_id,
                        direction = outcome.direction.as_str(),
                        bytes = outcome.bytes_transferred,
                        error_kind = error.kind_str(),
                        error = %error,
                        "Copy error"
                    );
                }
                _ => {
                    debug!(
                        server,
                        connection_id,
                        direction = outcome.direction.as_str(),
                        bytes = outcome.bytes_transferred,
                        "Copy finished"
                    );
                }
            },
            RelayEvent::ConnectionClosed(summary) => {
                info!(
                    server,
                    connection_id = summary.connection.id,
                    protocol = %summary.connection.protocol_label,
                    bytes_to_destination = summary.bytes_client_to_destination(),
                    bytes_from_destination = summary.bytes_destination_to_client(),
                    errors = summary.errors().len(),
                    duration_ms = summary.duration.as_millis() as u64,
                    dial_failed = summary.is_dial_failure(),
                    "Connection closed"
                );
            }
        }
    }
}
