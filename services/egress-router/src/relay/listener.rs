//! TCP listener and accept loop.
//!
//! One [`Listener`] owns one bound port and forwards every accepted socket
//! to a fixed destination through a fresh [`Bridge`] task.
//!
//! - Bind failure is the only fatal condition, and it only stops this
//!   listener.
//! - Accept errors are reported and the loop keeps going after a short
//!   backoff.
//! - Concurrently bridged connections are capped by a semaphore; sockets
//!   over the cap are closed immediately.
//!
//! [`serve`] runs several listeners side by side until all of them stop or
//! a shutdown future resolves.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::bridge::{
    Bridge, Connection, ConnectionSummary, Destination, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_HALF_CLOSE_TIMEOUT,
};
use super::classify::Classifier;
use super::observer::{RelayEvent, SharedObserver};
use crate::error::{RelayError, Result};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Largest accepted connection cap.
pub const MAX_CONNECTIONS_LIMIT: usize = Semaphore::MAX_PERMITS;

/// Default pause after a failed accept.
pub const DEFAULT_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Static description of one listener: which port forwards where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub listen_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
    /// Used only for logging.
    pub protocol_label: String,
}

impl ListenerSpec {
    pub fn new(
        listen_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
        protocol_label: impl Into<String>,
    ) -> Self {
        Self {
            listen_port,
            destination_host: destination_host.into(),
            destination_port,
            protocol_label: protocol_label.into(),
        }
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.destination_host.clone(), self.destination_port)
    }
}

/// Runtime tuning shared by listeners.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address the listen port is bound on.
    pub bind_ip: IpAddr,
    /// Maximum concurrently bridged connections.
    pub max_connections: usize,
    /// Connect timeout for destination dials.
    pub connect_timeout: Duration,
    /// Idle window for the surviving direction once the other has finished.
    pub half_close_timeout: Duration,
    /// Pause after a failed accept.
    pub accept_error_backoff: Duration,
}

impl ListenerConfig {
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            accept_error_backoff: DEFAULT_ACCEPT_ERROR_BACKOFF,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being bridged.
    pub connections_active: AtomicU64,
    /// Connections whose bridge has finished.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
    /// Destination dial failures.
    pub dial_failed: AtomicU64,
    /// Bytes relayed client -> destination.
    pub bytes_to_destination: AtomicU64,
    /// Bytes relayed destination -> client.
    pub bytes_from_destination: AtomicU64,
}

impl ListenerStats {
    fn record(&self, summary: &ConnectionSummary) {
        if summary.is_dial_failure() {
            self.dial_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_to_destination
            .fetch_add(summary.bytes_client_to_destination(), Ordering::Relaxed);
        self.bytes_from_destination
            .fetch_add(summary.bytes_destination_to_client(), Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Source of inbound connections.
#[async_trait]
pub trait Accept: Send + Sync + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;

    /// Address being listened on.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Accept for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A listening port bridged to one destination.
pub struct Listener<A = TcpListener> {
    spec: ListenerSpec,
    config: ListenerConfig,
    acceptor: A,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    classifier: Arc<Classifier>,
    observer: SharedObserver,
    stats: Arc<ListenerStats>,
    next_connection_id: AtomicU64,
}

impl Listener<TcpListener> {
    /// Bind the spec's port on the configured address.
    pub async fn bind(
        spec: ListenerSpec,
        config: ListenerConfig,
        observer: SharedObserver,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_ip, spec.listen_port);

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                observer.emit(RelayEvent::BindFailed {
                    protocol_label: spec.protocol_label.clone(),
                    addr,
                    error: source.to_string(),
                });
                return Err(RelayError::Bind { addr, source });
            }
        };

        Ok(Self::with_acceptor(spec, config, listener, observer))
    }
}

impl<A: Accept> Listener<A> {
    /// Build a listener around an already-bound accept source.
    ///
    /// The connection cap is clamped to `1..=MAX_CONNECTIONS_LIMIT`.
    pub fn with_acceptor(
        spec: ListenerSpec,
        mut config: ListenerConfig,
        acceptor: A,
        observer: SharedObserver,
    ) -> Self {
        config.max_connections = config.max_connections.clamp(1, MAX_CONNECTIONS_LIMIT);
        Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            classifier: Arc::new(Classifier::new()),
            spec,
            config,
            acceptor,
            observer,
            stats: Arc::new(ListenerStats::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn spec(&self) -> &ListenerSpec {
        &self.spec
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Shared handle to the listener statistics.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop. Only returns if the local address is unavailable.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let local_addr = self.acceptor.local_addr()?;
        self.observer.emit(RelayEvent::ListenerStarted {
            protocol_label: self.spec.protocol_label.clone(),
            local_addr,
            destination: self.spec.destination().to_string(),
        });

        loop {
            match self.acceptor.accept().await {
                Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    self.observer.emit(RelayEvent::AcceptFailed {
                        protocol_label: self.spec.protocol_label.clone(),
                        error: self.classifier.classify(&e),
                    });
                    tokio::time::sleep(self.config.accept_error_backoff).await;
                }
            }
        }
    }

    /// Hand an accepted socket to a new bridge task.
    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                self.observer.emit(RelayEvent::ConnectionRejected {
                    protocol_label: self.spec.protocol_label.clone(),
                    peer_addr,
                    max_connections: self.config.max_connections,
                });
                drop(stream);
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let destination = self.spec.destination();
        let connection = Connection::new(id, peer_addr, &destination, &self.spec.protocol_label);
        let bridge = Bridge::new(
            connection,
            destination,
            self.config.connect_timeout,
            Arc::clone(&self.classifier),
            Arc::clone(&self.observer),
        )
        .with_half_close_timeout(self.config.half_close_timeout);
        let stats = Arc::clone(&self.stats);
        let span = tracing::info_span!(
            "connection",
            id,
            peer = %peer_addr,
            protocol = %self.spec.protocol_label
        );

        tokio::spawn(
            async move {
                let summary = bridge.run(stream).await;
                drop(permit);
                stats.record(&summary);
            }
            .instrument(span),
        );
    }
}

/// Bind `spec` and serve it forever.
///
/// Returns only on failure; a bind error stops this listener alone.
pub async fn start(
    spec: ListenerSpec,
    config: ListenerConfig,
    observer: SharedObserver,
) -> Result<()> {
    let listener = Arc::new(Listener::bind(spec, config, observer).await?);
    listener.run().await
}

/// Run one listener per spec until `shutdown` resolves.
///
/// A listener that stops is reported and its siblings keep serving. Returns
/// `Ok` on shutdown and [`RelayError::AllListenersStopped`] once none are
/// left.
pub async fn serve<F>(
    specs: Vec<ListenerSpec>,
    config: ListenerConfig,
    observer: SharedObserver,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut listeners = JoinSet::new();
    for spec in specs {
        let config = config.clone();
        let observer = Arc::clone(&observer);
        listeners.spawn(async move {
            let label = spec.protocol_label.clone();
            (label, start(spec, config, observer).await)
        });
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            joined = listeners.join_next() => {
                let (protocol_label, error) = match joined {
                    Some(Ok((label, result))) => (label, result.err().map(|e| e.to_string())),
                    Some(Err(e)) => ("unknown".to_string(), Some(e.to_string())),
                    None => return Err(RelayError::AllListenersStopped),
                };
                observer.emit(RelayEvent::ListenerStopped {
                    protocol_label,
                    error,
                });
            }
            _ = &mut shutdown => {
                listeners.shutdown().await;
                return Ok(());
            }
        }
    }
}
