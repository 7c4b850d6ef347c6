//! Per-connection bridging.
//!
//! A [`Bridge`] owns one accepted client socket for its whole life:
//! 1. Dial the destination with a bounded connect timeout. On failure the
//!    client is closed and no copy runs.
//! 2. Copy client -> destination and destination -> client concurrently.
//! 3. When a direction ends (EOF or error) it shuts down the write side it
//!    was feeding, so the opposite direction sees EOF instead of hanging.
//! 4. The surviving direction keeps draining as long as it makes progress.
//!    If it moves no bytes for a whole half-close window, it is abandoned
//!    with a `Timeout` error and both sockets are closed.
//! 5. Wait for both directions, then emit one [`ConnectionSummary`].
//!
//! There is no deadline while both directions are open; a bridged
//! connection is never retried. Each socket is split into owned halves that
//! are dropped exactly once, when their copy future completes or is
//! abandoned.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::classify::{ClassifiedError, Classifier};
use super::observer::{RelayEvent, SharedObserver};

/// Default connect timeout for destination dials.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle window for the surviving direction after a half-close.
pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

const COPY_BUFFER_SIZE: usize = 8192;

/// A fixed `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Hostname or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Copy direction within a bridged connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToDestination,
    DestinationToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToDestination => "client_to_destination",
            Direction::DestinationToClient => "destination_to_client",
        }
    }
}

/// Result of one copy direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub direction: Direction,
    /// Bytes fully written to the peer.
    pub bytes_transferred: u64,
    /// First failure seen by this direction, if any.
    pub error: Option<ClassifiedError>,
}

/// One bridged session.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Listener-local sequence number.
    pub id: u64,
    pub client_endpoint: SocketAddr,
    pub destination_endpoint: String,
    pub protocol_label: String,
    pub started_at: Instant,
}

impl Connection {
    pub fn new(
        id: u64,
        client_endpoint: SocketAddr,
        destination: &Destination,
        protocol_label: impl Into<String>,
    ) -> Self {
        Self {
            id,
            client_endpoint,
            destination_endpoint: destination.to_string(),
            protocol_label: protocol_label.into(),
            started_at: Instant::now(),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The destination could not be reached; nothing was relayed.
    DialFailed(ClassifiedError),
    /// Both copy directions ran to completion.
    Bridged {
        client_to_destination: CopyOutcome,
        destination_to_client: CopyOutcome,
    },
}

/// Terminal summary of a connection, computed once both directions report.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub connection: Connection,
    pub duration: Duration,
    pub outcome: BridgeOutcome,
}

impl ConnectionSummary {
    pub fn bytes_client_to_destination(&self) -> u64 {
        match &self.outcome {
            BridgeOutcome::Bridged {
                client_to_destination,
                ..
            } => client_to_destination.bytes_transferred,
            BridgeOutcome::DialFailed(_) => 0,
        }
    }

    pub fn bytes_destination_to_client(&self) -> u64 {
        match &self.outcome {
            BridgeOutcome::Bridged {
                destination_to_client,
                ..
            } => destination_to_client.bytes_transferred,
            BridgeOutcome::DialFailed(_) => 0,
        }
    }

    /// Every error encountered, dial or copy.
    pub fn errors(&self) -> Vec<&ClassifiedError> {
        match &self.outcome {
            BridgeOutcome::DialFailed(error) => vec![error],
            BridgeOutcome::Bridged {
                client_to_destination,
                destination_to_client,
            } => client_to_destination
                .error
                .iter()
                .chain(destination_to_client.error.iter())
                .collect(),
        }
    }

    pub fn is_dial_failure(&self) -> bool {
        matches!(self.outcome, BridgeOutcome::DialFailed(_))
    }
}

/// Coordinates the dial and both copy directions for one client.
pub struct Bridge {
    connection: Connection,
    destination: Destination,
    connect_timeout: Duration,
    half_close_timeout: Duration,
    classifier: Arc<Classifier>,
    observer: SharedObserver,
}

impl Bridge {
    pub fn new(
        connection: Connection,
        destination: Destination,
        connect_timeout: Duration,
        classifier: Arc<Classifier>,
        observer: SharedObserver,
    ) -> Self {
        Self {
            connection,
            destination,
            connect_timeout,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            classifier,
            observer,
        }
    }

    /// Set how long the surviving direction may stall after the other one
    /// finished before the connection is torn down.
    pub fn with_half_close_timeout(mut self, half_close_timeout: Duration) -> Self {
        self.half_close_timeout = half_close_timeout;
        self
    }

    /// Bridge `client` to the destination until both directions finish.
    pub async fn run(self, client: TcpStream) -> ConnectionSummary {
        self.observer
            .emit(RelayEvent::ConnectionOpened(self.connection.clone()));

        let destination = match self.dial().await {
            Ok(stream) => stream,
            Err(e) => {
                let error = self.classifier.classify(&e);
                drop(client);
                self.observer.emit(RelayEvent::DialFailed {
                    connection: self.connection.clone(),
                    error: error.clone(),
                });
                return self.finish(BridgeOutcome::DialFailed(error));
            }
        };

        if let Ok(destination_addr) = destination.peer_addr() {
            self.observer.emit(RelayEvent::DestinationConnected {
                connection_id: self.connection.id,
                destination_addr,
            });
        }

        let (client_read, client_write) = client.into_split();
        let (destination_read, destination_write) = destination.into_split();

        let upload = AtomicU64::new(0);
        let download = AtomicU64::new(0);

        // Both copy futures live in this scope; leaving it drops any
        // abandoned half, which closes its sockets.
        let (client_to_destination, destination_to_client) = {
            let c2d = self.copy_half(
                client_read,
                destination_write,
                Direction::ClientToDestination,
                &upload,
            );
            let d2c = self.copy_half(
                destination_read,
                client_write,
                Direction::DestinationToClient,
                &download,
            );
            tokio::pin!(c2d);
            tokio::pin!(d2c);

            let (first, outcome) = tokio::select! {
                outcome = &mut c2d => (Direction::ClientToDestination, outcome),
                outcome = &mut d2c => (Direction::DestinationToClient, outcome),
            };

            match first {
                Direction::ClientToDestination => {
                    let remaining = self
                        .drain(d2c.as_mut(), Direction::DestinationToClient, &download)
                        .await;
                    (outcome, remaining)
                }
                Direction::DestinationToClient => {
                    let remaining = self
                        .drain(c2d.as_mut(), Direction::ClientToDestination, &upload)
                        .await;
                    (remaining, outcome)
                }
            }
        };

        self.finish(BridgeOutcome::Bridged {
            client_to_destination,
            destination_to_client,
        })
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let target = (self.destination.host.as_str(), self.destination.port);
        match timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            )),
        }
    }

    async fn copy_half(
        &self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
        direction: Direction,
        progress: &AtomicU64,
    ) -> CopyOutcome {
        let outcome =
            copy_direction(&mut reader, &mut writer, direction, &self.classifier, progress).await;
        self.report(&outcome);
        outcome
    }

    /// Let the surviving direction finish while it keeps moving bytes.
    ///
    /// Returns a `Timeout` outcome if a whole half-close window passes
    /// without progress. The caller drops `remaining` afterwards.
    async fn drain<F>(
        &self,
        mut remaining: Pin<&mut F>,
        direction: Direction,
        progress: &AtomicU64,
    ) -> CopyOutcome
    where
        F: Future<Output = CopyOutcome>,
    {
        let mut last_seen = progress.load(Ordering::Relaxed);
        loop {
            if let Ok(outcome) = timeout(self.half_close_timeout, remaining.as_mut()).await {
                return outcome;
            }
            let seen = progress.load(Ordering::Relaxed);
            if seen == last_seen {
                let outcome = CopyOutcome {
                    direction,
                    bytes_transferred: seen,
                    error: Some(ClassifiedError::Timeout),
                };
                self.report(&outcome);
                return outcome;
            }
            last_seen = seen;
        }
    }

    fn report(&self, outcome: &CopyOutcome) {
        self.observer.emit(RelayEvent::CopyFinished {
            connection_id: self.connection.id,
            outcome: outcome.clone(),
        });
    }

    fn finish(&self, outcome: BridgeOutcome) -> ConnectionSummary {
        let summary = ConnectionSummary {
            connection: self.connection.clone(),
            duration: self.connection.started_at.elapsed(),
            outcome,
        };
        self.observer
            .emit(RelayEvent::ConnectionClosed(summary.clone()));
        summary
    }
}

/// Copy `reader` into `writer` until EOF or error, then shut down `writer`.
///
/// `progress` is bumped after every completed write so a stalled copy can be
/// told apart from a slow one. The shutdown runs on every exit path so the
/// peer behind `writer` observes end-of-stream. A shutdown failure is only
/// reported when the copy itself succeeded and the failure is not
/// peer-closed teardown.
pub(crate) async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    classifier: &Classifier,
    progress: &AtomicU64,
) -> CopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let result: io::Result<()> = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                progress.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => break Err(e),
        }
    };

    let shutdown = writer.shutdown().await;

    let error = match (result, shutdown) {
        (Err(e), _) => Some(classifier.classify(&e)),
        (Ok(()), Err(e)) => Some(classifier.classify(&e)).filter(|c| !c.is_expected()),
        (Ok(()), Ok(())) => None,
    };

    CopyOutcome {
        direction,
        bytes_transferred: progress.load(Ordering::Relaxed),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::observer::MemoryObserver;
    use tokio::net::{TcpListener, TcpSocket};
    use tokio_test::io::Builder;

    /// A listener whose accept queue is full, so further dials never
    /// complete the handshake. Keep the returned sockets alive.
    async fn unresponsive_destination() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut backlog = Vec::new();
        for _ in 0..64 {
            match timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => backlog.push(stream),
                _ => break,
            }
        }
        (listener, backlog, addr)
    }

    async fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (client, accepted)
    }

    #[tokio::test]
    async fn test_dial_timeout_closes_client_without_copying() {
        let (_listener, _backlog, addr) = unresponsive_destination().await;
        let (mut client, accepted) = client_pair().await;

        let destination = Destination::new(addr.ip().to_string(), addr.port());
        let connection = Connection::new(1, client.local_addr().unwrap(), &destination, "TCP");
        let observer = Arc::new(MemoryObserver::new());
        let bridge = Bridge::new(
            connection,
            destination,
            Duration::from_millis(300),
            Arc::new(Classifier::new()),
            observer.clone(),
        );

        let summary = timeout(Duration::from_secs(5), bridge.run(accepted))
            .await
            .expect("dial should give up after the connect timeout");

        assert_eq!(
            summary.outcome,
            BridgeOutcome::DialFailed(ClassifiedError::Timeout)
        );
        assert_eq!(
            observer.count(|e| matches!(
                e,
                RelayEvent::DialFailed {
                    error: ClassifiedError::Timeout,
                    ..
                }
            )),
            1
        );
        assert_eq!(
            observer.count(|e| matches!(e, RelayEvent::CopyFinished { .. })),
            0
        );
        assert_eq!(observer.summaries().len(), 1);

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should be closed");
        match read {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(
                Classifier::new().classify(&e),
                ClassifiedError::PeerClosed
            ),
        }
    }

    #[test]
    fn test_destination_display() {
        assert_eq!(
            Destination::new("44.207.188.95", 443).to_string(),
            "44.207.188.95:443"
        );
        assert_eq!(Destination::new("::1", 80).to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_copy_direction_counts_bytes_and_shuts_down() {
        let classifier = Classifier::new();
        let mut reader = Builder::new().read(b"hello ").read(b"world").build();
        let mut writer = Builder::new().write(b"hello ").write(b"world").build();

        let outcome = copy_direction(
            &mut reader,
            &mut writer,
            Direction::ClientToDestination,
            &classifier,
            &AtomicU64::new(0),
        )
        .await;

        assert_eq!(outcome.direction, Direction::ClientToDestination);
        assert_eq!(outcome.bytes_transferred, 11);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_copy_direction_read_reset_is_peer_closed() {
        let classifier = Classifier::new();
        let mut reader = Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            ))
            .build();
        let mut writer = Builder::new().write(b"partial").build();

        let outcome = copy_direction(
            &mut reader,
            &mut writer,
            Direction::DestinationToClient,
            &classifier,
            &AtomicU64::new(0),
        )
        .await;

        assert_eq!(outcome.bytes_transferred, 7);
        assert_eq!(outcome.error, Some(ClassifiedError::PeerClosed));
    }

    #[tokio::test]
    async fn test_copy_direction_write_failure_is_reported() {
        let classifier = Classifier::new();
        let mut reader = Builder::new().read(b"data").build();
        let mut writer = Builder::new()
            .write_error(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "write refused",
            ))
            .build();

        let outcome = copy_direction(
            &mut reader,
            &mut writer,
            Direction::ClientToDestination,
            &classifier,
            &AtomicU64::new(0),
        )
        .await;

        assert_eq!(outcome.bytes_transferred, 0);
        assert_eq!(
            outcome.error,
            Some(ClassifiedError::Other("write refused".to_string()))
        );
    }

    #[tokio::test]
    async fn test_copy_direction_empty_stream() {
        let classifier = Classifier::new();
        let mut reader = Builder::new().build();
        let mut writer = Builder::new().build();

        let outcome = copy_direction(
            &mut reader,
            &mut writer,
            Direction::DestinationToClient,
            &classifier,
            &AtomicU64::new(0),
        )
        .await;

        assert_eq!(outcome.bytes_transferred, 0);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_summary_accessors() {
        let destination = Destination::new("127.0.0.1", 80);
        let connection = Connection::new(1, "127.0.0.1:5000".parse().unwrap(), &destination, "HTTP");

        let failed = ConnectionSummary {
            connection: connection.clone(),
            duration: Duration::from_millis(5),
            outcome: BridgeOutcome::DialFailed(ClassifiedError::Timeout),
        };
        assert!(failed.is_dial_failure());
        assert_eq!(failed.bytes_client_to_destination(), 0);
        assert_eq!(failed.errors(), vec![&ClassifiedError::Timeout]);

        let bridged = ConnectionSummary {
            connection,
            duration: Duration::from_millis(5),
            outcome: BridgeOutcome::Bridged {
                client_to_destination: CopyOutcome {
                    direction: Direction::ClientToDestination,
                    bytes_transferred: 12,
                    error: None,
                },
                destination_to_client: CopyOutcome {
                    direction: Direction::DestinationToClient,
                    bytes_transferred: 34,
                    error: Some(ClassifiedError::PeerClosed),
                },
            },
        };
        assert!(!bridged.is_dial_failure());
        assert_eq!(bridged.bytes_client_to_destination(), 12);
        assert_eq!(bridged.bytes_destination_to_client(), 34);
        assert_eq!(bridged.errors(), vec![&ClassifiedError::PeerClosed]);
        assert_eq!(bridged.connection.destination_endpoint, "127.0.0.1:80");
    }
}
