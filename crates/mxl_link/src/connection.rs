//! One accepted driver socket: handshake, then lockstep FIELD/AMP exchange.

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::codec::{self, Frame, FrameDecodeError};
use crate::error::LinkError;
use crate::molecule::MoleculeId;
use crate::Vec3;

/// A stream socket of either flavor. The protocol is transport-agnostic;
/// only connection setup differs.
pub enum DriverStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl DriverStream {
    /// Read one frame from the peer.
    pub async fn read_frame(&mut self) -> Result<Frame, LinkError> {
        match self {
            Self::Tcp(s) => codec::read_frame(s).await,
            #[cfg(unix)]
            Self::Unix(s) => codec::read_frame(s).await,
        }
    }

    /// Write one frame to the peer and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => codec::write_frame(s, frame).await,
            #[cfg(unix)]
            Self::Unix(s) => codec::write_frame(s, frame).await,
        }
    }
}

/// Protocol state of one driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Accepted, INIT not yet processed.
    AwaitingHandshake,
    /// Bound and idle, awaiting the next field push.
    Ready,
    /// FIELD sent, AMP outstanding.
    AwaitingResponse,
    /// Terminal. The hub unbinds the molecule id so a fresh connection can
    /// reclaim it.
    Closed,
}

/// A freshly accepted socket that has not yet completed the handshake.
///
/// The accept path reads the INIT frame, consults the registry, and either
/// [`accept`](Handshake::accept)s (writing ASSIGN and producing a bound
/// [`DriverConnection`]) or [`reject`](Handshake::reject)s.
pub struct Handshake {
    stream: DriverStream,
    peer: String,
}

impl Handshake {
    pub fn new(stream: DriverStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    /// The peer label used in logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Read the opening INIT frame: `(requested_id, model name)`.
    pub async fn read_init(&mut self) -> Result<(i32, String), LinkError> {
        match self.stream.read_frame().await? {
            Frame::Init {
                requested_id,
                model,
            } => Ok((requested_id, model)),
            other => Err(FrameDecodeError::UnexpectedFrame {
                expected: "INIT",
                got: other.kind().name(),
            }
            .into()),
        }
    }

    /// Complete the handshake: write ASSIGN and bind the connection.
    pub async fn accept(
        mut self,
        molecule_id: MoleculeId,
        dt: f64,
    ) -> Result<DriverConnection, LinkError> {
        self.stream
            .write_frame(&Frame::Assign { molecule_id, dt })
            .await?;
        Ok(DriverConnection {
            stream: self.stream,
            state: ProtocolState::Ready,
            molecule_id,
            peer: self.peer,
            last_activity: Instant::now(),
        })
    }

    /// Refuse the connection with a best-effort DISCONNECT, then drop it.
    pub async fn reject(mut self, reason: &str) {
        debug!(peer = %self.peer, reason, "rejecting driver connection");
        let _ = self
            .stream
            .write_frame(&Frame::Disconnect {
                reason: Some(reason.to_string()),
            })
            .await;
    }
}

/// How an in-flight exchange on one connection ended short of an AMP.
#[derive(Debug)]
pub enum ExchangeFailure {
    /// No AMP or HEARTBEAT within the idle budget.
    TimedOut,
    /// The peer closed the stream (DISCONNECT frame or EOF).
    PeerClosed,
    /// Framing violation or transport error.
    Protocol(LinkError),
}

/// The payload of a successful exchange.
#[derive(Debug)]
pub struct AmpReply {
    pub amplitude: Vec3,
    pub diagnostics: Option<Map<String, Value>>,
}

/// An established, bound driver connection. Owned by exactly one molecule
/// slot at a time; dropped whole on any failure so a late AMP can never be
/// read by a later step.
pub struct DriverConnection {
    stream: DriverStream,
    state: ProtocolState,
    molecule_id: MoleculeId,
    peer: String,
    last_activity: Instant,
}

impl DriverConnection {
    /// The molecule id this connection was bound to at handshake. Immutable
    /// for the lifetime of the socket.
    pub fn molecule_id(&self) -> MoleculeId {
        self.molecule_id
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Time since the last frame in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Push the step input. Transitions Ready → AwaitingResponse.
    pub async fn send_field(&mut self, sim_time: f64, field: Vec3) -> std::io::Result<()> {
        debug_assert_eq!(self.state, ProtocolState::Ready);
        self.stream
            .write_frame(&Frame::Field { sim_time, field })
            .await?;
        self.state = ProtocolState::AwaitingResponse;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Block until the AMP for the outstanding FIELD arrives, the idle
    /// budget elapses, or the connection dies.
    ///
    /// HEARTBEAT frames reset the idle clock without completing the
    /// exchange, so a long-running driver stays alive as long as it keeps
    /// pinging. Any failure leaves the connection Closed.
    pub async fn await_amp(&mut self, timeout: Duration) -> Result<AmpReply, ExchangeFailure> {
        loop {
            let Some(remaining) = timeout.checked_sub(self.last_activity.elapsed()) else {
                self.state = ProtocolState::Closed;
                return Err(ExchangeFailure::TimedOut);
            };
            match tokio::time::timeout(remaining, self.stream.read_frame()).await {
                Err(_) => {
                    self.state = ProtocolState::Closed;
                    return Err(ExchangeFailure::TimedOut);
                }
                Ok(Ok(Frame::Amp {
                    amplitude,
                    diagnostics,
                })) => {
                    self.last_activity = Instant::now();
                    self.state = ProtocolState::Ready;
                    return Ok(AmpReply {
                        amplitude,
                        diagnostics,
                    });
                }
                Ok(Ok(Frame::Heartbeat)) => {
                    debug!(molecule = self.molecule_id, "heartbeat from driver");
                    self.last_activity = Instant::now();
                }
                Ok(Ok(Frame::Disconnect { reason })) => {
                    debug!(molecule = self.molecule_id, ?reason, "driver disconnected");
                    self.state = ProtocolState::Closed;
                    return Err(ExchangeFailure::PeerClosed);
                }
                Ok(Ok(other)) => {
                    self.state = ProtocolState::Closed;
                    return Err(ExchangeFailure::Protocol(
                        FrameDecodeError::UnexpectedFrame {
                            expected: "AMP",
                            got: other.kind().name(),
                        }
                        .into(),
                    ));
                }
                Ok(Err(LinkError::Io(e))) => {
                    self.state = ProtocolState::Closed;
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        return Err(ExchangeFailure::PeerClosed);
                    }
                    return Err(ExchangeFailure::Protocol(LinkError::Io(e)));
                }
                Ok(Err(e)) => {
                    self.state = ProtocolState::Closed;
                    return Err(ExchangeFailure::Protocol(e));
                }
            }
        }
    }

    /// Best-effort graceful close. The connection is unusable afterwards.
    pub async fn send_disconnect(&mut self, reason: &str) {
        let _ = self
            .stream
            .write_frame(&Frame::Disconnect {
                reason: Some(reason.to_string()),
            })
            .await;
        self.state = ProtocolState::Closed;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Accept one loopback connection and pair it with a client stream.
    async fn socket_pair() -> (DriverStream, DriverStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (DriverStream::Tcp(server), DriverStream::Tcp(client))
    }

    #[tokio::test]
    async fn test_handshake_accept() {
        let (server, mut client) = socket_pair().await;
        let mut hs = Handshake::new(server, "test");

        client
            .write_frame(&Frame::Init {
                requested_id: 2,
                model: "tls".to_string(),
            })
            .await
            .unwrap();

        let (requested, model) = hs.read_init().await.unwrap();
        assert_eq!(requested, 2);
        assert_eq!(model, "tls");

        let conn = hs.accept(2, 0.05).await.unwrap();
        assert_eq!(conn.state(), ProtocolState::Ready);
        assert_eq!(conn.molecule_id(), 2);

        match client.read_frame().await.unwrap() {
            Frame::Assign { molecule_id, dt } => {
                assert_eq!(molecule_id, 2);
                assert_eq!(dt, 0.05);
            }
            other => panic!("expected ASSIGN, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_init() {
        let (server, mut client) = socket_pair().await;
        let mut hs = Handshake::new(server, "test");
        client.write_frame(&Frame::Heartbeat).await.unwrap();
        match hs.read_init().await {
            Err(LinkError::FrameDecode(FrameDecodeError::UnexpectedFrame { .. })) => {}
            other => panic!("expected UnexpectedFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_heartbeat_extends_wait() {
        let (server, mut client) = socket_pair().await;
        let mut hs = Handshake::new(server, "test");
        let driver = tokio::spawn(async move {
            client
                .write_frame(&Frame::Init {
                    requested_id: 0,
                    model: String::new(),
                })
                .await
                .unwrap();
            let _assign = client.read_frame().await.unwrap();
            let _field = client.read_frame().await.unwrap();
            // Two heartbeats, each inside the idle budget, then the reply.
            for _ in 0..2 {
                tokio::time::sleep(Duration::from_millis(120)).await;
                client.write_frame(&Frame::Heartbeat).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(120)).await;
            client
                .write_frame(&Frame::Amp {
                    amplitude: [0.0, 0.0, -1.0],
                    diagnostics: None,
                })
                .await
                .unwrap();
        });

        hs.read_init().await.unwrap();
        let mut conn = hs.accept(0, 0.1).await.unwrap();
        conn.send_field(0.0, [0.0, 0.0, 1.0]).await.unwrap();
        // Total wait is ~360ms, well past the 200ms idle budget, but each
        // inter-frame gap is under it.
        let reply = conn.await_amp(Duration::from_millis(200)).await.unwrap();
        assert_eq!(reply.amplitude, [0.0, 0.0, -1.0]);
        assert_eq!(conn.state(), ProtocolState::Ready);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_timeout_closes() {
        let (server, mut client) = socket_pair().await;
        let mut hs = Handshake::new(server, "test");
        client
            .write_frame(&Frame::Init {
                requested_id: 0,
                model: String::new(),
            })
            .await
            .unwrap();
        hs.read_init().await.unwrap();
        let mut conn = hs.accept(0, 0.1).await.unwrap();
        conn.send_field(0.0, [1.0, 0.0, 0.0]).await.unwrap();
        match conn.await_amp(Duration::from_millis(50)).await {
            Err(ExchangeFailure::TimedOut) => {}
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert_eq!(conn.state(), ProtocolState::Closed);
    }

    #[tokio::test]
    async fn test_exchange_peer_close_detected() {
        let (server, mut client) = socket_pair().await;
        let mut hs = Handshake::new(server, "test");
        client
            .write_frame(&Frame::Init {
                requested_id: 0,
                model: String::new(),
            })
            .await
            .unwrap();
        hs.read_init().await.unwrap();
        let mut conn = hs.accept(0, 0.1).await.unwrap();
        conn.send_field(0.0, [1.0, 0.0, 0.0]).await.unwrap();
        drop(client);
        let started = Instant::now();
        match conn.await_amp(Duration::from_secs(5)).await {
            Err(ExchangeFailure::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {other:?}"),
        }
        // EOF must be noticed promptly, not after the idle budget.
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
