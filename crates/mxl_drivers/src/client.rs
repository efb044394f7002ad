//! Socket client implementing the driver side of the hub protocol.

#[cfg(unix)]
use std::path::PathBuf;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::{debug, info};

use mxl_link::codec::{Frame, FrameDecodeError, ANY_MOLECULE};
use mxl_link::connection::DriverStream;
use mxl_link::driver::EmbeddedDriver;
use mxl_link::error::LinkError;
use mxl_link::molecule::MoleculeId;
use mxl_link::Vec3;

/// Where the hub is listening.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// `host:port`.
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::Tcp(addr.into())
    }

    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

/// A connected, handshaken driver-side endpoint.
///
/// [`serve`](DriverClient::serve) runs the whole FIELD→AMP loop for a
/// model; the lower-level `recv_field`/`send_amp`/`send_heartbeat` calls
/// are for drivers that interleave their own computation with liveness
/// pings. Protocol errors are fatal here: unlike the hub, a driver has
/// nothing sensible to do with a corrupt stream except exit and restart
/// from its own checkpoint.
pub struct DriverClient {
    stream: DriverStream,
    molecule_id: MoleculeId,
    dt: f64,
}

impl DriverClient {
    /// Connect and complete the handshake. `requested_id` of `None` claims
    /// whichever registered molecule the hub hands out next.
    pub async fn connect(
        endpoint: &Endpoint,
        requested_id: Option<MoleculeId>,
        model_name: &str,
    ) -> Result<Self, LinkError> {
        let mut stream = match endpoint {
            Endpoint::Tcp(addr) => DriverStream::Tcp(TcpStream::connect(addr.as_str()).await?),
            #[cfg(unix)]
            Endpoint::Unix(path) => DriverStream::Unix(UnixStream::connect(path).await?),
        };
        stream
            .write_frame(&Frame::Init {
                requested_id: requested_id.map(|id| id as i32).unwrap_or(ANY_MOLECULE),
                model: model_name.to_string(),
            })
            .await?;
        match stream.read_frame().await? {
            Frame::Assign { molecule_id, dt } => {
                info!(molecule_id, dt, "handshake complete");
                Ok(Self {
                    stream,
                    molecule_id,
                    dt,
                })
            }
            Frame::Disconnect { reason } => Err(LinkError::HandshakeRejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(FrameDecodeError::UnexpectedFrame {
                expected: "ASSIGN",
                got: other.kind().name(),
            }
            .into()),
        }
    }

    /// The molecule id confirmed by the hub.
    pub fn molecule_id(&self) -> MoleculeId {
        self.molecule_id
    }

    /// The time step announced in the ASSIGN frame, atomic units.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Wait for the next step input. `None` means the hub closed the
    /// session gracefully.
    pub async fn recv_field(&mut self) -> Result<Option<(f64, Vec3)>, LinkError> {
        loop {
            match self.stream.read_frame().await? {
                Frame::Field { sim_time, field } => return Ok(Some((sim_time, field))),
                Frame::Heartbeat => continue,
                Frame::Disconnect { reason } => {
                    debug!(?reason, "hub disconnected");
                    return Ok(None);
                }
                other => {
                    return Err(FrameDecodeError::UnexpectedFrame {
                        expected: "FIELD",
                        got: other.kind().name(),
                    }
                    .into())
                }
            }
        }
    }

    /// Reply to the outstanding FIELD.
    pub async fn send_amp(
        &mut self,
        amplitude: Vec3,
        diagnostics: Option<Map<String, Value>>,
    ) -> Result<(), LinkError> {
        self.stream
            .write_frame(&Frame::Amp {
                amplitude,
                diagnostics,
            })
            .await?;
        Ok(())
    }

    /// Liveness ping for long-running propagation; resets the hub's idle
    /// clock without completing the exchange.
    pub async fn send_heartbeat(&mut self) -> Result<(), LinkError> {
        self.stream.write_frame(&Frame::Heartbeat).await?;
        Ok(())
    }

    /// Announce a graceful close and consume the client.
    pub async fn disconnect(mut self, reason: &str) {
        let _ = self
            .stream
            .write_frame(&Frame::Disconnect {
                reason: Some(reason.to_string()),
            })
            .await;
    }

    /// Serve a model until the hub closes the session: initialize it with
    /// the assigned dt and id, then answer every FIELD with the model's
    /// response and optional diagnostics. Returns the number of completed
    /// exchanges.
    pub async fn serve<M>(&mut self, model: &mut M) -> Result<u64, LinkError>
    where
        M: EmbeddedDriver + ?Sized,
    {
        model.initialize(self.dt, self.molecule_id);
        let mut steps = 0u64;
        while let Some((_sim_time, field)) = self.recv_field().await? {
            model.propagate(field);
            self.send_amp(model.response_vector(), model.diagnostics())
                .await?;
            steps += 1;
        }
        Ok(steps)
    }
}
