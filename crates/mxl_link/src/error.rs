//! Error taxonomy for the synchronization core.

use std::time::Duration;

use crate::codec::FrameDecodeError;
use crate::molecule::MoleculeId;

/// Errors that can occur in the mxl_link crate.
///
/// Transient per-step conditions (a paused driver, an operator shutdown) are
/// not errors; they are [`ExchangeOutcome`](crate::hub::ExchangeOutcome)
/// variants. Everything here is either fatal at startup (`Bind`,
/// `HandshakeTimeout`), fatal for the run (`DriverLost`), or a caller
/// mistake (`UnknownMolecule`, `NotRunning`).
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// A listener could not be created on the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Registered socket molecules never completed the handshake within the
    /// startup budget.
    #[error("{pending} socket molecule(s) still unconnected after {budget:?}")]
    HandshakeTimeout { pending: usize, budget: Duration },

    /// Malformed bytes on an established connection. Non-fatal to the hub
    /// (the offending connection is closed); fatal to a driver client.
    #[error("frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    /// A paused molecule exceeded the reconnection budget. Fatal for the
    /// whole run: all coupling sites must stay co-temporal.
    #[error("driver for molecule {id} lost after {waited:?} without reconnecting")]
    DriverLost { id: MoleculeId, waited: Duration },

    /// The hub rejected this client's handshake.
    #[error("handshake rejected by hub: {0}")]
    HandshakeRejected(String),

    /// The molecule id is not present in the hub's registry.
    #[error("unknown molecule id {0}")]
    UnknownMolecule(MoleculeId),

    /// No constructor registered for the requested driver kind.
    #[error("unknown driver kind '{0}'")]
    UnknownDriverKind(String),

    /// An embedded driver constructor rejected its parameters.
    #[error("driver construction failed: {0}")]
    DriverInit(String),

    /// The hub has been closed (or was never opened).
    #[error("hub is not running")]
    NotRunning,

    /// JSON serialization / deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
