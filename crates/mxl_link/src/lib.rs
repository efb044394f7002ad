//! MaxwellLink core: synchronization and transport between an EM field
//! time-stepper and molecular/quantum dynamics drivers.
//!
//! The crate couples one EM solver instance to any number of drivers,
//! advancing both sides in lockstep so that every simulation step sees a
//! consistent field/response exchange. Drivers either live in-process
//! (embedded) or connect over TCP / Unix-domain sockets, potentially from
//! other machines on a cluster.
//!
//! # Architecture
//!
//! - **Transport**: length-prefixed binary frames over raw stream sockets
//!   (`codec`, `connection`).
//! - **Hub**: accept loop, molecule registry, per-step exchange with
//!   pause/reconnect tolerance (`hub`).
//! - **Molecule**: one coupling site, socket-bound or embedded (`molecule`).
//! - **Rank fan-out**: an injected [`RankBroadcaster`] keeps MPI-style
//!   worker ranks in lockstep with the rank that owns socket I/O
//!   (`broadcast`).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mxl_link::{Hub, HubConfig, MoleculeSpec};
//!
//! # async fn example() -> Result<(), mxl_link::LinkError> {
//! let hub = Hub::open_single_rank(HubConfig::default()).await?;
//! let molecule = hub.register_molecule(MoleculeSpec::socket(0.05))?;
//! hub.await_all_connected(std::time::Duration::from_secs(60)).await?;
//! let outcome = molecule.field([0.0, 0.0, 1e-4], 0.0).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod hub;
pub mod molecule;

/// A 3-vector in atomic units. All vectors crossing this crate's interfaces
/// use this fixed unit system; conversion to a solver's native units is the
/// solver adapter's responsibility.
pub type Vec3 = [f64; 3];

/// The zero vector.
pub const ZERO_VEC3: Vec3 = [0.0, 0.0, 0.0];

// ── Re-exports for convenience ──────────────────────────────────────────

pub use broadcast::{LocalCluster, RankBroadcaster, RankRole, SingleRank};
pub use codec::{Frame, FrameDecodeError, FrameKind};
pub use config::HubConfig;
pub use connection::{DriverConnection, DriverStream, Handshake, ProtocolState};
pub use driver::{DriverRegistry, EmbeddedDriver};
pub use error::LinkError;
pub use hub::{BindingSpec, ExchangeOutcome, Hub, MoleculeHandle, MoleculeSpec};
pub use molecule::{ConnectionState, DiagnosticRecord, DriverMode, Molecule, MoleculeId};
