//! Molecule: one coupling site between the EM solver and one driver.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::DriverConnection;
use crate::driver::EmbeddedDriver;
use crate::{Vec3, ZERO_VEC3};

/// Unique molecule identifier within one hub. Assigned monotonically at
/// registration and never reused within a run.
pub type MoleculeId = u32;

/// Connection state of a socket-mode molecule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A driver completed the handshake and is bound.
    Connected,
    /// The driver went silent or the socket died; awaiting a reconnect.
    Paused,
    /// No driver has ever bound (or the hub shut the binding down).
    Disconnected,
}

/// How this molecule reaches its driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    Socket,
    Embedded,
}

/// One diagnostic record produced by a driver alongside its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// EM simulation time the record belongs to, atomic units.
    pub sim_time: f64,
    /// Wall-clock receipt time on the hub side.
    pub received_at: DateTime<Utc>,
    /// Free-form key to scalar/vector map, as produced by the driver.
    pub data: Map<String, Value>,
}

/// Socket-side binding state. The connection itself lives in a shared slot
/// so the accept loop can rebind it while an exchange is waiting.
pub(crate) struct SocketBinding {
    pub(crate) state: ConnectionState,
    /// When the current pause began; budget accounting for DriverLost.
    pub(crate) paused_at: Option<Instant>,
    /// Model name advertised in the driver's INIT frame.
    pub(crate) model: Option<String>,
    pub(crate) conn: Arc<tokio::sync::Mutex<Option<DriverConnection>>>,
}

pub(crate) struct EmbeddedBinding {
    pub(crate) driver: Arc<parking_lot::Mutex<Box<dyn EmbeddedDriver>>>,
}

/// The tagged driver indirection. All dispatch is an exhaustive match on
/// this tag; there is no driver class hierarchy.
pub(crate) enum DriverBinding {
    Socket(SocketBinding),
    Embedded(EmbeddedBinding),
}

/// One coupling site.
///
/// The hub exclusively owns connection-state transitions; the EM solver
/// owns `dt` and read access to the last response and history; the driver
/// path is the only writer of responses and history entries.
pub struct Molecule {
    id: MoleculeId,
    dt: f64,
    pub(crate) binding: DriverBinding,
    last_field: Vec3,
    last_response: Vec3,
    history_enabled: bool,
    history: Vec<DiagnosticRecord>,
}

impl Molecule {
    pub(crate) fn socket(id: MoleculeId, dt: f64, history_enabled: bool) -> Self {
        Self {
            id,
            dt,
            binding: DriverBinding::Socket(SocketBinding {
                state: ConnectionState::Disconnected,
                paused_at: None,
                model: None,
                conn: Arc::new(tokio::sync::Mutex::new(None)),
            }),
            last_field: ZERO_VEC3,
            last_response: ZERO_VEC3,
            history_enabled,
            history: Vec::new(),
        }
    }

    pub(crate) fn embedded(
        id: MoleculeId,
        dt: f64,
        driver: Box<dyn EmbeddedDriver>,
        history_enabled: bool,
    ) -> Self {
        Self {
            id,
            dt,
            binding: DriverBinding::Embedded(EmbeddedBinding {
                driver: Arc::new(parking_lot::Mutex::new(driver)),
            }),
            last_field: ZERO_VEC3,
            last_response: ZERO_VEC3,
            history_enabled,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> MoleculeId {
        self.id
    }

    /// Simulation time step in atomic units.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub(crate) fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn mode(&self) -> DriverMode {
        match &self.binding {
            DriverBinding::Socket(_) => DriverMode::Socket,
            DriverBinding::Embedded(_) => DriverMode::Embedded,
        }
    }

    /// Connection state. Embedded molecules are always Connected.
    pub fn connection_state(&self) -> ConnectionState {
        match &self.binding {
            DriverBinding::Socket(b) => b.state,
            DriverBinding::Embedded(_) => ConnectionState::Connected,
        }
    }

    /// Model name advertised by the bound driver, if any.
    pub fn model_name(&self) -> Option<&str> {
        match &self.binding {
            DriverBinding::Socket(b) => b.model.as_deref(),
            DriverBinding::Embedded(_) => None,
        }
    }

    /// The most recent field sample delivered to the driver.
    pub fn last_field(&self) -> Vec3 {
        self.last_field
    }

    /// The most recently computed response. Guaranteed populated after a
    /// completed exchange.
    pub fn response(&self) -> Vec3 {
        self.last_response
    }

    pub fn history_enabled(&self) -> bool {
        self.history_enabled
    }

    /// Enable or disable diagnostics accumulation; disabling bounds memory
    /// for large ensembles. Existing records are kept.
    pub fn set_history_enabled(&mut self, enabled: bool) {
        self.history_enabled = enabled;
    }

    /// Accumulated diagnostic records, oldest first.
    pub fn history(&self) -> &[DiagnosticRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Append a diagnostic record if history is enabled.
    pub fn record_diagnostics(&mut self, sim_time: f64, data: Map<String, Value>) {
        if self.history_enabled {
            self.history.push(DiagnosticRecord {
                sim_time,
                received_at: Utc::now(),
                data,
            });
        }
    }

    pub(crate) fn set_exchange_result(&mut self, field: Vec3, response: Vec3) {
        self.last_field = field;
        self.last_response = response;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Inert;
    impl EmbeddedDriver for Inert {
        fn initialize(&mut self, _dt: f64, _molecule_id: MoleculeId) {}
        fn propagate(&mut self, _field: Vec3) {}
        fn response_vector(&self) -> Vec3 {
            ZERO_VEC3
        }
    }

    #[test]
    fn test_socket_molecule_starts_disconnected() {
        let m = Molecule::socket(0, 0.05, true);
        assert_eq!(m.mode(), DriverMode::Socket);
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
        assert_eq!(m.dt(), 0.05);
        assert_eq!(m.response(), ZERO_VEC3);
        assert!(m.model_name().is_none());
    }

    #[test]
    fn test_embedded_molecule_reports_connected() {
        let m = Molecule::embedded(1, 0.1, Box::new(Inert), true);
        assert_eq!(m.mode(), DriverMode::Embedded);
        assert_eq!(m.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_exchange_result_overwrites() {
        let mut m = Molecule::socket(0, 0.05, true);
        m.set_exchange_result([1.0, 2.0, 3.0], [0.1, 0.2, 0.3]);
        m.set_exchange_result([4.0, 5.0, 6.0], [0.4, 0.5, 0.6]);
        assert_eq!(m.last_field(), [4.0, 5.0, 6.0]);
        assert_eq!(m.response(), [0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_history_append_and_disable() {
        let mut m = Molecule::socket(0, 0.05, true);
        let mut data = Map::new();
        data.insert("R_au".to_string(), json!(2.0));
        m.record_diagnostics(0.05, data.clone());
        m.record_diagnostics(0.10, data.clone());
        assert_eq!(m.history().len(), 2);
        assert_eq!(m.history()[0].sim_time, 0.05);
        assert_eq!(m.history()[1].sim_time, 0.10);

        m.set_history_enabled(false);
        m.record_diagnostics(0.15, data);
        assert_eq!(m.history().len(), 2);

        m.clear_history();
        assert!(m.history().is_empty());
    }
}
