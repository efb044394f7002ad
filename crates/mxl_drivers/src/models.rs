//! Reference driver models.
//!
//! These are templates and test fixtures, not physics: a real model (a
//! two-level system, an Ehrenfest propagator, an ab-initio engine) layers
//! its own dynamics on the same [`EmbeddedDriver`] surface.

use serde_json::{json, Map, Value};

use mxl_link::driver::{DriverRegistry, EmbeddedDriver};
use mxl_link::error::LinkError;
use mxl_link::molecule::MoleculeId;
use mxl_link::{Vec3, ZERO_VEC3};

/// A model with no response: always answers the zero vector. The minimal
/// skeleton to copy when writing a new driver.
#[derive(Debug, Clone, Default)]
pub struct NullModel {
    dt: f64,
    molecule_id: MoleculeId,
}

impl NullModel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddedDriver for NullModel {
    fn initialize(&mut self, dt: f64, molecule_id: MoleculeId) {
        self.dt = dt;
        self.molecule_id = molecule_id;
    }

    fn propagate(&mut self, _field: Vec3) {}

    fn response_vector(&self) -> Vec3 {
        ZERO_VEC3
    }
}

/// Echoes the field scaled by a constant gain. Useful as a loopback test
/// driver: gain `2.0` doubles the field, gain `-1.0` negates it.
#[derive(Debug, Clone)]
pub struct ScaledEcho {
    gain: f64,
    dt: f64,
    molecule_id: MoleculeId,
    t: f64,
    last_field: Vec3,
}

impl ScaledEcho {
    pub fn new(gain: f64) -> Self {
        Self {
            gain,
            dt: 0.0,
            molecule_id: 0,
            t: 0.0,
            last_field: ZERO_VEC3,
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl EmbeddedDriver for ScaledEcho {
    fn initialize(&mut self, dt: f64, molecule_id: MoleculeId) {
        self.dt = dt;
        self.molecule_id = molecule_id;
        self.t = 0.0;
    }

    fn propagate(&mut self, field: Vec3) {
        self.last_field = field;
        self.t += self.dt;
    }

    fn response_vector(&self) -> Vec3 {
        [
            self.last_field[0] * self.gain,
            self.last_field[1] * self.gain,
            self.last_field[2] * self.gain,
        ]
    }

    fn diagnostics(&self) -> Option<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("time_au".to_string(), json!(self.t));
        map.insert("gain".to_string(), json!(self.gain));
        Some(map)
    }
}

/// Staged-step wrapper: propose on a deep copy, adopt atomically.
///
/// `stage_step` runs the wrapped model one step on a clone, leaving the
/// committed state untouched; `commit_step` adopts the proposal and yields
/// the staged amplitude. A driver that sub-steps, retries, or checkpoints
/// between proposal and adoption keeps its committed state consistent even
/// if the exchange around it falls apart.
#[derive(Debug, Clone)]
pub struct StagedModel<M: EmbeddedDriver + Clone> {
    committed: M,
    preview: Option<M>,
    pending_amp: Option<Vec3>,
    last_amp: Vec3,
}

impl<M: EmbeddedDriver + Clone> StagedModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            committed: model,
            preview: None,
            pending_amp: None,
            last_amp: ZERO_VEC3,
        }
    }

    /// The committed (last adopted) model state.
    pub fn inner(&self) -> &M {
        &self.committed
    }

    pub fn into_inner(self) -> M {
        self.committed
    }

    /// Propose one step under `field` without touching committed state.
    pub fn stage_step(&mut self, field: Vec3) {
        let mut work = self.committed.clone();
        work.propagate(field);
        self.pending_amp = Some(work.response_vector());
        self.preview = Some(work);
    }

    /// Whether a staged result is waiting to be committed.
    pub fn have_result(&self) -> bool {
        self.preview.is_some() && self.pending_amp.is_some()
    }

    /// Adopt the staged state and return its amplitude; zero vector if
    /// nothing was staged.
    pub fn commit_step(&mut self) -> Vec3 {
        match (self.preview.take(), self.pending_amp.take()) {
            (Some(preview), Some(amp)) => {
                self.committed = preview;
                self.last_amp = amp;
                amp
            }
            _ => {
                self.preview = None;
                self.pending_amp = None;
                ZERO_VEC3
            }
        }
    }
}

impl<M: EmbeddedDriver + Clone> EmbeddedDriver for StagedModel<M> {
    fn initialize(&mut self, dt: f64, molecule_id: MoleculeId) {
        self.committed.initialize(dt, molecule_id);
        self.preview = None;
        self.pending_amp = None;
    }

    fn propagate(&mut self, field: Vec3) {
        self.stage_step(field);
        self.commit_step();
    }

    fn response_vector(&self) -> Vec3 {
        self.last_amp
    }

    fn diagnostics(&self) -> Option<Map<String, Value>> {
        self.committed.diagnostics()
    }
}

/// The static registry of built-in driver kinds, keyed by the tags an EM
/// adapter selects at startup.
pub fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register("null", make_null);
    registry.register("echo", make_echo);
    registry
}

fn make_null(_params: &Value) -> Result<Box<dyn EmbeddedDriver>, LinkError> {
    Ok(Box::new(NullModel::new()))
}

fn make_echo(params: &Value) -> Result<Box<dyn EmbeddedDriver>, LinkError> {
    let gain = match params.get("gain") {
        None => 1.0,
        Some(v) => v.as_f64().ok_or_else(|| {
            LinkError::DriverInit(format!("'gain' must be a number, got {v}"))
        })?,
    };
    Ok(Box::new(ScaledEcho::new(gain)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
