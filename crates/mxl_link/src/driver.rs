//! Embedded driver capability interface and the static driver registry.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::LinkError;
use crate::molecule::MoleculeId;
use crate::Vec3;

/// The capability surface every in-process driver implements.
///
/// The same contract is served over a socket by a driver process; embedded
/// mode simply skips the wire. All vectors are atomic units. The core never
/// inspects what the driver does between `propagate` and `response_vector`;
/// sub-stepping, macro-stepping, and checkpointing are the driver's own
/// business.
pub trait EmbeddedDriver: Send {
    /// Set the time step and assigned molecule id. Called once at
    /// registration (or per handshake for socket-served models); the heavy
    /// part of model setup belongs here, not in the constructor.
    fn initialize(&mut self, dt: f64, molecule_id: MoleculeId);

    /// Advance the model one EM step under the given effective field.
    fn propagate(&mut self, field: Vec3);

    /// The response vector after the last `propagate`: dP/dt of the
    /// classical dipole, `[dPx/dt, dPy/dt, dPz/dt]`.
    fn response_vector(&self) -> Vec3;

    /// Optional per-step diagnostics, recorded into the molecule's history.
    fn diagnostics(&self) -> Option<Map<String, Value>> {
        None
    }
}

/// Constructor signature for registry entries: JSON parameters in, boxed
/// driver out.
pub type DriverConstructor = fn(&Value) -> Result<Box<dyn EmbeddedDriver>, LinkError>;

/// Static registry mapping a driver-kind tag to a constructor.
///
/// Resolved at startup; there is no dynamic class loading. Driver crates
/// register their kinds once and registration order is irrelevant.
#[derive(Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under a kind tag, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, constructor: DriverConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kind tags, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Construct a driver of the given kind from JSON parameters.
    pub fn create(&self, kind: &str, params: &Value) -> Result<Box<dyn EmbeddedDriver>, LinkError> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| LinkError::UnknownDriverKind(kind.to_string()))?;
        constructor(params)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
