//! Hub: the server side of the protocol.
//!
//! Owns the listening sockets, the molecule registry, the accept loop, and
//! the per-step exchange/pause/reconnection policy. The only component that
//! knows whether this process is the MPI master or a worker rank.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::broadcast::{RankBroadcaster, RankRole, SingleRank};
use crate::config::HubConfig;
use crate::connection::{DriverConnection, DriverStream, ExchangeFailure, Handshake};
use crate::driver::EmbeddedDriver;
use crate::error::LinkError;
use crate::molecule::{
    ConnectionState, DiagnosticRecord, DriverBinding, DriverMode, Molecule, MoleculeId,
};
use crate::{Vec3, ZERO_VEC3};

/// How a single exchange resolved.
///
/// `Paused` and `Cancelled` are expected signals, not errors: `Paused`
/// tells the EM solver to hold simulation time for this step while the hub
/// waits for the driver to come back; `Cancelled` reports an operator
/// shutdown mid-exchange. Fatal conditions surface as [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExchangeOutcome {
    /// The driver produced a response for this step.
    Completed(Vec3),
    /// The driver is unreachable; simulation time must not advance for
    /// this site until a reconnect completes or the budget runs out.
    Paused,
    /// The hub was closed while the exchange was in flight.
    Cancelled,
}

/// Driver indirection requested at registration.
pub enum BindingSpec {
    /// The molecule starts Disconnected and waits for a socket driver to
    /// claim it via handshake.
    Socket,
    /// The driver lives in-process; `initialize(dt, id)` is called during
    /// registration.
    Embedded(Box<dyn EmbeddedDriver>),
}

/// Parameters for [`Hub::register_molecule`].
pub struct MoleculeSpec {
    /// Simulation time step in atomic units, echoed to socket drivers in
    /// the ASSIGN frame.
    pub dt: f64,
    pub binding: BindingSpec,
    /// Whether to accumulate per-step diagnostics (on by default).
    pub history: bool,
}

impl MoleculeSpec {
    pub fn socket(dt: f64) -> Self {
        Self {
            dt,
            binding: BindingSpec::Socket,
            history: true,
        }
    }

    pub fn embedded(dt: f64, driver: Box<dyn EmbeddedDriver>) -> Self {
        Self {
            dt,
            binding: BindingSpec::Embedded(driver),
            history: true,
        }
    }

    pub fn with_history(mut self, enabled: bool) -> Self {
        self.history = enabled;
        self
    }
}

struct Registry {
    molecules: BTreeMap<MoleculeId, Molecule>,
    next_id: MoleculeId,
}

struct HubInner {
    config: HubConfig,
    role: RankRole,
    broadcaster: Arc<dyn RankBroadcaster>,
    registry: RwLock<Registry>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    tcp_local_addr: OnceLock<SocketAddr>,
}

/// The connection hub mediating every field/response exchange for one EM
/// solver instance.
pub struct Hub {
    inner: Arc<HubInner>,
}

/// A lightweight handle to one registered molecule; the interface the EM
/// solver holds. Cloneable, cheap, and mode-agnostic: the solver cannot
/// tell socket from embedded through it.
#[derive(Clone)]
pub struct MoleculeHandle {
    inner: Arc<HubInner>,
    id: MoleculeId,
}

impl Hub {
    /// Bind listeners per `config` and start the accept loop.
    ///
    /// Worker-rank hubs own no sockets; they only mirror registrations and
    /// receive per-step vectors through the broadcaster.
    pub async fn open(
        config: HubConfig,
        role: RankRole,
        broadcaster: Arc<dyn RankBroadcaster>,
    ) -> Result<Self, LinkError> {
        let (shutdown_tx, _) = broadcast::channel(8);
        let inner = Arc::new(HubInner {
            config,
            role,
            broadcaster,
            registry: RwLock::new(Registry {
                molecules: BTreeMap::new(),
                next_id: 0,
            }),
            shutdown_tx,
            running: AtomicBool::new(true),
            tcp_local_addr: OnceLock::new(),
        });

        if role == RankRole::Master {
            if let Some(addr) = inner.config.tcp_addr {
                let listener = TcpListener::bind(addr).await.map_err(|source| {
                    LinkError::Bind {
                        addr: addr.to_string(),
                        source,
                    }
                })?;
                if let Ok(local) = listener.local_addr() {
                    let _ = inner.tcp_local_addr.set(local);
                    info!("hub listening on tcp://{local}");
                }
                tokio::spawn(run_tcp_accept(Arc::clone(&inner), listener));
            }
            #[cfg(unix)]
            if let Some(path) = inner.config.unix_path.clone() {
                // A stale socket file from a previous run would fail the bind.
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path).map_err(|source| LinkError::Bind {
                    addr: path.display().to_string(),
                    source,
                })?;
                info!("hub listening on unix:{}", path.display());
                tokio::spawn(run_unix_accept(Arc::clone(&inner), listener));
            }
        }

        Ok(Self { inner })
    }

    /// Open a serial (non-MPI) master hub.
    pub async fn open_single_rank(config: HubConfig) -> Result<Self, LinkError> {
        Self::open(config, RankRole::Master, Arc::new(SingleRank)).await
    }

    /// The actual TCP listen address, useful when the config requested an
    /// OS-assigned port.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.inner.tcp_local_addr.get().copied()
    }

    pub fn role(&self) -> RankRole {
        self.inner.role
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Allocate an id and create a molecule. Ids are handed out in
    /// registration order; socket drivers are expected to claim them in
    /// the same order (or ask for "any").
    pub fn register_molecule(&self, spec: MoleculeSpec) -> Result<MoleculeHandle, LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        let mut reg = self.inner.registry.write();
        let id = reg.next_id;
        reg.next_id += 1;
        let molecule = match spec.binding {
            BindingSpec::Socket => Molecule::socket(id, spec.dt, spec.history),
            BindingSpec::Embedded(mut driver) => {
                driver.initialize(spec.dt, id);
                Molecule::embedded(id, spec.dt, driver, spec.history)
            }
        };
        debug!(id, mode = ?molecule.mode(), "registered molecule");
        reg.molecules.insert(id, molecule);
        Ok(MoleculeHandle {
            inner: Arc::clone(&self.inner),
            id,
        })
    }

    /// Registered molecule ids in registration order.
    pub fn molecule_ids(&self) -> Vec<MoleculeId> {
        self.inner.registry.read().molecules.keys().copied().collect()
    }

    /// Block until every registered socket molecule has a bound, ready
    /// driver connection. Must be called once before the first simulation
    /// step. Trivially succeeds on worker ranks.
    pub async fn await_all_connected(&self, budget: Duration) -> Result<(), LinkError> {
        if self.inner.role == RankRole::Worker {
            return Ok(());
        }
        let start = Instant::now();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            if !self.is_running() {
                return Err(LinkError::NotRunning);
            }
            let pending = {
                let reg = self.inner.registry.read();
                reg.molecules
                    .values()
                    .filter(|m| {
                        m.mode() == DriverMode::Socket
                            && m.connection_state() != ConnectionState::Connected
                    })
                    .count()
            };
            if pending == 0 {
                return Ok(());
            }
            if start.elapsed() >= budget {
                return Err(LinkError::HandshakeTimeout { pending, budget });
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.latency) => {}
                _ = shutdown.recv() => return Err(LinkError::NotRunning),
            }
        }
    }

    /// The per-step primitive: deliver one field sample, get one response.
    /// See [`ExchangeOutcome`] for the pause/cancel contract.
    pub async fn exchange(
        &self,
        id: MoleculeId,
        field: Vec3,
        sim_time: f64,
    ) -> Result<ExchangeOutcome, LinkError> {
        self.inner.exchange(id, field, sim_time).await
    }

    /// Refresh a molecule's time step, for EM solvers that change cadence.
    /// Socket drivers pick the new value up at their next handshake.
    pub fn set_dt(&self, id: MoleculeId, dt: f64) -> Result<(), LinkError> {
        self.inner.with_molecule_mut(id, |m| m.set_dt(dt))
    }

    pub fn dt(&self, id: MoleculeId) -> Result<f64, LinkError> {
        self.inner.with_molecule(id, |m| m.dt())
    }

    pub fn connection_state(&self, id: MoleculeId) -> Result<ConnectionState, LinkError> {
        self.inner.with_molecule(id, |m| m.connection_state())
    }

    pub fn response(&self, id: MoleculeId) -> Result<Vec3, LinkError> {
        self.inner.with_molecule(id, |m| m.response())
    }

    pub fn history(&self, id: MoleculeId) -> Result<Vec<DiagnosticRecord>, LinkError> {
        self.inner.with_molecule(id, |m| m.history().to_vec())
    }

    pub fn set_history_enabled(&self, id: MoleculeId, enabled: bool) -> Result<(), LinkError> {
        self.inner
            .with_molecule_mut(id, |m| m.set_history_enabled(enabled))
    }

    /// Close all connections and the listeners. Idempotent; safe to call
    /// after a fatal error. In-flight exchanges resolve `Cancelled`.
    pub async fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());

        // Best-effort DISCONNECT to every bound driver, then unbind.
        let slots: Vec<_> = {
            let mut reg = self.inner.registry.write();
            reg.molecules
                .values_mut()
                .filter_map(|m| match &mut m.binding {
                    DriverBinding::Socket(b) => {
                        b.state = ConnectionState::Disconnected;
                        b.paused_at = None;
                        Some(Arc::clone(&b.conn))
                    }
                    DriverBinding::Embedded(_) => None,
                })
                .collect()
        };
        for slot in slots {
            if let Some(mut conn) = slot.lock().await.take() {
                conn.send_disconnect("hub closed").await;
            }
        }

        #[cfg(unix)]
        if let Some(path) = &self.inner.config.unix_path {
            let _ = std::fs::remove_file(path);
        }
        info!("hub closed");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            let _ = self.inner.shutdown_tx.send(());
        }
    }
}

impl MoleculeHandle {
    pub fn id(&self) -> MoleculeId {
        self.id
    }

    /// Deliver the EM field sample for this step and wait for the response.
    pub async fn field(&self, field: Vec3, sim_time: f64) -> Result<ExchangeOutcome, LinkError> {
        self.inner.exchange(self.id, field, sim_time).await
    }

    /// The most recently computed response; populated after `field`
    /// resolves `Completed`.
    pub fn response(&self) -> Result<Vec3, LinkError> {
        self.inner.with_molecule(self.id, |m| m.response())
    }

    pub fn connection_state(&self) -> Result<ConnectionState, LinkError> {
        self.inner.with_molecule(self.id, |m| m.connection_state())
    }

    pub fn mode(&self) -> Result<DriverMode, LinkError> {
        self.inner.with_molecule(self.id, |m| m.mode())
    }

    pub fn dt(&self) -> Result<f64, LinkError> {
        self.inner.with_molecule(self.id, |m| m.dt())
    }

    pub fn set_dt(&self, dt: f64) -> Result<(), LinkError> {
        self.inner.with_molecule_mut(self.id, |m| m.set_dt(dt))
    }

    pub fn history(&self) -> Result<Vec<DiagnosticRecord>, LinkError> {
        self.inner.with_molecule(self.id, |m| m.history().to_vec())
    }

    /// Append a diagnostic record, as the embedded-driver call path does.
    pub fn record_diagnostics(
        &self,
        sim_time: f64,
        data: Map<String, Value>,
    ) -> Result<(), LinkError> {
        self.inner
            .with_molecule_mut(self.id, |m| m.record_diagnostics(sim_time, data))
    }
}

impl HubInner {
    fn with_molecule<T>(
        &self,
        id: MoleculeId,
        f: impl FnOnce(&Molecule) -> T,
    ) -> Result<T, LinkError> {
        let reg = self.registry.read();
        reg.molecules
            .get(&id)
            .map(f)
            .ok_or(LinkError::UnknownMolecule(id))
    }

    fn with_molecule_mut<T>(
        &self,
        id: MoleculeId,
        f: impl FnOnce(&mut Molecule) -> T,
    ) -> Result<T, LinkError> {
        let mut reg = self.registry.write();
        reg.molecules
            .get_mut(&id)
            .map(f)
            .ok_or(LinkError::UnknownMolecule(id))
    }

    async fn exchange(
        &self,
        id: MoleculeId,
        field: Vec3,
        sim_time: f64,
    ) -> Result<ExchangeOutcome, LinkError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(LinkError::NotRunning);
        }
        if self.role == RankRole::Worker {
            return self.worker_exchange(id, sim_time);
        }

        enum Path {
            Embedded(Arc<parking_lot::Mutex<Box<dyn EmbeddedDriver>>>),
            Socket,
        }
        let path = self.with_molecule(id, |m| match &m.binding {
            DriverBinding::Embedded(b) => Path::Embedded(Arc::clone(&b.driver)),
            DriverBinding::Socket(_) => Path::Socket,
        })?;

        match path {
            Path::Embedded(driver) => {
                let (amplitude, diagnostics) = {
                    let mut driver = driver.lock();
                    driver.propagate(field);
                    (driver.response_vector(), driver.diagnostics())
                };
                let (field, amplitude) = self.fan_out(field, amplitude);
                self.commit(id, field, amplitude, diagnostics, sim_time);
                Ok(ExchangeOutcome::Completed(amplitude))
            }
            Path::Socket => self.socket_exchange(id, field, sim_time).await,
        }
    }

    /// Worker ranks never touch sockets: both vectors arrive through the
    /// collective, keeping the per-step call sequence identical to the
    /// master's.
    fn worker_exchange(&self, id: MoleculeId, sim_time: f64) -> Result<ExchangeOutcome, LinkError> {
        self.with_molecule(id, |_| ())?;
        let (field, amplitude) = self.fan_out(ZERO_VEC3, ZERO_VEC3);
        self.commit(id, field, amplitude, None, sim_time);
        Ok(ExchangeOutcome::Completed(amplitude))
    }

    /// One paired field+response collective per completed exchange.
    ///
    /// Both calls happen together, only once an exchange has actually
    /// produced a response. Pauses and retries stay invisible to worker
    /// ranks: they simply block in the collective until the master's step
    /// resolves, and no collective can ever be mispaired by a retry.
    fn fan_out(&self, field: Vec3, amplitude: Vec3) -> (Vec3, Vec3) {
        let field = self.broadcaster.broadcast_field(field);
        let amplitude = self.broadcaster.broadcast_response(amplitude);
        (field, amplitude)
    }

    async fn socket_exchange(
        &self,
        id: MoleculeId,
        field: Vec3,
        sim_time: f64,
    ) -> Result<ExchangeOutcome, LinkError> {
        let timeout = self.config.timeout;
        let latency = self.config.latency;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(ExchangeOutcome::Cancelled);
            }
            let (slot, state, paused_at) = self.socket_view(id)?;
            match state {
                ConnectionState::Connected => {
                    let mut guard = slot.lock().await;
                    let Some(conn) = guard.as_mut() else {
                        // Claimed, ASSIGN still in flight; check back shortly.
                        drop(guard);
                        tokio::select! {
                            _ = tokio::time::sleep(latency) => continue,
                            _ = shutdown.recv() => return Ok(ExchangeOutcome::Cancelled),
                        }
                    };

                    if let Err(e) = conn.send_field(sim_time, field).await {
                        warn!(molecule = id, "field send failed: {e}");
                        guard.take();
                        drop(guard);
                        self.pause(id);
                        return Ok(ExchangeOutcome::Paused);
                    }

                    // On shutdown the unfinished read is dropped; close()
                    // sweeps the slot afterwards and sends the DISCONNECT.
                    let result = tokio::select! {
                        r = conn.await_amp(timeout) => r,
                        _ = shutdown.recv() => return Ok(ExchangeOutcome::Cancelled),
                    };
                    match result {
                        Ok(reply) => {
                            drop(guard);
                            let (field, amplitude) = self.fan_out(field, reply.amplitude);
                            self.commit(id, field, amplitude, reply.diagnostics, sim_time);
                            return Ok(ExchangeOutcome::Completed(amplitude));
                        }
                        Err(failure) => {
                            // Discard the connection whole: a late AMP on
                            // this socket must never reach a later step.
                            guard.take();
                            drop(guard);
                            self.pause(id);
                            match failure {
                                ExchangeFailure::TimedOut => {
                                    warn!(molecule = id, "driver silent past {timeout:?}, pausing")
                                }
                                ExchangeFailure::PeerClosed => {
                                    warn!(molecule = id, "driver connection closed, pausing")
                                }
                                ExchangeFailure::Protocol(e) => {
                                    warn!(molecule = id, "driver protocol error, pausing: {e}")
                                }
                            }
                            return Ok(ExchangeOutcome::Paused);
                        }
                    }
                }
                ConnectionState::Paused => {
                    let waited = paused_at.map(|t| t.elapsed()).unwrap_or_default();
                    if waited >= timeout {
                        return Err(LinkError::DriverLost { id, waited });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(latency) => {}
                        _ = shutdown.recv() => return Ok(ExchangeOutcome::Cancelled),
                    }
                }
                ConnectionState::Disconnected => {
                    // Never connected (or unbound at close): start the
                    // reconnection budget now and wait like a pause.
                    self.pause(id);
                }
            }
        }
    }

    fn socket_view(
        &self,
        id: MoleculeId,
    ) -> Result<
        (
            Arc<tokio::sync::Mutex<Option<DriverConnection>>>,
            ConnectionState,
            Option<Instant>,
        ),
        LinkError,
    > {
        let reg = self.registry.read();
        let m = reg.molecules.get(&id).ok_or(LinkError::UnknownMolecule(id))?;
        match &m.binding {
            DriverBinding::Socket(b) => Ok((Arc::clone(&b.conn), b.state, b.paused_at)),
            DriverBinding::Embedded(_) => Err(LinkError::UnknownMolecule(id)),
        }
    }

    /// Connected → Paused (or Disconnected → Paused), keeping the earliest
    /// pause instant so the reconnection budget cannot be reset by repeated
    /// failures within one outage.
    fn pause(&self, id: MoleculeId) {
        let mut reg = self.registry.write();
        if let Some(m) = reg.molecules.get_mut(&id) {
            if let DriverBinding::Socket(b) = &mut m.binding {
                b.state = ConnectionState::Paused;
                b.paused_at.get_or_insert_with(Instant::now);
            }
        }
    }

    fn commit(
        &self,
        id: MoleculeId,
        field: Vec3,
        amplitude: Vec3,
        diagnostics: Option<Map<String, Value>>,
        sim_time: f64,
    ) {
        let mut reg = self.registry.write();
        if let Some(m) = reg.molecules.get_mut(&id) {
            m.set_exchange_result(field, amplitude);
            if let Some(data) = diagnostics {
                m.record_diagnostics(sim_time, data);
            }
        }
    }

    /// Resolve and claim a molecule for an incoming handshake. Serialized
    /// behind the registry lock so two concurrent handshakes cannot bind
    /// the same id.
    fn claim_molecule(&self, requested: i32, model: &str) -> Result<Claim, String> {
        let mut reg = self.registry.write();
        let id = if requested >= 0 {
            requested as MoleculeId
        } else {
            reg.molecules
                .iter()
                .find(|(_, m)| match &m.binding {
                    DriverBinding::Socket(b) => b.state != ConnectionState::Connected,
                    DriverBinding::Embedded(_) => false,
                })
                .map(|(id, _)| *id)
                .ok_or_else(|| "no unbound socket molecule available".to_string())?
        };
        let Some(m) = reg.molecules.get_mut(&id) else {
            return Err(format!("no molecule with id {id} is registered"));
        };
        let dt = m.dt();
        match &mut m.binding {
            DriverBinding::Embedded(_) => Err(format!("molecule {id} is not socket-driven")),
            DriverBinding::Socket(b) => {
                if b.state == ConnectionState::Connected {
                    return Err(format!("molecule {id} already has a bound driver"));
                }
                let prev_state = b.state;
                let prev_paused_at = b.paused_at;
                b.state = ConnectionState::Connected;
                b.paused_at = None;
                b.model = Some(model.to_string());
                Ok(Claim {
                    id,
                    dt,
                    slot: Arc::clone(&b.conn),
                    prev_state,
                    prev_paused_at,
                })
            }
        }
    }

    fn revert_claim(&self, claim: &Claim) {
        let mut reg = self.registry.write();
        if let Some(m) = reg.molecules.get_mut(&claim.id) {
            if let DriverBinding::Socket(b) = &mut m.binding {
                b.state = claim.prev_state;
                b.paused_at = claim.prev_paused_at;
            }
        }
    }
}

struct Claim {
    id: MoleculeId,
    dt: f64,
    slot: Arc<tokio::sync::Mutex<Option<DriverConnection>>>,
    prev_state: ConnectionState,
    prev_paused_at: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Accept path
// ---------------------------------------------------------------------------

async fn run_tcp_accept(inner: Arc<HubInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let inner = Arc::clone(&inner);
                    tokio::spawn(handle_handshake(
                        inner,
                        DriverStream::Tcp(stream),
                        peer.to_string(),
                    ));
                }
                Err(e) => warn!("tcp accept failed: {e}"),
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("tcp accept loop stopped");
}

#[cfg(unix)]
async fn run_unix_accept(inner: Arc<HubInner>, listener: UnixListener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(handle_handshake(
                        inner,
                        DriverStream::Unix(stream),
                        "unix".to_string(),
                    ));
                }
                Err(e) => warn!("unix accept failed: {e}"),
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("unix accept loop stopped");
}

/// Run one connection's handshake: read INIT, claim the molecule, answer
/// ASSIGN, park the bound connection in the molecule's slot. Rejection
/// closes only this connection; the hub keeps listening.
async fn handle_handshake(inner: Arc<HubInner>, stream: DriverStream, peer: String) {
    let mut hs = Handshake::new(stream, peer.clone());
    let init = tokio::time::timeout(inner.config.timeout, hs.read_init()).await;
    let (requested, model) = match init {
        Ok(Ok(init)) => init,
        Ok(Err(e)) => {
            warn!(peer = %peer, "malformed INIT: {e}");
            hs.reject("malformed INIT").await;
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "handshake timed out");
            hs.reject("handshake timed out").await;
            return;
        }
    };

    let claim = match inner.claim_molecule(requested, &model) {
        Ok(claim) => claim,
        Err(reason) => {
            info!(peer = %peer, requested, "rejecting handshake: {reason}");
            hs.reject(&reason).await;
            return;
        }
    };

    match hs.accept(claim.id, claim.dt).await {
        Ok(conn) => {
            info!(peer = %peer, molecule = claim.id, model = %model, "driver bound");
            claim.slot.lock().await.replace(conn);
        }
        Err(e) => {
            warn!(peer = %peer, molecule = claim.id, "ASSIGN write failed: {e}");
            inner.revert_claim(&claim);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTimesTwo {
        dt: f64,
        id: MoleculeId,
        t: f64,
        last: Vec3,
    }

    impl EchoTimesTwo {
        fn new() -> Self {
            Self {
                dt: 0.0,
                id: 0,
                t: 0.0,
                last: ZERO_VEC3,
            }
        }
    }

    impl EmbeddedDriver for EchoTimesTwo {
        fn initialize(&mut self, dt: f64, molecule_id: MoleculeId) {
            self.dt = dt;
            self.id = molecule_id;
        }
        fn propagate(&mut self, field: Vec3) {
            self.last = field;
            self.t += self.dt;
        }
        fn response_vector(&self) -> Vec3 {
            [self.last[0] * 2.0, self.last[1] * 2.0, self.last[2] * 2.0]
        }
        fn diagnostics(&self) -> Option<Map<String, Value>> {
            let mut map = Map::new();
            map.insert("time_au".to_string(), json!(self.t));
            Some(map)
        }
    }

    #[tokio::test]
    async fn test_registration_assigns_monotonic_ids() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        let a = hub.register_molecule(MoleculeSpec::socket(0.05)).unwrap();
        let b = hub.register_molecule(MoleculeSpec::socket(0.05)).unwrap();
        let c = hub
            .register_molecule(MoleculeSpec::embedded(0.05, Box::new(EchoTimesTwo::new())))
            .unwrap();
        assert_eq!((a.id(), b.id(), c.id()), (0, 1, 2));
        assert_eq!(hub.molecule_ids(), vec![0, 1, 2]);
        assert_eq!(a.connection_state().unwrap(), ConnectionState::Disconnected);
        assert_eq!(c.connection_state().unwrap(), ConnectionState::Connected);
        hub.close().await;
    }

    #[tokio::test]
    async fn test_embedded_exchange_end_to_end() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        let molecule = hub
            .register_molecule(MoleculeSpec::embedded(0.05, Box::new(EchoTimesTwo::new())))
            .unwrap();

        let outcome = molecule.field([0.0, 0.0, 1e-4], 0.0).await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Completed([0.0, 0.0, 2e-4]));
        assert_eq!(molecule.response().unwrap(), [0.0, 0.0, 2e-4]);

        // The driver's diagnostics landed in the history.
        let history = molecule.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data["time_au"], json!(0.05));
        hub.close().await;
    }

    #[tokio::test]
    async fn test_embedded_history_disabled() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        let molecule = hub
            .register_molecule(
                MoleculeSpec::embedded(0.05, Box::new(EchoTimesTwo::new())).with_history(false),
            )
            .unwrap();
        molecule.field([1.0, 0.0, 0.0], 0.0).await.unwrap();
        assert!(molecule.history().unwrap().is_empty());
        hub.close().await;
    }

    #[tokio::test]
    async fn test_exchange_unknown_molecule() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        match hub.exchange(42, ZERO_VEC3, 0.0).await {
            Err(LinkError::UnknownMolecule(42)) => {}
            other => panic!("expected UnknownMolecule, got {other:?}"),
        }
        hub.close().await;
    }

    #[tokio::test]
    async fn test_await_all_connected_times_out() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        hub.register_molecule(MoleculeSpec::socket(0.05)).unwrap();
        match hub.await_all_connected(Duration::from_millis(50)).await {
            Err(LinkError::HandshakeTimeout { pending: 1, .. }) => {}
            other => panic!("expected HandshakeTimeout, got {other:?}"),
        }
        hub.close().await;
    }

    #[tokio::test]
    async fn test_await_all_connected_no_sockets() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        hub.register_molecule(MoleculeSpec::embedded(0.1, Box::new(EchoTimesTwo::new())))
            .unwrap();
        hub.await_all_connected(Duration::from_millis(10))
            .await
            .unwrap();
        hub.close().await;
    }

    #[tokio::test]
    async fn test_close_cancels_inflight_exchange() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        let molecule = hub.register_molecule(MoleculeSpec::socket(0.05)).unwrap();

        let waiter = {
            let molecule = molecule.clone();
            tokio::spawn(async move { molecule.field([0.0, 0.0, 1.0], 0.0).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.close().await;

        match waiter.await.unwrap() {
            Ok(ExchangeOutcome::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert!(!hub.is_running());
        // Idempotent.
        hub.close().await;
    }

    #[tokio::test]
    async fn test_register_after_close_fails() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        hub.close().await;
        match hub.register_molecule(MoleculeSpec::socket(0.05)) {
            Err(LinkError::NotRunning) => {}
            other => panic!("expected NotRunning, got {:?}", other.map(|h| h.id())),
        }
    }

    #[tokio::test]
    async fn test_set_dt_refreshes() {
        let hub = Hub::open_single_rank(HubConfig::loopback()).await.unwrap();
        let molecule = hub.register_molecule(MoleculeSpec::socket(0.05)).unwrap();
        assert_eq!(molecule.dt().unwrap(), 0.05);
        molecule.set_dt(0.025).unwrap();
        assert_eq!(hub.dt(molecule.id()).unwrap(), 0.025);
        hub.close().await;
    }
}
