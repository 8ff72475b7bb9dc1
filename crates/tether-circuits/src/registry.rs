//! Process-wide table of live and disconnected circuits.
//!
//! Both tables sit behind one mutex, and every mutation (register,
//! disconnect, connect, terminate, evict, fault removal) takes it exactly
//! once. A circuit leaves the disconnected pool by a single `remove` under
//! that lock, so a reconnect and an eviction can never both claim it.
//! Disposal messages are sent only after the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tether_core::{CircuitId, ConnectionId, HandleId, RedactionPolicy};
use tether_settings::{CircuitSettings, TetherSettings};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::HandleTable;
use crate::circuit::{Circuit, CircuitConfig, CircuitFault, CircuitOptions, ClientProxy};
use crate::error::{CircuitError, Result};
use crate::handler::CircuitHandlers;
use crate::metrics::{
    CIRCUIT_EVICTIONS_TOTAL, CIRCUIT_RECONNECTS_TOTAL, CIRCUITS_ACTIVE, CIRCUITS_DISCONNECTED,
};
use crate::renderer::{RendererFactory, StartRequest};
use crate::session_id::{SessionId, SessionIdCodec};

/// Retention policy plus the options handed to every new circuit.
#[derive(Clone, Debug)]
pub struct RegistryOptions {
    /// Disconnected circuits kept before the least promising are evicted.
    pub max_retained: usize,
    /// How long a disconnected circuit stays resumable.
    pub retention: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Per-circuit options.
    pub circuit: CircuitOptions,
}

impl From<&CircuitSettings> for RegistryOptions {
    fn from(s: &CircuitSettings) -> Self {
        Self {
            max_retained: s.disconnected_circuit_max_retained,
            retention: s.retention_period(),
            sweep_interval: s.eviction_sweep_interval(),
            circuit: CircuitOptions::from(s),
        }
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from(&CircuitSettings::default())
    }
}

struct ConnectedEntry {
    circuit: Circuit,
    connection_id: ConnectionId,
    page_hidden_at: Option<Instant>,
}

struct DisconnectedEntry {
    circuit: Circuit,
    disconnected_at: Instant,
    page_hidden_at: Option<Instant>,
}

impl DisconnectedEntry {
    /// Sort key for capacity eviction; smallest goes first. Hidden pages
    /// rank before visible ones, then by when they went hidden, then by
    /// disconnect time.
    fn eviction_rank(&self) -> (bool, Option<Instant>, Instant) {
        (
            self.page_hidden_at.is_none(),
            self.page_hidden_at,
            self.disconnected_at,
        )
    }
}

#[derive(Default)]
struct Tables {
    connected: HashMap<CircuitId, ConnectedEntry>,
    disconnected: HashMap<CircuitId, DisconnectedEntry>,
}

#[derive(Clone, Copy)]
enum EvictionReason {
    Expired,
    Capacity,
}

impl EvictionReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Capacity => "capacity",
        }
    }
}

/// Owner of every circuit in the process.
pub struct CircuitRegistry {
    codec: SessionIdCodec,
    options: RegistryOptions,
    factory: Arc<dyn RendererFactory>,
    handlers: CircuitHandlers,
    handles: Arc<HandleTable>,
    tables: Mutex<Tables>,
    faults_tx: mpsc::UnboundedSender<CircuitFault>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<CircuitFault>>>,
}

impl CircuitRegistry {
    /// Empty registry.
    pub fn new(
        codec: SessionIdCodec,
        options: RegistryOptions,
        factory: Arc<dyn RendererFactory>,
        handlers: CircuitHandlers,
    ) -> Self {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Self {
            codec,
            options,
            factory,
            handlers,
            handles: Arc::new(HandleTable::new()),
            tables: Mutex::new(Tables::default()),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
        }
    }

    /// Registry configured from loaded settings: retention and circuit
    /// options from `circuits`, secret redaction from `logging`.
    pub fn from_settings(
        settings: &TetherSettings,
        factory: Arc<dyn RendererFactory>,
        handlers: CircuitHandlers,
    ) -> Self {
        Self::new(
            SessionIdCodec::new(RedactionPolicy::from(&settings.logging)),
            RegistryOptions::from(&settings.circuits),
            factory,
            handlers,
        )
    }

    /// Session id codec.
    pub fn codec(&self) -> &SessionIdCodec {
        &self.codec
    }

    /// Handle table shared with connections.
    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Registry options.
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Whether `secret` is a well-formed, authentic session secret. Says
    /// nothing about whether its circuit still exists.
    pub fn is_valid_secret(&self, secret: &str) -> bool {
        self.codec.try_parse(secret).is_some()
    }

    /// Create a circuit bound to `client`, run its startup, and register it.
    ///
    /// A circuit whose startup fails is disposed and never registered.
    pub async fn create_and_start(
        &self,
        client: ClientProxy,
        request: StartRequest,
        cancel: CancellationToken,
    ) -> Result<(Circuit, SessionId)> {
        let session = self.codec.generate()?;
        let connection_id = client.connection_id().clone();
        let config = CircuitConfig {
            id: session.id().clone(),
            handle_id: HandleId::new(),
            options: self.options.circuit.clone(),
            handlers: self.handlers.clone(),
            handles: Arc::clone(&self.handles),
            faults: self.faults_tx.clone(),
        };
        let renderer = self.factory.create(session.id());
        let circuit = Circuit::spawn(config, renderer);

        circuit.initialize(client, request, cancel).await?;
        self.handles
            .bind(circuit.handle_id().clone(), circuit.clone());
        self.register(circuit.clone(), connection_id)?;

        if circuit.is_terminated() {
            // faulted between startup and registration
            let _ = self.remove(circuit.id());
            return Err(CircuitError::Terminated);
        }
        Ok((circuit, session))
    }

    /// Publish an initialized circuit as connected to `connection_id`.
    pub fn register(&self, circuit: Circuit, connection_id: ConnectionId) -> Result<()> {
        let mut tables = self.tables.lock();
        let id = circuit.id().clone();
        if tables.connected.contains_key(&id) || tables.disconnected.contains_key(&id) {
            return Err(CircuitError::AlreadyRegistered(id));
        }
        debug!(circuit_id = %id, connection_id = %connection_id, "circuit registered");
        let _ = tables.connected.insert(
            id,
            ConnectedEntry {
                circuit,
                connection_id,
                page_hidden_at: None,
            },
        );
        record_gauges(&tables);
        Ok(())
    }

    /// Move a circuit into the disconnected pool.
    ///
    /// Only acts when `connection_id` is still the circuit's connection, so
    /// a late notice from a superseded connection is harmless. Returns
    /// whether the circuit was parked.
    pub async fn disconnect(&self, circuit_id: &CircuitId, connection_id: &ConnectionId) -> bool {
        let (circuit, evicted) = {
            let mut tables = self.tables.lock();
            let bound = tables
                .connected
                .get(circuit_id)
                .is_some_and(|e| &e.connection_id == connection_id);
            if !bound {
                debug!(
                    circuit_id = %circuit_id,
                    connection_id = %connection_id,
                    "ignoring disconnect for a connection that is no longer bound"
                );
                return false;
            }
            let Some(entry) = tables.connected.remove(circuit_id) else {
                return false;
            };
            let circuit = entry.circuit.clone();
            let _ = tables.disconnected.insert(
                circuit_id.clone(),
                DisconnectedEntry {
                    circuit: entry.circuit,
                    disconnected_at: Instant::now(),
                    page_hidden_at: entry.page_hidden_at,
                },
            );
            let evicted = self.evict_over_capacity(&mut tables);
            record_gauges(&tables);
            (circuit, evicted)
        };

        info!(circuit_id = %circuit_id, connection_id = %connection_id, "circuit parked for reconnection");
        let _ = circuit.disconnect(connection_id.clone()).await;
        self.retire(evicted).await;
        true
    }

    /// Reclaim a disconnected circuit for `client`.
    ///
    /// Returns `None` when the secret is invalid, the circuit is unknown or
    /// still connected, or its retention period has passed. The caller
    /// should then start a new circuit.
    pub async fn connect(&self, secret: &str, client: ClientProxy) -> Option<Circuit> {
        let Some(session) = self.codec.try_parse(secret) else {
            counter!(CIRCUIT_RECONNECTS_TOTAL, "outcome" => "invalid").increment(1);
            return None;
        };
        let id = session.id();
        let connection_id = client.connection_id().clone();

        let claimed = {
            let mut tables = self.tables.lock();
            match tables.disconnected.remove(id) {
                None => {
                    debug!(
                        circuit_id = %id,
                        still_connected = tables.connected.contains_key(id),
                        "no disconnected circuit to reclaim"
                    );
                    Err(None)
                }
                Some(entry)
                    if Instant::now().saturating_duration_since(entry.disconnected_at)
                        > self.options.retention =>
                {
                    record_gauges(&tables);
                    Err(Some(entry.circuit))
                }
                Some(entry) => {
                    let circuit = entry.circuit.clone();
                    let _ = tables.connected.insert(
                        id.clone(),
                        ConnectedEntry {
                            circuit: entry.circuit,
                            connection_id: connection_id.clone(),
                            page_hidden_at: entry.page_hidden_at,
                        },
                    );
                    record_gauges(&tables);
                    Ok(circuit)
                }
            }
        };

        let circuit = match claimed {
            Ok(circuit) => circuit,
            Err(expired) => {
                if let Some(circuit) = expired {
                    info!(circuit_id = %id, "circuit expired before reconnect");
                    record_eviction(EvictionReason::Expired);
                    self.retire(vec![circuit]).await;
                    counter!(CIRCUIT_RECONNECTS_TOTAL, "outcome" => "expired").increment(1);
                } else {
                    counter!(CIRCUIT_RECONNECTS_TOTAL, "outcome" => "unknown").increment(1);
                }
                return None;
            }
        };

        match circuit.reconnect(client).await {
            Ok(()) => {
                counter!(CIRCUIT_RECONNECTS_TOTAL, "outcome" => "success").increment(1);
                Some(circuit)
            }
            Err(e) => {
                warn!(circuit_id = %id, error = %e, "reconnect failed, terminating circuit");
                {
                    let mut tables = self.tables.lock();
                    if tables
                        .connected
                        .get(id)
                        .is_some_and(|e| e.connection_id == connection_id)
                    {
                        let _ = tables.connected.remove(id);
                    }
                    record_gauges(&tables);
                }
                self.retire(vec![circuit]).await;
                counter!(CIRCUIT_RECONNECTS_TOTAL, "outcome" => "failed").increment(1);
                None
            }
        }
    }

    /// Terminate the circuit a secret belongs to. Returns whether one was found.
    pub async fn terminate(&self, secret: &str) -> bool {
        match self.codec.try_parse(secret) {
            Some(session) => self.terminate_id(session.id()).await,
            None => false,
        }
    }

    /// Terminate a circuit by id, wherever it is.
    pub async fn terminate_id(&self, circuit_id: &CircuitId) -> bool {
        match self.remove(circuit_id) {
            Some(circuit) => {
                info!(circuit_id = %circuit_id, "terminating circuit");
                self.retire(vec![circuit]).await;
                true
            }
            None => false,
        }
    }

    fn remove(&self, circuit_id: &CircuitId) -> Option<Circuit> {
        let mut tables = self.tables.lock();
        let circuit = match tables.connected.remove(circuit_id) {
            Some(entry) => Some(entry.circuit),
            None => tables.disconnected.remove(circuit_id).map(|e| e.circuit),
        };
        record_gauges(&tables);
        circuit
    }

    /// Record whether the page owning a circuit is visible. The first time a
    /// page goes hidden is kept until it becomes visible again.
    pub fn set_page_visibility(&self, secret: &str, visible: bool) -> bool {
        let Some(session) = self.codec.try_parse(secret) else {
            return false;
        };
        let id = session.id();
        let now = Instant::now();
        let update = |slot: &mut Option<Instant>| {
            if visible {
                *slot = None;
            } else if slot.is_none() {
                *slot = Some(now);
            }
        };

        let mut tables = self.tables.lock();
        if let Some(entry) = tables.connected.get_mut(id) {
            update(&mut entry.page_hidden_at);
        } else if let Some(entry) = tables.disconnected.get_mut(id) {
            update(&mut entry.page_hidden_at);
        } else {
            return false;
        }
        debug!(circuit_id = %id, visible, "page visibility updated");
        true
    }

    /// Evict every disconnected circuit past its retention period, then trim
    /// the pool to capacity. Returns the number evicted.
    pub async fn evict_expired(&self, now: Instant) -> usize {
        let evicted = {
            let mut tables = self.tables.lock();
            let expired: Vec<CircuitId> = tables
                .disconnected
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.disconnected_at) > self.options.retention)
                .map(|(id, _)| id.clone())
                .collect();
            let mut evicted = Vec::with_capacity(expired.len());
            for id in expired {
                if let Some(entry) = tables.disconnected.remove(&id) {
                    debug!(circuit_id = %id, "disconnected circuit expired");
                    record_eviction(EvictionReason::Expired);
                    evicted.push(entry.circuit);
                }
            }
            evicted.extend(self.evict_over_capacity(&mut tables));
            record_gauges(&tables);
            evicted
        };
        let count = evicted.len();
        self.retire(evicted).await;
        count
    }

    /// Terminate circuits taken out of both tables and drop their handle
    /// slots once teardown has cleared them. A connection still holding one
    /// of these handles resolves it as gone either way.
    async fn retire(&self, circuits: Vec<Circuit>) {
        for circuit in circuits {
            circuit.terminate().await;
            circuit.terminated().await;
            let _ = self.handles.release(circuit.handle_id());
        }
    }

    fn evict_over_capacity(&self, tables: &mut Tables) -> Vec<Circuit> {
        let mut evicted = Vec::new();
        while tables.disconnected.len() > self.options.max_retained {
            let Some(id) = tables
                .disconnected
                .iter()
                .min_by_key(|(_, e)| e.eviction_rank())
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(entry) = tables.disconnected.remove(&id) {
                debug!(circuit_id = %id, "disconnected pool over capacity, evicting");
                record_eviction(EvictionReason::Capacity);
                evicted.push(entry.circuit);
            }
        }
        evicted
    }

    /// Periodically evict expired circuits until `cancel` fires.
    pub fn spawn_eviction_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.options.sweep_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        let evicted = registry.evict_expired(Instant::now()).await;
                        if evicted > 0 {
                            info!(evicted, "eviction sweep removed disconnected circuits");
                        }
                    }
                }
            }
            debug!("eviction sweep stopped");
        })
    }

    /// Remove faulted circuits from both tables as they report in. Returns
    /// `None` if the listener was already started.
    pub fn spawn_fault_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut faults = self.faults_rx.lock().take()?;
        let registry: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(fault) = faults.recv().await {
                let Some(registry) = registry.upgrade() else { break };
                warn!(
                    circuit_id = %fault.circuit_id,
                    kind = %fault.kind,
                    message = %fault.message,
                    "circuit faulted"
                );
                if let Some(circuit) = registry.remove(&fault.circuit_id) {
                    registry.retire(vec![circuit]).await;
                }
            }
            debug!("fault listener stopped");
        }))
    }

    /// Circuits bound to a live connection.
    pub fn connected_count(&self) -> usize {
        self.tables.lock().connected.len()
    }

    /// Circuits waiting for a reconnect.
    pub fn disconnected_count(&self) -> usize {
        self.tables.lock().disconnected.len()
    }

    /// Terminate every circuit. Used on shutdown.
    pub async fn terminate_all(&self) -> usize {
        let circuits: Vec<Circuit> = {
            let mut tables = self.tables.lock();
            let mut all: Vec<Circuit> = tables.connected.drain().map(|(_, e)| e.circuit).collect();
            all.extend(tables.disconnected.drain().map(|(_, e)| e.circuit));
            record_gauges(&tables);
            all
        };
        let count = circuits.len();
        self.retire(circuits).await;
        count
    }
}

fn record_eviction(reason: EvictionReason) {
    counter!(CIRCUIT_EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
}

#[allow(clippy::cast_precision_loss)]
fn record_gauges(tables: &Tables) {
    gauge!(CIRCUITS_ACTIVE).set(tables.connected.len() as f64);
    gauge!(CIRCUITS_DISCONNECTED).set(tables.disconnected.len() as f64);
}
