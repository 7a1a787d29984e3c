//! Primary side: owns the registry and the shared settings, accepts
//! secondaries on the rendezvous endpoint and serves one task per connection.
//!
//! Lock discipline: [`CoordState`] is only held for in-memory mutation.
//! Outgoing frames go through per-peer queues drained by writer tasks, and
//! settings are persisted with the lock released.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use coord_common::process_utils::start_ticks;
use coord_common::transport::{FrameReader, FrameWriter};
use coord_common::{Connection, FrameError, Listener, Message, SettingsUpdate, SharedSettings};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::registry::{InstanceRole, Registry};
use crate::settings::{SettingsError, SettingsStore};
use crate::supervisor::Supervisor;

pub type PeerSender = mpsc::UnboundedSender<Message>;

/// Everything the primary mutates, behind one lock.
#[derive(Debug, Default)]
pub struct CoordState {
    pub registry: Registry,
    pub settings: SharedSettings,
    /// Outgoing queues of registered secondaries, keyed by instance id.
    pub peers: HashMap<String, PeerSender>,
    pub shutting_down: bool,
}

pub type SharedState = Arc<Mutex<CoordState>>;

pub struct Primary {
    instance_id: String,
    state: SharedState,
    store: SettingsStore,
    /// Serializes compute → persist → commit so versions never fork.
    settings_gate: Mutex<()>,
    departures: Notify,
    supervisor: Arc<Supervisor>,
    fatal: mpsc::UnboundedSender<SettingsError>,
}

/// What a connection task learned about its peer.
#[derive(Default)]
struct PeerBinding {
    instance_id: Option<String>,
    unregistered: bool,
}

impl Primary {
    /// `state.settings` must already hold the file content. Persistence
    /// failures are reported on the returned receiver and are fatal.
    pub fn new(
        instance_id: impl Into<String>,
        state: SharedState,
        store: SettingsStore,
        supervisor: Arc<Supervisor>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SettingsError>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let primary = Arc::new(Self {
            instance_id: instance_id.into(),
            state,
            store,
            settings_gate: Mutex::new(()),
            departures: Notify::new(),
            supervisor,
            fatal: fatal_tx,
        });
        (primary, fatal_rx)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Woken whenever a secondary unregisters or drops its connection.
    pub(crate) fn departures(&self) -> &Notify {
        &self.departures
    }

    /// Record this process itself in the registry.
    pub async fn register_self(&self, pid: u32) {
        let mut state = self.state.lock().await;
        state.registry.register_instance(
            &self.instance_id,
            pid,
            InstanceRole::Primary,
            Utc::now(),
        );
    }

    pub async fn register_local_worker(&self, pid: u32) {
        let ticks = start_ticks(pid);
        let mut state = self.state.lock().await;
        state
            .registry
            .register_worker(&self.instance_id, pid, ticks, Utc::now());
        info!(instance_id = %self.instance_id, pid, "Tracking own worker");
    }

    pub async fn release_local_worker(&self, pid: u32) {
        let mut state = self.state.lock().await;
        state.registry.release_worker(&self.instance_id, pid);
    }

    pub async fn unregister_self(&self) {
        let mut state = self.state.lock().await;
        state.registry.unregister_instance(&self.instance_id);
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().await.settings.get(key).cloned()
    }

    pub async fn settings(&self) -> SharedSettings {
        self.state.lock().await.settings.clone()
    }

    /// Set `key`, persist the whole mapping and broadcast it to every
    /// secondary. The broadcast only goes out after the file is written.
    pub async fn set(&self, key: &str, value: Value) -> Result<u64, SettingsError> {
        let _gate = self.settings_gate.lock().await;

        let next = self.state.lock().await.settings.with_value(key, value);
        self.store.persist(&next).await?;

        let peers = {
            let mut state = self.state.lock().await;
            state.settings = next.clone();
            // Queued under the lock so every peer sees versions in order.
            let msg = Message::UpdateGlobalSettings(SettingsUpdate::Broadcast(next.clone()));
            for sender in state.peers.values() {
                let _ = sender.send(msg.clone());
            }
            state.peers.len()
        };

        info!(key, version = next.version, peers, "Shared settings updated");
        Ok(next.version)
    }

    /// Accept secondaries until the listener fails or the task is aborted.
    pub fn spawn_accept_loop(self: &Arc<Self>, listener: Listener) -> JoinHandle<()> {
        let primary = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                socket = %listener.endpoint().socket_path().display(),
                "Primary listening"
            );
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        let primary = Arc::clone(&primary);
                        tokio::spawn(async move { primary.serve_connection(conn).await });
                    }
                    Err(err) => {
                        warn!("Accept failed: {}", err);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        })
    }

    /// One task per secondary connection.
    pub async fn serve_connection(self: Arc<Self>, conn: Connection) {
        let (mut reader, writer) = conn.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, rx));
        let mut binding = PeerBinding::default();

        let close_reason = self.read_loop(&mut reader, &tx, &mut binding).await;

        match binding.instance_id.take() {
            Some(id) if !binding.unregistered => {
                let mut state = self.state.lock().await;
                // The id may already be bound to a newer connection.
                let current = state
                    .peers
                    .get(&id)
                    .map_or(false, |sender| sender.same_channel(&tx));
                if current {
                    state.peers.remove(&id);
                    if state.registry.mark_dead(&id, Utc::now()) {
                        warn!(instance_id = %id, reason = %close_reason, "Secondary lost without unregistering");
                    }
                }
                drop(state);
                self.departures.notify_waiters();
            }
            _ => debug!(reason = %close_reason, "Connection closed"),
        }

        drop(tx);
        let _ = writer_task.await;
    }

    async fn read_loop(
        &self,
        reader: &mut FrameReader,
        tx: &PeerSender,
        binding: &mut PeerBinding,
    ) -> String {
        loop {
            let msg = match reader.next_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return "connection closed".to_string(),
                Err(FrameError::Decode(err)) => {
                    warn!(
                        instance_id = binding.instance_id.as_deref().unwrap_or("-"),
                        "Closing connection after malformed frame: {}", err
                    );
                    return format!("malformed frame: {err}");
                }
                Err(FrameError::Io(err)) => return format!("read error: {err}"),
            };
            self.handle_message(msg, tx, binding).await;
        }
    }

    async fn handle_message(&self, msg: Message, tx: &PeerSender, binding: &mut PeerBinding) {
        match msg {
            Message::RegisterInstance {
                instance_id,
                pid,
                worker_pid,
            } => {
                let now = Utc::now();
                let mut state = self.state.lock().await;
                state
                    .registry
                    .register_instance(&instance_id, pid, InstanceRole::Secondary, now);
                if let Some(worker) = worker_pid {
                    state
                        .registry
                        .register_worker(&instance_id, worker, start_ticks(worker), now);
                }
                state.peers.insert(instance_id.clone(), tx.clone());

                let reply = if state.shutting_down {
                    Message::ShutdownAll
                } else {
                    Message::GlobalSettingsSnapshot(state.settings.clone())
                };
                let _ = tx.send(reply);
                drop(state);

                info!(%instance_id, pid, worker_pid, "Secondary registered");
                binding.instance_id = Some(instance_id);
                binding.unregistered = false;
            }
            Message::UnregisterInstance { instance_id } => {
                let mut state = self.state.lock().await;
                state.registry.unregister_instance(&instance_id);
                state.peers.remove(&instance_id);
                drop(state);

                info!(%instance_id, "Secondary unregistered");
                if binding.instance_id.as_deref() == Some(instance_id.as_str()) {
                    binding.unregistered = true;
                }
                self.departures.notify_waiters();
            }
            Message::RegisterWorker { instance_id, pid } => {
                let ticks = start_ticks(pid);
                let mut state = self.state.lock().await;
                if state.registry.instance(&instance_id).is_none() {
                    warn!(%instance_id, pid, "Worker reported by unknown instance; tracking anyway");
                }
                state
                    .registry
                    .register_worker(&instance_id, pid, ticks, Utc::now());
                debug!(%instance_id, pid, "Worker registered");
            }
            Message::ReleaseWorker { instance_id, pid } => {
                let released = self
                    .state
                    .lock()
                    .await
                    .registry
                    .release_worker(&instance_id, pid);
                if released {
                    debug!(%instance_id, pid, "Worker released");
                } else {
                    warn!(%instance_id, pid, "Release for a worker not owned by the sender");
                }
            }
            Message::RequestGlobalSettings => {
                // Read and queue under one lock so a concurrent broadcast
                // cannot overtake the snapshot.
                let state = self.state.lock().await;
                let _ = tx.send(Message::GlobalSettingsSnapshot(state.settings.clone()));
            }
            Message::UpdateGlobalSettings(SettingsUpdate::Set { key, value }) => {
                if let Err(err) = self.set(&key, value).await {
                    error!(%key, "Unrecoverable settings persistence failure: {}", err);
                    let _ = self.fatal.send(err);
                }
            }
            other => {
                warn!(
                    instance_id = binding.instance_id.as_deref().unwrap_or("-"),
                    kind = other.kind(),
                    "Ignoring message not meant for the primary"
                );
            }
        }
    }
}

async fn write_loop(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(err) = writer.send(&msg).await {
            debug!(kind = msg.kind(), "Dropping peer writer: {}", err);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
