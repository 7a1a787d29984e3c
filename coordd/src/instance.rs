//! Instance runtime: negotiate a role, run it, and re-negotiate when a
//! secondary loses its primary.

use std::path::PathBuf;
use std::sync::Arc;

use coord_common::process_utils::ProcessTable;
use coord_common::{Connection, CoordConfig, Endpoint, Listener};
use coordd_client::{LinkEvent, PrimaryLink};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::exit::ExitKind;
use crate::negotiator::{InstanceIdentity, Negotiator, Role};
use crate::primary::{CoordState, Primary};
use crate::registry::ReapPolicy;
use crate::settings::{SettingsError, SettingsStore};
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::supervisor::{spawn_supervisor, Supervisor};
use crate::worker::{ManagedWorker, RestartPolicy, WorkerBackend, WorkerEvent};

/// Every signal delivered to the process arrives as one `()`.
pub type Signals = mpsc::UnboundedReceiver<()>;

pub struct InstanceOptions {
    pub config: CoordConfig,
    pub working_dir: PathBuf,
    pub backend: Option<Arc<dyn WorkerBackend>>,
    pub process_table: Arc<dyn ProcessTable>,
}

impl InstanceOptions {
    pub fn endpoint(&self) -> Result<Endpoint, coord_common::TransportError> {
        Endpoint::new(&self.config.runtime_dir, &self.config.rendezvous)
    }

    pub fn negotiator(&self) -> Result<Negotiator, coord_common::TransportError> {
        Ok(Negotiator::new(
            self.endpoint()?,
            self.config.negotiation_retries,
            self.config.negotiation_backoff,
        ))
    }
}

/// The worker this instance owns, if it runs one.
#[derive(Default)]
struct WorkerSlot {
    worker: Option<ManagedWorker>,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    launched: bool,
}

impl WorkerSlot {
    fn launch(&mut self, options: &InstanceOptions, instance_id: &str) {
        if self.launched {
            return;
        }
        self.launched = true;
        if let Some(backend) = &options.backend {
            let (worker, events) = ManagedWorker::spawn(
                Arc::clone(backend),
                options.working_dir.clone(),
                instance_id.to_string(),
                RestartPolicy::from_config(&options.config),
            );
            self.worker = Some(worker);
            self.events = Some(events);
        }
    }

    fn pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(ManagedWorker::pid)
    }

    /// Next worker event; pends forever once there are none left.
    async fn next_event(&mut self) -> WorkerEvent {
        loop {
            match self.events.as_mut() {
                Some(rx) => match rx.recv().await {
                    Some(event) => return event,
                    None => self.events = None,
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop().await;
        }
        self.events = None;
    }
}

/// Resolves on the next signal; never resolves once the sender is gone.
async fn next_signal(signals: &mut Signals) {
    if signals.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

enum SecondaryExit {
    Finished(ExitKind),
    PrimaryLost,
}

/// Run one instance until it shuts down.
pub async fn run(options: InstanceOptions, mut signals: Signals) -> ExitKind {
    let negotiator = match options.negotiator() {
        Ok(negotiator) => negotiator,
        Err(err) => {
            error!("Invalid rendezvous configuration: {}", err);
            return ExitKind::Fatal;
        }
    };
    let mut identity = InstanceIdentity::current();
    let mut worker = WorkerSlot::default();

    loop {
        let role = match negotiator.negotiate(&identity, worker.pid()).await {
            Ok(role) => role,
            Err(err) => {
                error!(instance_id = %identity.id(), "Role negotiation failed: {}", err);
                worker.stop().await;
                return ExitKind::NegotiationFailed;
            }
        };
        worker.launch(&options, &identity.id());

        let outcome = match role {
            Role::Primary(listener) => {
                return run_primary(&options, &identity, listener, &mut worker, &mut signals).await
            }
            Role::Secondary(conn) => {
                run_secondary(&options, &identity, conn, &mut worker, &mut signals).await
            }
        };

        match outcome {
            SecondaryExit::Finished(kind) => return kind,
            SecondaryExit::PrimaryLost => {
                identity.next_generation();
                warn!(instance_id = %identity.id(), "Primary lost; re-negotiating");
            }
        }
    }
}

enum PrimaryWake {
    Signal,
    Worker(WorkerEvent),
    Fatal(SettingsError),
}

async fn run_primary(
    options: &InstanceOptions,
    identity: &InstanceIdentity,
    listener: Listener,
    worker: &mut WorkerSlot,
    signals: &mut Signals,
) -> ExitKind {
    let config = &options.config;
    let store = SettingsStore::new(&config.settings_file);
    let settings = match store.load().await {
        Ok(settings) => settings,
        Err(err) => {
            error!("{}", err);
            worker.stop().await;
            return ExitKind::Fatal;
        }
    };

    let state = Arc::new(Mutex::new(CoordState {
        settings,
        ..CoordState::default()
    }));
    let supervisor = Supervisor::new(
        Arc::clone(&state),
        Arc::clone(&options.process_table),
        ReapPolicy {
            grace_period: config.grace_period,
            max_kill_attempts: config.max_kill_attempts,
        },
    );
    let (primary, mut fatal) = Primary::new(identity.id(), state, store, Arc::clone(&supervisor));
    primary.register_self(identity.pid()).await;
    if let Some(pid) = worker.pid() {
        primary.register_local_worker(pid).await;
    }

    let accept_task = primary.spawn_accept_loop(listener);
    let supervisor_task = spawn_supervisor(supervisor, config.tick_interval);

    let fatal_error = loop {
        let wake = tokio::select! {
            _ = next_signal(signals) => PrimaryWake::Signal,
            event = worker.next_event() => PrimaryWake::Worker(event),
            Some(err) = fatal.recv() => PrimaryWake::Fatal(err),
        };
        match wake {
            PrimaryWake::Signal => break None,
            PrimaryWake::Fatal(err) => break Some(err),
            PrimaryWake::Worker(WorkerEvent::Started { pid }) => {
                primary.register_local_worker(pid).await
            }
            PrimaryWake::Worker(WorkerEvent::Exited { pid, .. }) => {
                primary.release_local_worker(pid).await
            }
            PrimaryWake::Worker(WorkerEvent::GaveUp { .. }) => {}
        }
    };

    let exit = match fatal_error {
        Some(err) => {
            error!("Shutting down after fatal error: {}", err);
            ExitKind::Fatal
        }
        None => {
            info!("Shutdown requested");
            let coordinator = ShutdownCoordinator::new(Arc::clone(&primary), config.shutdown_timeout);
            match coordinator.run(next_signal(signals)).await {
                ShutdownOutcome::Clean => ExitKind::Normal,
                ShutdownOutcome::Degraded { .. } => ExitKind::ShutdownForced,
            }
        }
    };

    worker.stop().await;
    primary.unregister_self().await;
    supervisor_task.abort();
    accept_task.abort();
    // Dropping the listener removes the socket; wait for it.
    let _ = accept_task.await;
    let _ = supervisor_task.await;

    info!(code = exit.code(), "Primary exiting");
    exit
}

enum SecondaryWake {
    Signal,
    Link(Option<LinkEvent>),
    Worker(WorkerEvent),
}

async fn run_secondary(
    options: &InstanceOptions,
    identity: &InstanceIdentity,
    conn: Connection,
    worker: &mut WorkerSlot,
    signals: &mut Signals,
) -> SecondaryExit {
    let (link, mut events) = PrimaryLink::start(conn, identity.id());

    loop {
        let wake = tokio::select! {
            _ = next_signal(signals) => SecondaryWake::Signal,
            event = events.recv() => SecondaryWake::Link(event),
            event = worker.next_event() => SecondaryWake::Worker(event),
        };

        match wake {
            SecondaryWake::Signal => {
                info!(instance_id = %link.instance_id(), "Signal received; leaving");
                return leave(options, &link, worker).await;
            }
            SecondaryWake::Link(Some(LinkEvent::ShutdownRequested)) => {
                return leave(options, &link, worker).await;
            }
            SecondaryWake::Link(Some(LinkEvent::SettingsChanged { version })) => {
                debug!(version, "Shared settings now at version");
            }
            SecondaryWake::Link(Some(LinkEvent::PrimaryLost { reason })) => {
                warn!(instance_id = %link.instance_id(), %reason, "Lost primary");
                return SecondaryExit::PrimaryLost;
            }
            SecondaryWake::Link(None) => return SecondaryExit::PrimaryLost,
            SecondaryWake::Worker(event) => forward_worker_event(&link, event),
        }
    }
}

fn forward_worker_event(link: &PrimaryLink, event: WorkerEvent) {
    let sent = match event {
        WorkerEvent::Started { pid } => link.register_worker(pid),
        WorkerEvent::Exited { pid, .. } => link.release_worker(pid),
        WorkerEvent::GaveUp { .. } => Ok(()),
    };
    if let Err(err) = sent {
        // The link event loop reports the loss; nothing else to do here.
        debug!("Could not forward worker event: {}", err);
    }
}

/// Stop the own worker, then unregister. Both steps are bounded.
async fn leave(options: &InstanceOptions, link: &PrimaryLink, worker: &mut WorkerSlot) -> SecondaryExit {
    worker.stop().await;
    match timeout(options.config.worker_stop_timeout, link.unregister()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Failed to unregister from primary: {}", err),
        Err(_) => warn!("Timed out unregistering from primary"),
    }
    SecondaryExit::Finished(ExitKind::Normal)
}
