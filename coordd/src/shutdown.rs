//! Two-phase coordinated shutdown, driven by the primary.
//!
//! Phase one queues `ShutdownAll` to every connected secondary. Phase two
//! waits, bounded, for each of them to unregister. Whoever is still around
//! afterwards is marked dead and force-reaped through the supervisor before
//! the primary exits.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coord_common::Message;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::primary::Primary;
use crate::registry::Liveness;

const REAP_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every secondary acknowledged in time.
    Clean,
    /// These secondaries never acknowledged and were force-reaped.
    Degraded { forced: Vec<String> },
}

pub struct ShutdownCoordinator {
    primary: Arc<Primary>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(primary: Arc<Primary>, timeout: Duration) -> Self {
        Self { primary, timeout }
    }

    /// Run both phases. `abort` resolving (a second signal) ends the wait
    /// early; the remaining secondaries are then forced like on timeout.
    pub async fn run<F>(&self, abort: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        let mut pending = self.broadcast().await;
        info!(secondaries = pending.len(), "Coordinated shutdown started");

        let mut forced = Vec::new();
        let deadline = Instant::now() + self.timeout;
        tokio::pin!(abort);

        loop {
            let departed = self.primary.departures().notified();
            tokio::pin!(departed);
            // Registered before the check below so no departure slips between.
            departed.as_mut().enable();

            {
                let state = self.primary.state().lock().await;
                pending.retain(|id| match state.registry.instance(id) {
                    None => false,
                    Some(record) if record.liveness == Liveness::Dead => {
                        forced.push(id.clone());
                        false
                    }
                    Some(_) => true,
                });
            }
            if pending.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut departed => {}
                _ = sleep(deadline.saturating_duration_since(Instant::now())) => {
                    warn!(remaining = pending.len(), "Shutdown acknowledgement timeout");
                    break;
                }
                _ = &mut abort => {
                    warn!(remaining = pending.len(), "Shutdown wait aborted");
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let mut state = self.primary.state().lock().await;
            let now = Utc::now();
            for id in &pending {
                state.registry.mark_dead(id, now);
                state.peers.remove(id);
            }
        }
        forced.extend(pending);

        if forced.is_empty() {
            info!("All secondaries acknowledged shutdown");
            return ShutdownOutcome::Clean;
        }

        self.reap_forced().await;
        forced.sort();
        warn!(forced = ?forced, "Degraded shutdown; unacknowledged secondaries were force-reaped");
        ShutdownOutcome::Degraded { forced }
    }

    /// Phase one. Returns the secondaries expected to acknowledge.
    async fn broadcast(&self) -> BTreeSet<String> {
        let mut state = self.primary.state().lock().await;
        state.shutting_down = true;
        let expected: BTreeSet<String> = state.registry.connected_secondaries().into_iter().collect();
        for (id, sender) in &state.peers {
            if sender.send(Message::ShutdownAll).is_err() {
                warn!(instance_id = %id, "Secondary writer already gone");
            }
        }
        expected
    }

    /// Drive supervisor passes until no orphan needs another signal, bounded
    /// by the kill-attempt limit.
    async fn reap_forced(&self) {
        let supervisor = self.primary.supervisor();
        let passes = supervisor.policy().max_kill_attempts + 1;
        for _ in 0..passes {
            match supervisor.tick().await {
                Some(plan) if plan.kills.is_empty() => break,
                _ => sleep(REAP_PAUSE).await,
            }
        }
    }
}
