// Supervisor task - periodic reconciliation of worker records against the
// live process table. Primary only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use coord_common::process_utils::{ProcessSnapshot, ProcessTable};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::primary::SharedState;
use crate::registry::{ReapPolicy, TickPlan};

pub struct Supervisor {
    state: SharedState,
    table: Arc<dyn ProcessTable>,
    policy: ReapPolicy,
    running: AtomicBool,
}

/// Clears the running flag however the tick ends.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Supervisor {
    pub fn new(state: SharedState, table: Arc<dyn ProcessTable>, policy: ReapPolicy) -> Arc<Self> {
        Arc::new(Self {
            state,
            table,
            policy,
            running: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> ReapPolicy {
        self.policy
    }

    /// Run one pass. Returns `None` when a previous pass is still running;
    /// overlapping ticks are skipped, never queued.
    pub async fn tick(&self) -> Option<TickPlan> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Supervisor tick still running; skipping");
            return None;
        }
        let _guard = TickGuard(&self.running);

        let candidates = self.state.lock().await.registry.tracked_pids();
        let snapshot = if candidates.is_empty() {
            ProcessSnapshot::default()
        } else {
            let table = Arc::clone(&self.table);
            match tokio::task::spawn_blocking(move || table.snapshot(&candidates)).await {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(err)) => {
                    warn!("Supervisor: failed to scan process table: {}", err);
                    return Some(TickPlan::default());
                }
                Err(err) => {
                    warn!("Supervisor: process table scan aborted: {}", err);
                    return Some(TickPlan::default());
                }
            }
        };

        let plan = {
            let mut state = self.state.lock().await;
            state.registry.reconcile(&snapshot, Utc::now(), self.policy)
        };
        if plan.is_idle() {
            return Some(plan);
        }
        debug!(
            live = snapshot.len(),
            kills = plan.kills.len(),
            "Supervisor pass produced work"
        );

        // Fire-and-forget; the next pass confirms.
        for kill in &plan.kills {
            match self.table.terminate(kill.pid, kill.mode) {
                Ok(()) => info!(
                    pid = kill.pid,
                    owner = %kill.owner_instance_id,
                    attempt = kill.attempt,
                    mode = ?kill.mode,
                    "Terminating orphaned worker"
                ),
                Err(err) => warn!(
                    pid = kill.pid,
                    owner = %kill.owner_instance_id,
                    "Failed to signal orphaned worker: {}",
                    err
                ),
            }
        }
        for pid in &plan.removed {
            debug!(pid, "Worker record removed");
        }
        for pid in &plan.leaked {
            warn!(
                pid,
                attempts = self.policy.max_kill_attempts,
                "Leaked worker process: still alive after every kill attempt"
            );
        }
        for id in &plan.forgotten_instances {
            debug!(instance_id = %id, "Dead instance forgotten");
        }

        Some(plan)
    }
}

/// Start the periodic supervisor task.
pub fn spawn_supervisor(supervisor: Arc<Supervisor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(interval_ms = every.as_millis() as u64, "Supervisor task started");
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; nothing is registered yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            supervisor.tick().await;
        }
    })
}
