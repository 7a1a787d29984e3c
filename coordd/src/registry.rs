//! In-memory registry of known instances and the worker processes they own.
//!
//! The registry never performs I/O. [`Registry::reconcile`] takes a process
//! table snapshot gathered elsewhere and returns the termination requests to
//! issue; the supervisor sends them after releasing the state lock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use coord_common::process_utils::{ProcessSnapshot, Termination};

/// Instance role as seen by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Primary,
    Secondary,
}

/// Connection state of a registered instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connected,
    /// Connection dropped without `UnregisterInstance`; its workers are orphans.
    Dead,
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub pid: u32,
    pub role: InstanceRole,
    pub liveness: Liveness,
    pub registered_at: DateTime<Utc>,
    pub dead_since: Option<DateTime<Utc>>,
}

/// Worker lifetime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Missing from the last scan while its owner is alive.
    Unknown,
    /// Termination requested; removed once the pid is confirmed gone.
    Reaped,
}

/// Stored metadata for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerProcessRecord {
    pub pid: u32,
    pub owner_instance_id: String,
    pub spawned_at: DateTime<Utc>,
    pub start_ticks: Option<u64>,
    pub status: WorkerStatus,
    pub kill_attempts: u32,
}

/// Knobs for one reconciliation pass.
#[derive(Debug, Clone, Copy)]
pub struct ReapPolicy {
    pub grace_period: Duration,
    pub max_kill_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub pid: u32,
    pub owner_instance_id: String,
    pub attempt: u32,
    pub mode: Termination,
}

/// Outcome of [`Registry::reconcile`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickPlan {
    pub kills: Vec<KillRequest>,
    /// Pids confirmed gone and dropped from the registry.
    pub removed: Vec<u32>,
    /// Pids that survived every kill attempt; dropped with a warning.
    pub leaked: Vec<u32>,
    /// Dead instances with no workers left, dropped from the registry.
    pub forgotten_instances: Vec<String>,
}

impl TickPlan {
    pub fn is_idle(&self) -> bool {
        self.kills.is_empty()
            && self.removed.is_empty()
            && self.leaked.is_empty()
            && self.forgotten_instances.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Registry {
    instances: HashMap<String, InstanceRecord>,
    workers: HashMap<u32, WorkerProcessRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or revive an instance. Re-registering a dead id brings it back.
    pub fn register_instance(
        &mut self,
        id: &str,
        pid: u32,
        role: InstanceRole,
        now: DateTime<Utc>,
    ) {
        let record = self
            .instances
            .entry(id.to_string())
            .or_insert_with(|| InstanceRecord {
                id: id.to_string(),
                pid,
                role,
                liveness: Liveness::Connected,
                registered_at: now,
                dead_since: None,
            });
        record.pid = pid;
        record.liveness = Liveness::Connected;
        record.dead_since = None;
    }

    /// Track `pid` under `owner`. A pid already owned by someone else is
    /// re-assigned: the latest report wins.
    pub fn register_worker(
        &mut self,
        owner: &str,
        pid: u32,
        start_ticks: Option<u64>,
        now: DateTime<Utc>,
    ) {
        self.workers.insert(
            pid,
            WorkerProcessRecord {
                pid,
                owner_instance_id: owner.to_string(),
                spawned_at: now,
                start_ticks,
                status: WorkerStatus::Running,
                kill_attempts: 0,
            },
        );
    }

    /// Forget a worker the owner stopped itself. Only the owner may release.
    pub fn release_worker(&mut self, owner: &str, pid: u32) -> bool {
        match self.workers.get(&pid) {
            Some(record) if record.owner_instance_id == owner => {
                self.workers.remove(&pid);
                true
            }
            _ => false,
        }
    }

    /// Clean departure: the instance already stopped its workers.
    pub fn unregister_instance(&mut self, id: &str) -> Option<InstanceRecord> {
        self.workers
            .retain(|_, worker| worker.owner_instance_id != id);
        self.instances.remove(id)
    }

    /// Connection dropped without an unregister.
    pub fn mark_dead(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        match self.instances.get_mut(id) {
            Some(record) if record.liveness == Liveness::Connected => {
                record.liveness = Liveness::Dead;
                record.dead_since = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.get(id)
    }

    pub fn worker(&self, pid: u32) -> Option<&WorkerProcessRecord> {
        self.workers.get(&pid)
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerProcessRecord> {
        self.workers.values()
    }

    pub fn connected_secondaries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.role == InstanceRole::Secondary && i.liveness == Liveness::Connected)
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Pids the next scan has to look up.
    pub fn tracked_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.workers.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn owner_is_alive(&self, owner: &str) -> bool {
        matches!(
            self.instances.get(owner),
            Some(InstanceRecord {
                liveness: Liveness::Connected,
                ..
            })
        )
    }

    /// One supervisor pass against a fresh process table snapshot.
    ///
    /// - Orphans (owner dead or unknown) still alive get a termination request
    ///   and move to `Reaped`; orphans already gone move to `Reaped` silently.
    /// - `Reaped` records are removed once their pid is absent, re-signalled
    ///   (escalating to SIGKILL on the final attempt) while attempts remain,
    ///   and reported as leaked after the bound.
    /// - Workers of live owners missing past the grace period go `Unknown`
    ///   and are dropped if still missing on the following pass.
    pub fn reconcile(
        &mut self,
        snapshot: &ProcessSnapshot,
        now: DateTime<Utc>,
        policy: ReapPolicy,
    ) -> TickPlan {
        let mut plan = TickPlan::default();
        let grace = chrono::Duration::from_std(policy.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let max_attempts = policy.max_kill_attempts.max(1);

        for pid in self.tracked_pids() {
            let owner_alive = match self.workers.get(&pid) {
                Some(record) => self.owner_is_alive(&record.owner_instance_id),
                None => continue,
            };
            let Some(record) = self.workers.get_mut(&pid) else {
                continue;
            };
            let alive = snapshot.is_alive(pid, record.start_ticks);
            let in_grace = now.signed_duration_since(record.spawned_at) < grace;

            match record.status {
                WorkerStatus::Reaped => {
                    if !alive {
                        plan.removed.push(pid);
                    } else if record.kill_attempts >= max_attempts {
                        plan.leaked.push(pid);
                    } else {
                        record.kill_attempts += 1;
                        plan.kills.push(kill_request(record, max_attempts));
                    }
                }
                WorkerStatus::Running | WorkerStatus::Unknown if !owner_alive => {
                    record.status = WorkerStatus::Reaped;
                    // A young worker may simply not be visible yet. A recycled
                    // pid belongs to someone else and is never signalled.
                    let recycled = snapshot.contains(pid) && !alive;
                    if alive || (in_grace && !recycled) {
                        record.kill_attempts += 1;
                        plan.kills.push(kill_request(record, max_attempts));
                    }
                }
                WorkerStatus::Running => {
                    if !alive && !in_grace {
                        record.status = WorkerStatus::Unknown;
                    }
                }
                WorkerStatus::Unknown => {
                    if alive {
                        record.status = WorkerStatus::Running;
                    } else {
                        plan.removed.push(pid);
                    }
                }
            }
        }

        for pid in plan.removed.iter().chain(plan.leaked.iter()) {
            self.workers.remove(pid);
        }

        let orphan_owners: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.liveness == Liveness::Dead)
            .filter(|i| !self.workers.values().any(|w| w.owner_instance_id == i.id))
            .map(|i| i.id.clone())
            .collect();
        for id in orphan_owners {
            self.instances.remove(&id);
            plan.forgotten_instances.push(id);
        }

        plan
    }
}

fn kill_request(record: &WorkerProcessRecord, max_attempts: u32) -> KillRequest {
    let mode = if record.kill_attempts >= max_attempts {
        Termination::Forced
    } else {
        Termination::Graceful
    };
    KillRequest {
        pid: record.pid,
        owner_instance_id: record.owner_instance_id.clone(),
        attempt: record.kill_attempts,
        mode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: ReapPolicy = ReapPolicy {
        grace_period: Duration::from_secs(3),
        max_kill_attempts: 3,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn registry_with_worker(pid: u32) -> Registry {
        let mut registry = Registry::new();
        registry.register_instance("primary", 10, InstanceRole::Primary, t(0));
        registry.register_instance("b", 20, InstanceRole::Secondary, t(0));
        registry.register_worker("b", pid, None, t(0));
        registry
    }

    #[test]
    fn dead_owner_gets_its_live_worker_killed() {
        let mut registry = registry_with_worker(1234);
        assert!(registry.mark_dead("b", t(5)));

        let plan = registry.reconcile(&ProcessSnapshot::from_pids([1234]), t(6), POLICY);
        assert_eq!(
            plan.kills,
            vec![KillRequest {
                pid: 1234,
                owner_instance_id: "b".into(),
                attempt: 1,
                mode: Termination::Graceful,
            }]
        );
        assert_eq!(registry.worker(1234).unwrap().status, WorkerStatus::Reaped);

        // Gone on the following pass: confirmed and removed, owner forgotten.
        let plan = registry.reconcile(&ProcessSnapshot::default(), t(9), POLICY);
        assert_eq!(plan.removed, vec![1234]);
        assert_eq!(plan.forgotten_instances, vec!["b".to_string()]);
        assert!(registry.worker(1234).is_none());
        assert!(registry.instance("b").is_none());
    }

    #[test]
    fn stubborn_worker_is_escalated_then_reported_leaked() {
        let mut registry = registry_with_worker(1234);
        registry.mark_dead("b", t(5));
        let alive = ProcessSnapshot::from_pids([1234]);

        let modes: Vec<Termination> = (0..3)
            .flat_map(|i| registry.reconcile(&alive, t(6 + i), POLICY).kills)
            .map(|k| k.mode)
            .collect();
        assert_eq!(
            modes,
            vec![
                Termination::Graceful,
                Termination::Graceful,
                Termination::Forced
            ]
        );

        let plan = registry.reconcile(&alive, t(10), POLICY);
        assert!(plan.kills.is_empty());
        assert_eq!(plan.leaked, vec![1234]);
        assert!(registry.worker(1234).is_none());
    }

    #[test]
    fn live_owner_worker_survives_grace_then_goes_unknown() {
        let mut registry = registry_with_worker(1234);
        let empty = ProcessSnapshot::default();

        // Within grace: not visible yet, left alone.
        let plan = registry.reconcile(&empty, t(1), POLICY);
        assert!(plan.is_idle());
        assert_eq!(registry.worker(1234).unwrap().status, WorkerStatus::Running);

        // Past grace: unknown, then dropped if still missing.
        registry.reconcile(&empty, t(4), POLICY);
        assert_eq!(registry.worker(1234).unwrap().status, WorkerStatus::Unknown);
        let plan = registry.reconcile(&empty, t(7), POLICY);
        assert_eq!(plan.removed, vec![1234]);
        assert!(plan.kills.is_empty());
    }

    #[test]
    fn unknown_worker_that_reappears_is_running_again() {
        let mut registry = registry_with_worker(1234);
        registry.reconcile(&ProcessSnapshot::default(), t(4), POLICY);
        registry.reconcile(&ProcessSnapshot::from_pids([1234]), t(7), POLICY);
        assert_eq!(registry.worker(1234).unwrap().status, WorkerStatus::Running);
    }

    #[test]
    fn recycled_pid_of_orphan_is_not_signalled() {
        let mut registry = Registry::new();
        registry.register_instance("b", 20, InstanceRole::Secondary, t(0));
        registry.register_worker("b", 1234, Some(500), t(0));
        registry.mark_dead("b", t(5));

        let mut snapshot = ProcessSnapshot::default();
        snapshot.insert(1234, Some(999));
        let plan = registry.reconcile(&snapshot, t(6), POLICY);
        assert!(plan.kills.is_empty());
        assert_eq!(registry.worker(1234).unwrap().status, WorkerStatus::Reaped);
    }

    #[test]
    fn unregister_drops_instance_and_workers() {
        let mut registry = registry_with_worker(1234);
        registry.register_worker("b", 1235, None, t(0));
        registry.register_worker("primary", 99, None, t(0));

        assert!(registry.unregister_instance("b").is_some());
        assert_eq!(registry.tracked_pids(), vec![99]);
        assert!(registry.connected_secondaries().is_empty());
    }

    #[test]
    fn release_requires_ownership() {
        let mut registry = registry_with_worker(1234);
        assert!(!registry.release_worker("primary", 1234));
        assert!(registry.release_worker("b", 1234));
        assert!(registry.worker(1234).is_none());
    }

    #[test]
    fn reregistering_revives_a_dead_instance() {
        let mut registry = registry_with_worker(1234);
        registry.mark_dead("b", t(5));
        registry.register_instance("b", 20, InstanceRole::Secondary, t(6));
        assert_eq!(registry.instance("b").unwrap().liveness, Liveness::Connected);
        assert_eq!(registry.connected_secondaries(), vec!["b".to_string()]);
    }
}
