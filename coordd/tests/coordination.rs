#![cfg(unix)]

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use coord_common::process_utils::{ProcessSnapshot, ProcessTable, Termination};
use coord_common::{connect, try_bind, Connection, CoordConfig, Endpoint, Message};
use coordd::instance::InstanceOptions;
use coordd::primary::{CoordState, Primary};
use coordd::registry::{Liveness, ReapPolicy, WorkerStatus};
use coordd::settings::SettingsStore;
use coordd::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use coordd::supervisor::Supervisor;
use coordd::{ExitKind, InstanceIdentity, Negotiator, Role};
use coordd_client::{LinkEvent, PrimaryLink};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

/// Process table that believes whatever the test tells it and records
/// termination requests instead of sending signals.
#[derive(Default)]
struct FakeTable {
    alive: StdMutex<HashSet<u32>>,
    terminated: StdMutex<Vec<(u32, Termination)>>,
}

impl FakeTable {
    fn with_alive(pids: &[u32]) -> Arc<Self> {
        let table = Self::default();
        table.alive.lock().unwrap().extend(pids.iter().copied());
        Arc::new(table)
    }

    fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().iter().map(|(pid, _)| *pid).collect()
    }
}

impl ProcessTable for FakeTable {
    fn snapshot(&self, candidates: &[u32]) -> io::Result<ProcessSnapshot> {
        let alive = self.alive.lock().unwrap();
        Ok(ProcessSnapshot::from_pids(
            candidates.iter().copied().filter(|pid| alive.contains(pid)),
        ))
    }

    fn terminate(&self, pid: u32, mode: Termination) -> io::Result<()> {
        self.terminated.lock().unwrap().push((pid, mode));
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    endpoint: Endpoint,
    settings_path: std::path::PathBuf,
    primary: Arc<Primary>,
    supervisor: Arc<Supervisor>,
}

fn harness(table: Arc<FakeTable>, grace: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::new(dir.path(), "coord-it").unwrap();
    let settings_path = dir.path().join("settings.json");

    let listener = try_bind(&endpoint).unwrap();
    let state = Arc::new(Mutex::new(CoordState::default()));
    let supervisor = Supervisor::new(
        state.clone(),
        table,
        ReapPolicy {
            grace_period: grace,
            max_kill_attempts: 3,
        },
    );
    let (primary, _fatal) = Primary::new(
        "primary-0",
        state,
        SettingsStore::new(&settings_path),
        supervisor.clone(),
    );
    primary.spawn_accept_loop(listener);

    Harness {
        _dir: dir,
        endpoint,
        settings_path,
        primary,
        supervisor,
    }
}

async fn join(endpoint: &Endpoint, id: &str, worker_pid: Option<u32>) -> Connection {
    let mut conn = connect(endpoint).await.unwrap();
    conn.send(&Message::RegisterInstance {
        instance_id: id.into(),
        pid: 4000,
        worker_pid,
    })
    .await
    .unwrap();
    conn
}

async fn join_link(endpoint: &Endpoint, id: &str) -> (PrimaryLink, mpsc::UnboundedReceiver<LinkEvent>) {
    let conn = join(endpoint, id, None).await;
    let (link, mut events) = PrimaryLink::start(conn, id);
    let first = timeout(WAIT, events.recv()).await.unwrap();
    assert!(matches!(first, Some(LinkEvent::SettingsChanged { .. })));
    (link, events)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn concurrent_startup_elects_exactly_one_primary() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::new(dir.path(), "race").unwrap();

    let tasks: Vec<_> = (0..8u32)
        .map(|i| {
            let negotiator = Negotiator::new(endpoint.clone(), 5, Duration::from_millis(20));
            tokio::spawn(async move {
                negotiator
                    .negotiate(&InstanceIdentity::with_base(100 + i, format!("i{i}")), None)
                    .await
            })
        })
        .collect();

    let mut roles = Vec::new();
    for task in tasks {
        roles.push(task.await.unwrap().unwrap());
    }
    let primaries = roles.iter().filter(|r| matches!(r, Role::Primary(_))).count();
    assert_eq!(primaries, 1);
    assert_eq!(roles.len() - primaries, 7);
}

#[tokio::test]
async fn dropped_secondary_worker_is_reaped_on_next_tick() {
    let table = FakeTable::with_alive(&[1234]);
    let h = harness(table.clone(), Duration::from_millis(0));

    let mut conn = join(&h.endpoint, "b", Some(1234)).await;
    assert!(matches!(
        conn.recv().await.unwrap(),
        Some(Message::GlobalSettingsSnapshot(_))
    ));
    {
        let state = h.primary.state().lock().await;
        assert_eq!(state.registry.worker(1234).unwrap().status, WorkerStatus::Running);
    }

    // Instance B vanishes without UnregisterInstance.
    drop(conn);
    let state = h.primary.state().clone();
    eventually(|| {
        let state = state.clone();
        async move {
            matches!(
                state.lock().await.registry.instance("b").map(|i| i.liveness),
                Some(Liveness::Dead)
            )
        }
    })
    .await;

    let plan = h.supervisor.tick().await.unwrap();
    assert_eq!(plan.kills.len(), 1);
    assert_eq!(table.terminated(), vec![1234]);
    assert_ne!(
        state.lock().await.registry.worker(1234).map(|w| w.status),
        Some(WorkerStatus::Running)
    );

    h.supervisor.tick().await.unwrap();
    assert!(state.lock().await.registry.worker(1234).is_none());
}

#[tokio::test]
async fn set_from_one_secondary_reaches_every_secondary() {
    let h = harness(FakeTable::with_alive(&[]), Duration::from_secs(1));
    let (a, _a_events) = join_link(&h.endpoint, "a").await;
    let (b, _b_events) = join_link(&h.endpoint, "b").await;

    let version = a.set("theme", json!("dark"), WAIT).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(a.get("theme"), Some(json!("dark")));

    b.wait_for_version(version, WAIT).await.unwrap();
    assert_eq!(b.get("theme"), Some(json!("dark")));
    assert_eq!(h.primary.get("theme").await, Some(json!("dark")));
}

#[tokio::test]
async fn malformed_bytes_close_only_the_offending_connection() {
    let h = harness(FakeTable::with_alive(&[]), Duration::from_secs(1));
    let (healthy, _events) = join_link(&h.endpoint, "healthy").await;

    let mut rogue = UnixStream::connect(h.endpoint.socket_path()).await.unwrap();
    rogue
        .write_all(b"{\"type\":\"RegisterInstance\",\"instanceId\":\"rogue\",\"pid\":9}\n")
        .await
        .unwrap();
    rogue.write_all(b"\x00\xffnot-json\n").await.unwrap();

    let state = h.primary.state().clone();
    eventually(|| {
        let state = state.clone();
        async move {
            matches!(
                state.lock().await.registry.instance("rogue").map(|i| i.liveness),
                Some(Liveness::Dead)
            )
        }
    })
    .await;

    // The healthy secondary keeps working.
    healthy.set("lang", json!("rust"), WAIT).await.unwrap();
    assert_eq!(healthy.get("lang"), Some(json!("rust")));
    assert!(h.endpoint.socket_path().exists());
}

#[tokio::test]
async fn resync_snapshot_matches_the_settings_file() {
    let h = harness(FakeTable::with_alive(&[]), Duration::from_secs(1));
    h.primary.set("theme", json!("dark")).await.unwrap();
    h.primary.set("fontSize", json!(14)).await.unwrap();
    h.primary.set("theme", json!("solarized")).await.unwrap();

    let mut conn = join(&h.endpoint, "c", None).await;
    conn.recv().await.unwrap();
    conn.send(&Message::RequestGlobalSettings).await.unwrap();

    let snapshot = match conn.recv().await.unwrap() {
        Some(Message::GlobalSettingsSnapshot(s)) => s,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(snapshot.version, 3);

    let on_disk = SettingsStore::new(&h.settings_path).load().await.unwrap();
    assert_eq!(snapshot, on_disk);
    assert_eq!(on_disk.get("theme"), Some(&json!("solarized")));
}

#[tokio::test]
async fn hung_secondary_is_force_reaped_on_shutdown() {
    let table = FakeTable::with_alive(&[4321]);
    let h = harness(table.clone(), Duration::from_millis(0));

    // A cooperative secondary acknowledges ShutdownAll.
    let (polite, mut polite_events) = join_link(&h.endpoint, "polite").await;
    let acker = tokio::spawn(async move {
        while let Some(event) = polite_events.recv().await {
            if event == LinkEvent::ShutdownRequested {
                polite.unregister().await.unwrap();
                break;
            }
        }
    });

    // A hung one keeps its connection open and never answers.
    let mut hung = join(&h.endpoint, "hung", Some(4321)).await;
    hung.recv().await.unwrap();

    let coordinator = ShutdownCoordinator::new(h.primary.clone(), Duration::from_millis(300));
    let outcome = timeout(WAIT, coordinator.run(std::future::pending()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ShutdownOutcome::Degraded {
            forced: vec!["hung".to_string()]
        }
    );
    assert_eq!(table.terminated(), vec![4321]);
    assert_eq!(hung.recv().await.unwrap(), Some(Message::ShutdownAll));
    acker.await.unwrap();
}

#[tokio::test]
async fn clean_shutdown_when_everyone_acknowledges() {
    let h = harness(FakeTable::with_alive(&[]), Duration::from_secs(1));
    let (link, mut events) = join_link(&h.endpoint, "only").await;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event == LinkEvent::ShutdownRequested {
                let _ = link.unregister().await;
                break;
            }
        }
    });

    let coordinator = ShutdownCoordinator::new(h.primary.clone(), WAIT);
    assert_eq!(
        coordinator.run(std::future::pending()).await,
        ShutdownOutcome::Clean
    );

    // Late arrivals are told to shut down straight away.
    let mut late = join(&h.endpoint, "late", None).await;
    assert_eq!(late.recv().await.unwrap(), Some(Message::ShutdownAll));
}

fn options(dir: &Path) -> InstanceOptions {
    let mut config = CoordConfig::default();
    config.runtime_dir = dir.to_path_buf();
    config.rendezvous = "takeover".into();
    config.settings_file = dir.join("settings.json");
    config.set_tick_interval(100);
    config.shutdown_timeout = Duration::from_secs(2);
    config.negotiation_backoff = Duration::from_millis(10);
    InstanceOptions {
        config,
        working_dir: dir.to_path_buf(),
        backend: None,
        process_table: FakeTable::with_alive(&[]),
    }
}

#[tokio::test]
async fn secondary_takes_over_when_primary_disappears() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let endpoint = opts.endpoint().unwrap();

    // A short-lived primary that accepts one registration and then dies.
    let listener = try_bind(&endpoint).unwrap();
    let (signal_tx, signals) = mpsc::unbounded_channel();
    let instance = tokio::spawn(coordd::run(opts, signals));

    let mut first = listener.accept().await.unwrap();
    assert!(matches!(
        first.recv().await.unwrap(),
        Some(Message::RegisterInstance { .. })
    ));
    first
        .send(&Message::GlobalSettingsSnapshot(Default::default()))
        .await
        .unwrap();
    drop(first);
    drop(listener);

    // The former secondary re-negotiates and now answers registrations.
    let mut probe = None;
    for _ in 0..100 {
        if let Ok(mut conn) = connect(&endpoint).await {
            conn.send(&Message::RegisterInstance {
                instance_id: "probe".into(),
                pid: 1,
                worker_pid: None,
            })
            .await
            .unwrap();
            if let Ok(Some(Message::GlobalSettingsSnapshot(_))) = conn.recv().await {
                probe = Some(conn);
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    let mut probe = probe.expect("new primary never answered");

    signal_tx.send(()).unwrap();
    assert_eq!(probe.recv().await.unwrap(), Some(Message::ShutdownAll));
    probe
        .send(&Message::UnregisterInstance {
            instance_id: "probe".into(),
        })
        .await
        .unwrap();

    let exit = timeout(WAIT, instance).await.unwrap().unwrap();
    assert_eq!(exit, ExitKind::Normal);
    assert!(!endpoint.socket_path().exists());
}
