//! Worker collaborator: the tool process each instance runs, plus the
//! restart policy around it.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coord_common::config::{CoordConfig, ENV_DISABLE_PATH_REWRITE};
use coord_common::process_utils::signal_process_group;
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable carrying the owning instance id into the worker.
pub const ENV_INSTANCE_ID: &str = "COORD_INSTANCE_ID";

/// Starts worker processes for an instance.
#[async_trait]
pub trait WorkerBackend: Send + Sync + 'static {
    async fn start(&self, working_dir: &Path, instance_id: &str)
        -> io::Result<Box<dyn WorkerProcess>>;
}

/// A running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> u32;

    /// Resolve when the process exits on its own.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// SIGTERM, then SIGKILL once `grace` runs out. Descendants are
    /// signalled along with the worker.
    async fn stop(&mut self, grace: Duration) -> io::Result<()>;
}

/// Runs a fixed command line as the worker.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
    disable_path_rewrite: bool,
}

impl CommandBackend {
    /// `command[0]` is the program. Returns `None` for an empty command.
    pub fn from_command(command: &[String], disable_path_rewrite: bool) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            disable_path_rewrite,
        })
    }
}

#[async_trait]
impl WorkerBackend for CommandBackend {
    async fn start(
        &self,
        working_dir: &Path,
        instance_id: &str,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(working_dir)
            .env(ENV_INSTANCE_ID, instance_id)
            .env(
                ENV_DISABLE_PATH_REWRITE,
                if self.disable_path_rewrite { "1" } else { "0" },
            )
            .stdin(Stdio::null())
            // Own group, so stopping or reaping the worker reaches its children.
            .process_group(0)
            .kill_on_drop(true);

        let child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "worker exited before reporting a pid")
        })?;
        debug!(pid, program = %self.program, cwd = %working_dir.display(), "Worker spawned");
        Ok(Box::new(ChildWorker { child, pid }))
    }
}

struct ChildWorker {
    child: Child,
    pid: u32,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    async fn stop(&mut self, grace: Duration) -> io::Result<()> {
        let leader_alive = self.child.try_wait()?.is_none();
        if leader_alive {
            signal_process_group(self.pid, Signal::SIGTERM)?;
            if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
                warn!(pid = self.pid, "Worker ignored SIGTERM; killing");
            }
        }
        // Whatever is left of the group, leader included.
        signal_process_group(self.pid, Signal::SIGKILL)?;
        if self.child.try_wait()?.is_none() {
            self.child.wait().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub cooldown: Duration,
    pub stop_timeout: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &CoordConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            cooldown: config.restart_cooldown,
            stop_timeout: config.worker_stop_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { pid: u32 },
    Exited { pid: u32, status: String },
    /// Restart budget spent; no worker is running any more.
    GaveUp { restarts: u32 },
}

/// A worker kept running under a [`RestartPolicy`].
pub struct ManagedWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    pid: watch::Receiver<Option<u32>>,
}

impl ManagedWorker {
    pub fn spawn(
        backend: Arc<dyn WorkerBackend>,
        working_dir: PathBuf,
        instance_id: String,
        policy: RestartPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (pid_tx, pid_rx) = watch::channel(None);

        let task = tokio::spawn(supervise(
            backend,
            working_dir,
            instance_id,
            policy,
            stop_rx,
            pid_tx,
            events_tx,
        ));

        let worker = Self {
            stop_tx: Some(stop_tx),
            task,
            pid: pid_rx,
        };
        (worker, events_rx)
    }

    /// Pid of the currently running worker, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.borrow()
    }

    /// Stop the worker and wait for the supervising task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!("Worker task ended abnormally: {}", err);
        }
    }
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Stop,
}

async fn supervise(
    backend: Arc<dyn WorkerBackend>,
    working_dir: PathBuf,
    instance_id: String,
    policy: RestartPolicy,
    mut stop_rx: oneshot::Receiver<()>,
    pid_tx: watch::Sender<Option<u32>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut restarts = 0u32;

    loop {
        let started = backend.start(&working_dir, &instance_id).await;
        let failure = match started {
            Ok(mut process) => {
                let pid = process.pid();
                pid_tx.send_replace(Some(pid));
                info!(%instance_id, pid, restarts, "Worker started");
                let _ = events.send(WorkerEvent::Started { pid });

                let wake = tokio::select! {
                    status = process.wait() => Wake::Exited(status),
                    _ = &mut stop_rx => Wake::Stop,
                };

                match wake {
                    Wake::Stop => {
                        if let Err(err) = process.stop(policy.stop_timeout).await {
                            warn!(pid, "Failed to stop worker: {}", err);
                        }
                        pid_tx.send_replace(None);
                        let _ = events.send(WorkerEvent::Exited {
                            pid,
                            status: "stopped".to_string(),
                        });
                        return;
                    }
                    Wake::Exited(status) => {
                        pid_tx.send_replace(None);
                        let status = match status {
                            Ok(status) => status.to_string(),
                            Err(err) => format!("wait failed: {err}"),
                        };
                        warn!(pid, %status, "Worker exited unexpectedly");
                        let _ = events.send(WorkerEvent::Exited { pid, status });
                        "exited"
                    }
                }
            }
            Err(err) => {
                warn!(%instance_id, "Failed to start worker: {}", err);
                "failed to start"
            }
        };

        if restarts >= policy.max_restarts {
            warn!(%instance_id, restarts, reason = failure, "Worker restart budget exhausted");
            let _ = events.send(WorkerEvent::GaveUp { restarts });
            return;
        }
        restarts += 1;

        tokio::select! {
            _ = tokio::time::sleep(policy.cooldown) => {}
            _ = &mut stop_rx => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend whose workers exit immediately.
    struct Flaky {
        starts: AtomicU32,
    }

    struct Crashing(u32);

    #[async_trait]
    impl WorkerProcess for Crashing {
        fn pid(&self) -> u32 {
            self.0
        }

        async fn wait(&mut self) -> io::Result<ExitStatus> {
            Err(io::Error::new(io::ErrorKind::Other, "crashed"))
        }

        async fn stop(&mut self, _grace: Duration) -> io::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerBackend for Flaky {
        async fn start(&self, _: &Path, _: &str) -> io::Result<Box<dyn WorkerProcess>> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Crashing(1000 + n)))
        }
    }

    #[tokio::test]
    async fn crashing_worker_is_restarted_until_budget_is_spent() {
        let backend = Arc::new(Flaky {
            starts: AtomicU32::new(0),
        });
        let policy = RestartPolicy {
            max_restarts: 2,
            cooldown: Duration::from_millis(1),
            stop_timeout: Duration::from_millis(10),
        };
        let (_worker, mut events) =
            ManagedWorker::spawn(backend.clone(), PathBuf::from("."), "i".into(), policy);

        let mut started = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                WorkerEvent::Started { pid } => started.push(pid),
                WorkerEvent::Exited { .. } => {}
                WorkerEvent::GaveUp { restarts } => {
                    assert_eq!(restarts, 2);
                    break;
                }
            }
        }
        assert_eq!(started, vec![1000, 1001, 1002]);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn command_worker_sees_instance_env_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let script = format!(
            "echo \"$COORD_INSTANCE_ID $COORD_DISABLE_PATH_REWRITE\" > {}; exec sleep 30",
            out.display()
        );
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let backend = Arc::new(CommandBackend::from_command(&command, true).unwrap());
        let policy = RestartPolicy {
            max_restarts: 0,
            cooldown: Duration::from_millis(1),
            stop_timeout: Duration::from_secs(2),
        };

        let (worker, mut events) =
            ManagedWorker::spawn(backend, dir.path().to_path_buf(), "42-7".into(), policy);
        let pid = match events.recv().await.unwrap() {
            WorkerEvent::Started { pid } => pid,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(worker.pid(), Some(pid));

        for _ in 0..100 {
            if out.exists() && std::fs::read_to_string(&out).unwrap().ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "42-7 1");

        worker.stop().await;
        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::Exited { status, .. }) if status == "stopped"
        ));
    }

    /// Gone, or a zombie waiting for its new parent to reap it.
    #[cfg(target_os = "linux")]
    fn exited(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn stopping_worker_takes_its_children_down() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("child.pid");
        let script = format!("sleep 300 & echo $! > {}; wait", marker.display());
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let backend = Arc::new(CommandBackend::from_command(&command, false).unwrap());
        let policy = RestartPolicy {
            max_restarts: 0,
            cooldown: Duration::from_millis(1),
            stop_timeout: Duration::from_secs(2),
        };

        let (worker, mut events) =
            ManagedWorker::spawn(backend, dir.path().to_path_buf(), "tree".into(), policy);
        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::Started { .. })
        ));

        let mut grandchild = None;
        for _ in 0..250 {
            if let Ok(raw) = std::fs::read_to_string(&marker) {
                if raw.ends_with('\n') {
                    grandchild = raw.trim().parse::<u32>().ok();
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = grandchild.expect("worker never forked its child");
        assert!(!exited(grandchild));

        worker.stop().await;

        for _ in 0..100 {
            if exited(grandchild) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited(grandchild), "child {grandchild} outlived its worker");
    }

    #[test]
    fn empty_command_has_no_backend() {
        assert!(CommandBackend::from_command(&[], false).is_none());
    }
}
