//! Process-table collaborator.
//!
//! Supervised workers are usually not children of the supervising instance,
//! so liveness is established by polling the OS process table rather than by
//! exit notification.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgid, Pid};

/// Minimal view of `/proc/[pid]/stat`
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub starttime: u64,
}

/// Parse `/proc/[pid]/stat` and extract the `starttime` field (index 21).
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{}/stat", pid);
    let content = fs::read_to_string(&path)?;
    // `comm` may contain spaces; fields are only reliable after the closing paren.
    let after_comm = content
        .rfind(')')
        .map(|idx| &content[idx + 1..])
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Missing comm field in {}", path),
            )
        })?;
    let parts: Vec<&str> = after_comm.split_whitespace().collect();
    let starttime = parts
        .get(19)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Missing starttime field in {}", path),
            )
        })?
        .parse::<u64>()
        .map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse starttime in {}: {}", path, err),
            )
        })?;

    Ok(ProcStat { starttime })
}

/// Check for existence of a process in `/proc`.
pub fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Start ticks of `pid`, when the platform exposes them.
pub fn start_ticks(pid: u32) -> Option<u64> {
    read_proc_stat(pid).ok().map(|stat| stat.starttime)
}

/// Signal `pid`, or its whole process group when it leads one, so the
/// worker's descendants go down with it. A vanished target is not an error.
pub fn signal_process_tree(pid: u32, signal: Signal) -> io::Result<()> {
    let target = Pid::from_raw(pid as i32);
    let sent = match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(target, signal),
        _ => kill(target, signal),
    };
    match sent {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from(err)),
    }
}

/// Signal every member of process group `pgid`, even after its leader exited.
pub fn signal_process_group(pgid: u32, signal: Signal) -> io::Result<()> {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from(err)),
    }
}

/// Live pids at the moment of the scan, with their start ticks when known.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pids: HashMap<u32, Option<u64>>,
}

impl ProcessSnapshot {
    pub fn from_pids<I: IntoIterator<Item = u32>>(pids: I) -> Self {
        Self {
            pids: pids.into_iter().map(|pid| (pid, None)).collect(),
        }
    }

    pub fn insert(&mut self, pid: u32, start_ticks: Option<u64>) {
        self.pids.insert(pid, start_ticks);
    }

    /// Whether `pid` is alive and, when both sides know it, started at
    /// `expected_ticks`. A mismatch means the pid was recycled.
    pub fn is_alive(&self, pid: u32, expected_ticks: Option<u64>) -> bool {
        match (self.pids.get(&pid), expected_ticks) {
            (None, _) => false,
            (Some(Some(seen)), Some(expected)) => *seen == expected,
            (Some(_), _) => true,
        }
    }

    /// Whether any process currently holds `pid`, recycled or not.
    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

/// How hard a termination request should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// Read access to the OS process table plus the ability to signal a pid.
///
/// Implementations must not block for long: `snapshot` runs on a blocking
/// thread and `terminate` is fire-and-forget.
pub trait ProcessTable: Send + Sync + 'static {
    /// Snapshot restricted to `candidates`; pids not returned are gone.
    fn snapshot(&self, candidates: &[u32]) -> io::Result<ProcessSnapshot>;

    fn terminate(&self, pid: u32, mode: Termination) -> io::Result<()>;
}

/// [`ProcessTable`] backed by `/proc` where available and `kill(pid, 0)`
/// probing elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

impl ProcessTable for OsProcessTable {
    fn snapshot(&self, candidates: &[u32]) -> io::Result<ProcessSnapshot> {
        let mut snapshot = ProcessSnapshot::default();

        if Path::new("/proc/self/stat").exists() {
            for pid in candidates {
                if process_exists(*pid) {
                    snapshot.insert(*pid, start_ticks(*pid));
                }
            }
            return Ok(snapshot);
        }

        for pid in candidates {
            match kill(Pid::from_raw(*pid as i32), None) {
                Ok(()) | Err(Errno::EPERM) => snapshot.insert(*pid, None),
                Err(Errno::ESRCH) => {}
                Err(err) => return Err(io::Error::from(err)),
            }
        }
        Ok(snapshot)
    }

    fn terminate(&self, pid: u32, mode: Termination) -> io::Result<()> {
        let signal = match mode {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        };
        signal_process_tree(pid, signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sees_current_process() {
        let me = std::process::id();
        let snapshot = OsProcessTable.snapshot(&[me]).unwrap();
        assert!(snapshot.is_alive(me, None));
        assert!(snapshot.is_alive(me, start_ticks(me)));
    }

    #[test]
    fn snapshot_drops_unknown_pids() {
        // pid_max on Linux is at most 2^22.
        let ghost = 4_194_304 + 17;
        let snapshot = OsProcessTable.snapshot(&[ghost]).unwrap();
        assert!(!snapshot.is_alive(ghost, None));
        assert!(snapshot.is_empty());
    }

    /// Gone, or a zombie waiting for its new parent to reap it.
    #[cfg(target_os = "linux")]
    fn exited(pid: u32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map_or(true, |rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn terminating_a_group_leader_reaches_its_children() {
        use std::io::{BufRead, BufReader};
        use std::os::unix::process::CommandExt;
        use std::process::{Command, Stdio};

        let mut leader = Command::new("sh")
            .args(["-c", "sleep 300 & echo $!; wait"])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(leader.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let child: u32 = line.trim().parse().unwrap();
        assert!(!exited(child));

        OsProcessTable
            .terminate(leader.id(), Termination::Graceful)
            .unwrap();
        leader.wait().unwrap();

        for _ in 0..100 {
            if exited(child) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(exited(child), "child {child} survived its group leader");
    }

    #[test]
    fn vanished_pid_is_not_an_error() {
        let ghost = 4_194_304 + 23;
        assert!(signal_process_tree(ghost, Signal::SIGTERM).is_ok());
    }

    #[test]
    fn recycled_pid_is_not_alive() {
        let mut snapshot = ProcessSnapshot::default();
        snapshot.insert(77, Some(1000));
        assert!(snapshot.is_alive(77, Some(1000)));
        assert!(!snapshot.is_alive(77, Some(999)));
        assert!(snapshot.is_alive(77, None));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_stat_parses_own_start_time() {
        let stat = read_proc_stat(std::process::id()).unwrap();
        assert!(stat.starttime > 0);
    }
}
