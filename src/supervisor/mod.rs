//! Background and foreground process supervision.
//!
//! Each launched process gets a monitor task that owns the `Child`, records
//! its exit, and handles kill requests. The supervisor is the only writer of
//! process status; callers read snapshots without blocking.

mod tree;
pub mod types;

pub use types::{ProcessHandle, ProcessSnapshot, ProcessStatus, OUTPUT_TAIL_LINES};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::error::{SysgateError, SysgateResult};
use tree::ProcessTree;
use types::Tail;

/// Upper bound on waiting for output readers after a process exits. Readers
/// can outlive the process when a grandchild keeps the pipe open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long terminal handles are kept before pruning.
    pub retention: Duration,
    /// Time between the graceful termination signal and a forceful kill.
    pub kill_grace: Duration,
    /// Foreground launches are killed after this long.
    pub foreground_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60),
            kill_grace: Duration::from_millis(3000),
            foreground_timeout: Duration::from_secs(300),
        }
    }
}

struct Tracked {
    handle: ProcessHandle,
    stdout: Tail,
    stderr: Tail,
    finished_at: Option<DateTime<Utc>>,
    kill_tx: Option<oneshot::Sender<()>>,
    /// Flips to `true` once the monitor has recorded a terminal status and
    /// drained output. A dropped sender while still `Running` means the
    /// monitor died.
    done: watch::Receiver<bool>,
}

impl Tracked {
    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            handle: self.handle.clone(),
            finished_at: self.finished_at,
            stdout_tail: self.stdout.to_vec(),
            stderr_tail: self.stderr.to_vec(),
        }
    }

    fn finish(&mut self, status: ProcessStatus) {
        // Terminal statuses never change
        if self.handle.status.is_terminal() {
            return;
        }
        self.handle.status = status;
        self.finished_at = Some(Utc::now());
        self.kill_tx = None;
    }
}

type ProcessTable = Arc<Mutex<HashMap<u32, Tracked>>>;

fn lock(table: &ProcessTable) -> MutexGuard<'_, HashMap<u32, Tracked>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ProcessSupervisor {
    processes: ProcessTable,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Spawn `command` through the platform shell.
    ///
    /// Background launches return as soon as the process is spawned.
    /// Foreground launches wait for exit, up to the foreground timeout, after
    /// which the process is killed and `OperationTimeout` is returned.
    pub async fn launch(&self, command: &str, background: bool) -> SysgateResult<ProcessSnapshot> {
        if command.trim().is_empty() {
            return Err(SysgateError::InvalidRequest("empty command".into()));
        }
        self.prune();

        let mut child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SysgateError::Other(format!("Failed to spawn '{}': {}", command, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SysgateError::Other(format!("'{}' exited before it was tracked", command)))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let handle = ProcessHandle {
            pid,
            command: command.to_string(),
            started_at: Utc::now(),
            status: ProcessStatus::Running,
        };
        lock(&self.processes).insert(
            pid,
            Tracked {
                handle,
                stdout: Tail::default(),
                stderr: Tail::default(),
                finished_at: None,
                kill_tx: Some(kill_tx),
                done: done_rx,
            },
        );

        let readers = [
            child.stdout.take().map(|s| spawn_reader(self.processes.clone(), pid, s, false)),
            child.stderr.take().map(|s| spawn_reader(self.processes.clone(), pid, s, true)),
        ];
        tokio::spawn(monitor(
            self.processes.clone(),
            child,
            pid,
            kill_rx,
            done_tx,
            readers,
            self.config.kill_grace,
        ));
        log::info!("Launched pid {}: {}", pid, command);

        if background {
            return self.snapshot(pid);
        }

        if self
            .wait(pid, self.config.foreground_timeout)
            .await
            .is_none()
        {
            log::warn!(
                "Foreground process {} exceeded {:?}, killing",
                pid,
                self.config.foreground_timeout
            );
            self.kill(pid).await?;
            return Err(SysgateError::OperationTimeout(format!(
                "'{}' did not finish within {:?}",
                command, self.config.foreground_timeout
            )));
        }
        self.snapshot(pid)
    }

    /// Last observed state. Never blocks on the process.
    pub fn status(&self, pid: u32) -> SysgateResult<ProcessSnapshot> {
        self.prune();
        self.snapshot(pid)
    }

    fn snapshot(&self, pid: u32) -> SysgateResult<ProcessSnapshot> {
        let mut table = lock(&self.processes);
        let tracked = table.get_mut(&pid).ok_or(SysgateError::ProcessNotFound(pid))?;
        if !tracked.handle.status.is_terminal() && tracked.done.has_changed().is_err() {
            log::error!("Monitor for pid {} vanished; marking lost", pid);
            tracked.finish(ProcessStatus::UnknownLost);
        }
        Ok(tracked.snapshot())
    }

    pub fn list(&self) -> Vec<ProcessSnapshot> {
        self.prune();
        let mut snapshots: Vec<ProcessSnapshot> =
            lock(&self.processes).values().map(Tracked::snapshot).collect();
        snapshots.sort_by_key(|s| s.handle.started_at);
        snapshots
    }

    /// Terminate a running process: a graceful signal first, then a forceful
    /// kill after the grace period. Killing a finished process is a no-op
    /// that returns its final state.
    pub async fn kill(&self, pid: u32) -> SysgateResult<ProcessSnapshot> {
        let kill_tx = {
            let mut table = lock(&self.processes);
            let tracked = table.get_mut(&pid).ok_or(SysgateError::ProcessNotFound(pid))?;
            if tracked.handle.status.is_terminal() {
                return Ok(tracked.snapshot());
            }
            tracked.kill_tx.take()
        };

        match kill_tx {
            Some(tx) => {
                log::info!("Killing pid {}", pid);
                // The monitor may have just finished; that is fine
                let _ = tx.send(());
            }
            None => log::debug!("Kill already requested for pid {}", pid),
        }

        let bound = self.config.kill_grace + Duration::from_secs(5);
        if self.wait(pid, bound).await.is_none() {
            let mut table = lock(&self.processes);
            if let Some(tracked) = table.get_mut(&pid) {
                log::error!("pid {} did not die within {:?}; marking lost", pid, bound);
                tracked.finish(ProcessStatus::UnknownLost);
            }
        }
        self.snapshot(pid)
    }

    /// Wait until the monitor reports done. `None` on timeout.
    async fn wait(&self, pid: u32, timeout: Duration) -> Option<()> {
        let mut done = {
            let table = lock(&self.processes);
            table.get(&pid)?.done.clone()
        };
        let finished = tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .is_ok();
        finished.then_some(())
    }

    /// Drop terminal handles older than the retention window.
    fn prune(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
        let mut table = lock(&self.processes);
        let before = table.len();
        table.retain(|_, t| t.finished_at.map_or(true, |at| at > cutoff));
        let pruned = before - table.len();
        if pruned > 0 {
            log::debug!("Pruned {} finished process handles", pruned);
        }
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn spawn_reader<R>(
    table: ProcessTable,
    pid: u32,
    stream: R,
    is_stderr: bool,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut guard = lock(&table);
            let Some(tracked) = guard.get_mut(&pid) else {
                break;
            };
            if is_stderr {
                tracked.stderr.push(line);
            } else {
                tracked.stdout.push(line);
            }
        }
    })
}

async fn monitor(
    table: ProcessTable,
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    done_tx: watch::Sender<bool>,
    readers: [Option<tokio::task::JoinHandle<()>>; 2],
    kill_grace: Duration,
) {
    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) => match exit.code() {
                Some(code) => ProcessStatus::Completed { exit_code: code },
                // Terminated by a signal we did not send
                None => ProcessStatus::Killed,
            },
            Err(e) => {
                log::error!("Lost track of pid {}: {}", pid, e);
                ProcessStatus::UnknownLost
            }
        },
        Ok(()) = kill_rx => terminate(&mut child, pid, kill_grace).await,
    };

    log::info!("pid {} finished: {}", pid, status);
    if let Some(tracked) = lock(&table).get_mut(&pid) {
        tracked.finish(status);
    }

    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            log::debug!("Output reader for pid {} still open after exit", pid);
        }
    }
    let _ = done_tx.send(true);
}

/// Graceful termination of the shell and everything it started, then force.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> ProcessStatus {
    let deadline = tokio::time::Instant::now() + grace;
    let tree = ProcessTree::capture(pid);
    let status = terminate_root(child, pid, &tree, grace).await;

    let forced = tree.reap(deadline).await;
    if !forced.is_empty() {
        log::warn!("Force-killed descendants of pid {}: {:?}", pid, forced);
    }
    status
}

async fn terminate_root(
    child: &mut Child,
    pid: u32,
    tree: &ProcessTree,
    grace: Duration,
) -> ProcessStatus {
    if tree.terminate() {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => return ProcessStatus::Killed,
            Ok(Err(e)) => {
                log::error!("Lost track of pid {} during kill: {}", pid, e);
                return ProcessStatus::UnknownLost;
            }
            Err(_) => log::warn!("pid {} ignored termination for {:?}, forcing", pid, grace),
        }
    }
    match child.kill().await {
        Ok(()) => ProcessStatus::Killed,
        Err(e) => {
            log::error!("Failed to kill pid {}: {}", pid, e);
            ProcessStatus::UnknownLost
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            retention: Duration::from_secs(60),
            kill_grace: Duration::from_millis(500),
            foreground_timeout: Duration::from_secs(5),
        })
    }

    async fn wait_terminal(sup: &ProcessSupervisor, pid: u32) -> ProcessSnapshot {
        for _ in 0..100 {
            let snap = sup.status(pid).unwrap();
            if snap.handle.status.is_terminal() {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("pid {} never finished", pid);
    }

    #[tokio::test]
    async fn background_launch_reports_running_then_completed() {
        let sup = supervisor();
        let snap = sup.launch("sleep 0.3; echo done", true).await.unwrap();
        assert_eq!(snap.handle.status, ProcessStatus::Running);

        let done = wait_terminal(&sup, snap.handle.pid).await;
        assert_eq!(done.handle.status, ProcessStatus::Completed { exit_code: 0 });
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn foreground_captures_output_and_exit_code() {
        let sup = supervisor();
        let snap = sup.launch("echo out; echo err 1>&2; exit 3", false).await.unwrap();
        assert_eq!(snap.handle.status, ProcessStatus::Completed { exit_code: 3 });
        assert_eq!(snap.stdout_tail, vec!["out".to_string()]);
        assert_eq!(snap.stderr_tail, vec!["err".to_string()]);
    }

    #[tokio::test]
    async fn kill_marks_killed_and_is_final() {
        let sup = supervisor();
        let snap = sup.launch("sleep 30", true).await.unwrap();
        let killed = sup.kill(snap.handle.pid).await.unwrap();
        assert_eq!(killed.handle.status, ProcessStatus::Killed);

        // Second kill is a no-op
        let again = sup.kill(snap.handle.pid).await.unwrap();
        assert_eq!(again.handle.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn kill_escalates_when_term_is_ignored() {
        let sup = supervisor();
        let snap = sup.launch("trap '' TERM; sleep 30", true).await.unwrap();
        // Give the shell a moment to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        let killed = sup.kill(snap.handle.pid).await.unwrap();
        assert_eq!(killed.handle.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn kill_takes_down_the_whole_tree() {
        let sup = supervisor();
        let snap = sup.launch("sleep 47; true", true).await.unwrap();
        let pid = snap.handle.pid;

        let mut grandchildren = Vec::new();
        for _ in 0..40 {
            grandchildren = ProcessTree::capture(pid).descendant_pids();
            if !grandchildren.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!grandchildren.is_empty(), "sleep never started under pid {}", pid);

        let killed = sup.kill(pid).await.unwrap();
        assert_eq!(killed.handle.status, ProcessStatus::Killed);
        for _ in 0..40 {
            if !grandchildren.iter().any(|p| tree::is_alive(*p)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("descendants {:?} outlived kill", grandchildren);
    }

    #[tokio::test]
    async fn kill_reaches_descendants_that_ignore_term() {
        let sup = supervisor();
        let snap = sup
            .launch("sh -c \"trap '' TERM; sleep 46\" & wait", true)
            .await
            .unwrap();
        let pid = snap.handle.pid;
        // Let the inner shell start and install its trap
        tokio::time::sleep(Duration::from_millis(300)).await;
        let tree_pids = ProcessTree::capture(pid).descendant_pids();
        assert!(!tree_pids.is_empty(), "nothing started under pid {}", pid);

        sup.kill(pid).await.unwrap();
        for _ in 0..40 {
            if !tree_pids.iter().any(|p| tree::is_alive(*p)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("descendants {:?} outlived kill", tree_pids);
    }

    #[tokio::test]
    async fn foreground_timeout_kills() {
        let sup = ProcessSupervisor::new(SupervisorConfig {
            foreground_timeout: Duration::from_millis(200),
            kill_grace: Duration::from_millis(200),
            ..Default::default()
        });
        let result = sup.launch("sleep 30", false).await;
        assert!(matches!(result, Err(SysgateError::OperationTimeout(_))));
        let listed = sup.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].handle.status, ProcessStatus::Killed);
    }

    #[tokio::test]
    async fn terminal_handles_are_pruned() {
        let sup = ProcessSupervisor::new(SupervisorConfig {
            retention: Duration::ZERO,
            ..Default::default()
        });
        let snap = sup.launch("true", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            sup.status(snap.handle.pid),
            Err(SysgateError::ProcessNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_pid_is_not_found() {
        let sup = supervisor();
        assert!(matches!(sup.status(999_999), Err(SysgateError::ProcessNotFound(_))));
        assert!(matches!(sup.kill(999_999).await, Err(SysgateError::ProcessNotFound(_))));
    }
}
