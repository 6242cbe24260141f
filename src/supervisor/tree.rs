//! The OS process tree below a launched shell.
//!
//! A launch runs `sh -c` (or `cmd /C`), so the program doing the work is
//! usually a child or grandchild of the pid we track. Killing only the shell
//! would orphan it. The tree is captured before any signal is sent, since
//! descendants are reparented once the shell exits.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus as OsStatus, ProcessesToUpdate, Signal, System};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A process identity that survives pid reuse: pid plus start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    pid: Pid,
    started: u64,
}

#[derive(Debug)]
pub(crate) struct ProcessTree {
    root: Pid,
    /// Descendants of `root`, parents before children.
    descendants: Vec<Member>,
}

impl ProcessTree {
    pub(crate) fn capture(root: u32) -> Self {
        let root = Pid::from_u32(root);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut descendants = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            for &child in children.get(&current).into_iter().flatten() {
                if let Some(process) = sys.process(child) {
                    descendants.push(Member {
                        pid: child,
                        started: process.start_time(),
                    });
                    queue.push_back(child);
                }
            }
        }
        Self { root, descendants }
    }

    #[cfg(test)]
    pub(crate) fn descendant_pids(&self) -> Vec<u32> {
        self.descendants.iter().map(|m| m.pid.as_u32()).collect()
    }

    /// Ask the whole tree to terminate. Returns whether the root accepted
    /// the signal; platforms without one go straight to a forceful kill.
    pub(crate) fn terminate(&self) -> bool {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let delivered = sys
            .process(self.root)
            .and_then(|p| p.kill_with(Signal::Term))
            .unwrap_or(false);
        for member in self.live(&sys) {
            if let Some(process) = sys.process(member.pid) {
                let _ = process.kill_with(Signal::Term);
            }
        }
        delivered
    }

    /// Wait for descendants to exit until `deadline`, then kill what is left.
    /// Returns the pids that had to be killed.
    pub(crate) async fn reap(&self, deadline: Instant) -> Vec<u32> {
        let mut sys = System::new();
        loop {
            sys.refresh_processes(ProcessesToUpdate::All, true);
            let survivors = self.live(&sys);
            if survivors.is_empty() {
                return Vec::new();
            }
            if Instant::now() >= deadline {
                return survivors
                    .into_iter()
                    .filter(|m| sys.process(m.pid).is_some_and(|p| p.kill()))
                    .map(|m| m.pid.as_u32())
                    .collect();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn live(&self, sys: &System) -> Vec<Member> {
        self.descendants
            .iter()
            .filter(|m| {
                sys.process(m.pid)
                    .is_some_and(|p| p.start_time() == m.started && !is_exited(p.status()))
            })
            .copied()
            .collect()
    }
}

/// Whether `pid` still names a running, non-zombie process.
#[cfg(test)]
pub(crate) fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some_and(|p| !is_exited(p.status()))
}

/// Zombies linger until their new parent reaps them; they are already gone.
fn is_exited(status: OsStatus) -> bool {
    matches!(status, OsStatus::Zombie | OsStatus::Dead)
}
