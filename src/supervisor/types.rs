use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lines of stdout/stderr kept per process.
pub const OUTPUT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed { exit_code: i32 },
    Killed,
    /// The supervisor lost track of the process. Terminal.
    UnknownLost,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Completed { exit_code } => write!(f, "completed({})", exit_code),
            ProcessStatus::Killed => f.write_str("killed"),
            ProcessStatus::UnknownLost => f.write_str("unknown_lost"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub status: ProcessStatus,
}

/// A handle plus captured output, as returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(flatten)]
    pub handle: ProcessHandle,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout_tail: Vec<String>,
    pub stderr_tail: Vec<String>,
}

/// Bounded line buffer.
#[derive(Debug, Default)]
pub(crate) struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    pub fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
