//! Data structures describing supervised processes.
//!
//! This module defines the command specification (`CommandSpec`), the per-process
//! specification (`ProcessSpec`), the full runtime descriptor handed over by the
//! configuration loader (`Descriptor`), and the observable lifecycle status
//! (`ProcessStatus`).

use std::collections::HashMap;
use std::path::PathBuf;

/// A shell command with its working directory and environment overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The shell snippet passed to `sh -c`.
    pub exec: String,
    /// Working directory, relative to the root directory.
    pub dir: String,
    /// Environment variables layered over the supervisor's own environment.
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Creates a spec that runs `exec` in the root directory with no extra environment.
    pub fn new(exec: impl Into<String>) -> Self {
        Self {
            exec: exec.into(),
            dir: ".".to_string(),
            env: HashMap::new(),
        }
    }

    /// Whether running this spec would do nothing.
    pub fn is_noop(&self) -> bool {
        self.exec.trim().is_empty()
    }
}

/// Specification for a process to be supervised.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Unique name, used as UI label and log file key.
    pub name: String,
    /// The long-running command.
    pub run: CommandSpec,
    /// Optional command run before starting.
    pub install: Option<CommandSpec>,
    /// Optional command run before the process tree is signaled.
    pub stop: Option<CommandSpec>,
}

/// Everything the supervisor needs from configuration.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Absolute base path for commands and logs.
    pub root_dir: PathBuf,
    /// Log directory, relative to `root_dir`.
    pub log_path: String,
    /// Grace period between SIGTERM and SIGKILL.
    pub shutdown_grace_ms: u64,
    /// Processes in declared order.
    pub processes: Vec<ProcessSpec>,
}

/// The current lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Never started, or stopped.
    Idle,
    /// The run command is in flight.
    Running { pid: Option<u32> },
    /// The run command exited on its own.
    Exited { code: i32 },
}

impl ProcessStatus {
    pub fn label(&self) -> String {
        match self {
            ProcessStatus::Idle => "idle".to_string(),
            ProcessStatus::Running { pid: Some(pid) } => format!("running (pid {})", pid),
            ProcessStatus::Running { pid: None } => "running".to_string(),
            ProcessStatus::Exited { code } => format!("exited with code {}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_exec_is_noop() {
        assert!(CommandSpec::new("   ").is_noop());
        assert!(!CommandSpec::new("echo hi").is_noop());
        assert_eq!(CommandSpec::new("echo hi").dir, ".");
    }
}
