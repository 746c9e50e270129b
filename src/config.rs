//! Configuration management for Monorack.
//!
//! This module defines the structure of the `monorack.toml` configuration file,
//! loads and validates it, and turns it into the runtime [`Descriptor`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::process::{CommandSpec, Descriptor, ProcessSpec};

/// Default log directory, relative to the root directory.
pub const DEFAULT_LOG_PATH: &str = ".logs";
/// Default grace period between SIGTERM and SIGKILL when stopping a process tree.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 800;

/// Top-level configuration structure corresponding to `monorack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base directory for every command. Relative paths resolve against the config file.
    pub root_dir: Option<PathBuf>,
    /// Directory for log files, relative to `root_dir`.
    pub log_path: Option<String>,
    /// Time to wait after SIGTERM before force-killing a process tree (ms).
    pub shutdown_grace_ms: Option<u64>,
    /// List of processes to supervise, in start order.
    #[serde(rename = "process", default)]
    pub processes: Vec<ProcessConfig>,
}

/// Configuration for a single process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Display name of the process. Also keys its log file.
    pub name: String,
    /// Long-running command.
    pub run: CommandConfig,
    /// Command run before the first start and on rebuild.
    pub install: Option<CommandConfig>,
    /// Command run before the process tree is signaled.
    pub stop: Option<CommandConfig>,
}

/// A command, either as a bare string or as a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Exec(String),
    Full {
        exec: String,
        dir: Option<String>,
        env: Option<HashMap<String, String>>,
    },
}

impl CommandConfig {
    fn into_spec(self) -> CommandSpec {
        match self {
            CommandConfig::Exec(exec) => CommandSpec::new(exec),
            CommandConfig::Full { exec, dir, env } => CommandSpec {
                exec,
                dir: dir.unwrap_or_else(|| ".".to_string()),
                env: env.unwrap_or_default(),
            },
        }
    }
}

impl Config {
    /// Builds the runtime descriptor. `config_path` anchors a relative `root_dir`.
    pub fn descriptor(self, config_path: &Path) -> Result<Descriptor> {
        let base = match config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => std::env::current_dir().context("failed to resolve current dir")?,
        };
        let root_dir = match self.root_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => base.join(dir),
            None => base,
        };
        let processes = self
            .processes
            .into_iter()
            .map(|process| ProcessSpec {
                name: process.name,
                run: process.run.into_spec(),
                install: process.install.map(CommandConfig::into_spec),
                stop: process.stop.map(CommandConfig::into_spec),
            })
            .collect();
        Ok(Descriptor {
            root_dir,
            log_path: self
                .log_path
                .unwrap_or_else(|| DEFAULT_LOG_PATH.to_string()),
            shutdown_grace_ms: self
                .shutdown_grace_ms
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            processes,
        })
    }
}

/// Loads, parses and validates the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate(&config).with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.processes.is_empty() {
        bail!("no processes defined");
    }
    let mut seen = HashSet::new();
    for process in &config.processes {
        if process.name.trim().is_empty() {
            bail!("process name must not be empty");
        }
        if !seen.insert(process.name.as_str()) {
            bail!("duplicate process name: {}", process.name);
        }
        let run = match &process.run {
            CommandConfig::Exec(exec) => exec,
            CommandConfig::Full { exec, .. } => exec,
        };
        if run.trim().is_empty() {
            bail!("empty run command for {}", process.name);
        }
    }
    Ok(())
}
