//! Process lifecycle management.
//!
//! A `ManagedProcess` owns everything that belongs to one configured process:
//! its command runner (and therefore its live pids), the completion of the
//! current run, and the ordering between install, start and stop. Operations on
//! one process are serialized; operations on different processes are not.
//!
//! Every process shares the supervisor's halt token. Once it is cancelled, no
//! install or run command is spawned again, so a lifecycle action racing a
//! shutdown cannot bring a process back after it was stopped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::logs::LogStore;
use crate::process::{ProcessSpec, ProcessStatus};
use crate::runner::{CommandRunner, Completion};
use crate::tree::{signal_tree, ProcessSignal};

/// How long a process tree gets to exit after SIGTERM before it is killed.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    grace_ms: u64,
}

impl ShutdownConfig {
    pub fn new(grace_ms: u64) -> Self {
        Self { grace_ms }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// One supervised process.
#[derive(Debug)]
pub struct ManagedProcess {
    spec: ProcessSpec,
    logs: Arc<LogStore>,
    runner: CommandRunner,
    shutdown: ShutdownConfig,
    halt: CancellationToken,
    run: Mutex<Option<Completion>>,
}

impl ManagedProcess {
    pub fn new(
        spec: ProcessSpec,
        logs: Arc<LogStore>,
        root: impl Into<PathBuf>,
        shutdown: ShutdownConfig,
        halt: CancellationToken,
    ) -> Self {
        let runner = CommandRunner::new(spec.name.clone(), root);
        Self {
            spec,
            logs,
            runner,
            shutdown,
            halt,
            run: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Number of spawned pids not yet reaped.
    pub fn handle_count(&self) -> usize {
        self.runner.handles().len()
    }

    /// Truncates the log, then runs the install command if one is configured.
    ///
    /// Returns the install exit code; a missing install command yields 0
    /// without spawning anything. After a halt nothing is touched and 0 is
    /// returned.
    pub async fn install(&self) -> Result<i32> {
        let _guard = self.run.lock().await;
        self.install_locked().await
    }

    async fn install_locked(&self) -> Result<i32> {
        if self.halt.is_cancelled() {
            debug!(process = %self.name(), "halted; skipping install");
            return Ok(0);
        }
        self.logs.truncate(self.name())?;
        let Some(install) = self.spec.install.as_ref() else {
            debug!(process = %self.name(), "no install command");
            return Ok(0);
        };
        info!(process = %self.name(), command = %install.exec, "installing");
        let log_path = self.logs.path(self.name())?;
        let code = self.runner.run(Some(install), &log_path).await?.wait().await;
        if code == 0 {
            info!(process = %self.name(), "installed");
        } else {
            warn!(process = %self.name(), code, "install failed");
        }
        Ok(code)
    }

    /// Spawns the run command and keeps its completion for [`stop`](Self::stop).
    ///
    /// Returns as soon as the command is spawned. Fails with
    /// [`LifecycleError::AlreadyRunning`] while a previous run is unresolved.
    /// Spawns nothing once halted.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.start_locked(&mut run).await
    }

    async fn start_locked(&self, run: &mut Option<Completion>) -> Result<()> {
        if run.as_ref().is_some_and(|current| !current.is_resolved()) {
            return Err(LifecycleError::AlreadyRunning(self.name().to_string()));
        }
        if self.halt.is_cancelled() {
            debug!(process = %self.name(), "halted; not starting");
            return Ok(());
        }
        let log_path = self.logs.path(self.name())?;
        info!(process = %self.name(), command = %self.spec.run.exec, "starting");
        *run = Some(self.runner.run(Some(&self.spec.run), &log_path).await?);
        Ok(())
    }

    /// Stops the process.
    ///
    /// Runs the stop command (if any) and waits for it, then sends SIGTERM to
    /// the whole tree of every tracked pid. Trees still alive after the grace
    /// period get SIGKILL. Returns once the run has resolved, and leaves an
    /// empty log behind. Does nothing if the process was never started.
    pub async fn stop(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await
    }

    async fn stop_locked(&self, run: &mut Option<Completion>) -> Result<()> {
        if run.is_none() && self.runner.handles().is_empty() {
            debug!(process = %self.name(), "stop: nothing to do");
            return Ok(());
        }
        info!(process = %self.name(), "stopping");
        if let Some(stop) = self.spec.stop.as_ref() {
            let log_path = self.logs.path(self.name())?;
            let code = self.runner.run(Some(stop), &log_path).await?.wait().await;
            debug!(process = %self.name(), code, "stop command finished");
        }

        self.signal_all(ProcessSignal::SigTerm);
        let finished = match run.as_ref() {
            Some(current) => tokio::time::timeout(self.shutdown.grace(), current.wait())
                .await
                .is_ok(),
            None => true,
        };
        if !finished || !self.runner.handles().is_empty() {
            warn!(process = %self.name(), "did not exit in time; killing");
            self.signal_all(ProcessSignal::SigKill);
        }
        if let Some(current) = run.take() {
            let code = current.wait().await;
            info!(process = %self.name(), code, "stopped");
        }
        self.logs.truncate(self.name())?;
        Ok(())
    }

    fn signal_all(&self, signal: ProcessSignal) {
        for pid in self.runner.handles() {
            let tree = signal_tree(pid, signal);
            debug!(process = %self.name(), pid, signal = signal.label(), targeted = tree.len(), "signaled tree");
        }
    }

    /// Stops then starts the run command.
    pub async fn restart(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await?;
        self.start_locked(&mut run).await
    }

    /// Stops, re-installs and starts again. Returns the install exit code.
    pub async fn rebuild(&self) -> Result<i32> {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await?;
        let code = self.install_locked().await?;
        self.start_locked(&mut run).await?;
        Ok(code)
    }

    /// Waits for the current run to finish, without blocking other operations.
    /// Returns `None` if nothing was started.
    pub async fn wait(&self) -> Option<i32> {
        let current = self.run.lock().await.clone();
        match current {
            Some(current) => Some(current.wait().await),
            None => None,
        }
    }

    pub async fn status(&self) -> ProcessStatus {
        let current = self.run.lock().await.clone();
        match current {
            None => ProcessStatus::Idle,
            Some(current) if current.is_resolved() => ProcessStatus::Exited {
                code: current.wait().await,
            },
            Some(_) => ProcessStatus::Running {
                pid: self.runner.handles().first().copied(),
            },
        }
    }
}
