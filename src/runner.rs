//! Shell command execution.
//!
//! This module contains the `CommandRunner`, which spawns a command through
//! `sh -c`, streams its stdout and stderr into the owning process's log file
//! and resolves with the exit code. Spawned pids are tracked so the owner can
//! signal them while the command is still running.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::LogError;
use crate::process::CommandSpec;

/// Exit code reported when the shell itself could not be spawned.
pub const SPAWN_FAILED_CODE: i32 = 127;

/// How long to keep draining output after the shell exits. Orphaned
/// grandchildren can hold the pipes open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The eventual exit code of a command. Cheap to clone; every clone resolves
/// to the same value.
#[derive(Clone)]
pub struct Completion(Shared<BoxFuture<'static, i32>>);

impl Completion {
    /// A completion that has already resolved.
    pub fn ready(code: i32) -> Self {
        Self(futures::future::ready(code).boxed().shared())
    }

    /// Waits for the exit code.
    pub async fn wait(&self) -> i32 {
        self.0.clone().await
    }

    /// The exit code, if the command has finished and someone observed it.
    pub fn peek(&self) -> Option<i32> {
        self.0.peek().copied()
    }

    /// Whether the command has finished.
    pub fn is_resolved(&self) -> bool {
        self.0.clone().now_or_never().is_some()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Completion").field(&self.peek()).finish()
    }
}

/// Runs commands on behalf of one managed process.
#[derive(Debug)]
pub struct CommandRunner {
    name: String,
    root: PathBuf,
    handles: Arc<Mutex<BTreeSet<u32>>>,
}

impl CommandRunner {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            handles: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Pids spawned by this runner that have not been reaped yet.
    pub fn handles(&self) -> Vec<u32> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Runs `spec`, appending its output to `log_path`.
    ///
    /// A missing or blank spec resolves to 0 without spawning anything. The
    /// spawned pid is registered before this returns. A non-zero exit, or a
    /// failure to spawn the shell, is reported through the exit code; only a
    /// log file that cannot be opened is an error.
    pub async fn run(
        &self,
        spec: Option<&CommandSpec>,
        log_path: &Path,
    ) -> Result<Completion, LogError> {
        let Some(spec) = spec.filter(|spec| !spec.is_noop()) else {
            return Ok(Completion::ready(0));
        };
        let mut log = open_append(log_path).await.map_err(|source| LogError::Open {
            path: log_path.to_path_buf(),
            source,
        })?;

        let script = format!("cd {} && {}", shell_words::quote(&spec.dir), spec.exec);
        let mut command = Command::new("sh");
        command.arg("-c").arg(&script).current_dir(&self.root);
        if !spec.env.is_empty() {
            command.envs(&spec.env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(process = %self.name, command = %spec.exec, error = %err, "failed to spawn");
                append_line(&self.name, &mut log, &format!("failed to spawn: {}", err)).await;
                return Ok(Completion::ready(SPAWN_FAILED_CODE));
            }
        };
        let pid = child.id();
        if let Some(pid) = pid {
            self.handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(pid);
        }
        debug!(process = %self.name, pid = ?pid, command = %spec.exec, "spawned");

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(self.name.clone(), stdout, log_path.to_path_buf())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(self.name.clone(), stderr, log_path.to_path_buf())));
        }

        let name = self.name.clone();
        let handles = Arc::clone(&self.handles);
        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    error!(process = %name, error = %err, "failed to wait for command");
                    1
                }
            };
            let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();
            if tokio::time::timeout(DRAIN_TIMEOUT, futures::future::join_all(pumps))
                .await
                .is_err()
            {
                debug!(process = %name, "output still open after exit; detaching");
                aborts.iter().for_each(|a| a.abort());
            }
            append_line(&name, &mut log, &format!("exited with code {}", code)).await;
            if let Some(pid) = pid {
                handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&pid);
            }
            code
        });

        let name = self.name.clone();
        Ok(Completion(
            async move {
                task.await.unwrap_or_else(|err| {
                    error!(process = %name, error = %err, "command task failed");
                    1
                })
            }
            .boxed()
            .shared(),
        ))
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

// tokio files complete writes in the background; flushing waits for them to land.
async fn write_flushed(log: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    log.write_all(bytes).await?;
    log.flush().await
}

async fn append_line(name: &str, log: &mut File, line: &str) {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'\n');
    if let Err(err) = write_flushed(log, &bytes).await {
        error!(process = %name, error = %err, "failed to write log");
    }
}

// Copy one output stream into the log, a line at a time.
async fn pump<R>(name: String, reader: R, log_path: PathBuf)
where
    R: AsyncRead + Unpin,
{
    let mut log = match open_append(&log_path).await {
        Ok(file) => Some(file),
        Err(err) => {
            error!(process = %name, path = %log_path.display(), error = %err, "failed to open log");
            None
        }
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(process = %name, error = %err, "output stream closed");
                break;
            }
        }
        if buf.last() != Some(&b'\n') {
            buf.push(b'\n');
        }
        // Keep draining even if writes fail so the child never blocks on a full pipe.
        if let Some(file) = log.as_mut() {
            if let Err(err) = write_flushed(file, &buf).await {
                error!(process = %name, error = %err, "failed to write log");
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
