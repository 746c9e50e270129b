//! Per-process log files.
//!
//! Every supervised process owns one append-only log file under the configured
//! log directory. The [`LogStore`] resolves (and memoizes) those paths, truncates
//! them between lifecycle segments, and hands out [`Tail`] subscriptions that
//! replay the most recent lines and then follow new writes.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use strip_ansi_escapes::strip;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LogError;

/// How often a tail checks its file for new data.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(150);

const TAIL_CHANNEL_CAPACITY: usize = 256;

/// Resolves, creates and tails process log files.
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    paths: Mutex<HashMap<String, PathBuf>>,
}

impl LogStore {
    /// Creates a store writing to `<root_dir>/<log_path>`.
    pub fn new(root_dir: &Path, log_path: &str) -> Self {
        Self {
            dir: root_dir.join(log_path),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the log file path for a process.
    ///
    /// The first call for a given name creates the log directory and creates
    /// (or truncates) the file. Later calls return the cached path untouched.
    pub fn path(&self, name: &str) -> Result<PathBuf, LogError> {
        let mut paths = self.paths.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(path) = paths.get(name) {
            return Ok(path.clone());
        }
        std::fs::create_dir_all(&self.dir).map_err(|source| LogError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{}.log", slugify(name)));
        std::fs::File::create(&path).map_err(|source| LogError::Open {
            path: path.clone(),
            source,
        })?;
        paths.insert(name.to_string(), path.clone());
        Ok(path)
    }

    /// Empties the log file for a process.
    pub fn truncate(&self, name: &str) -> Result<(), LogError> {
        let path = self.path(name)?;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| LogError::Truncate { path, source })?;
        Ok(())
    }

    /// Subscribes to a process log.
    ///
    /// Up to `replay` of the lines already in the file are yielded first (0 means
    /// none), followed by every complete line appended afterwards, until the
    /// returned [`Tail`] is cancelled or dropped.
    pub fn tail(&self, name: &str, replay: usize) -> Result<Tail, LogError> {
        let path = self.path(name)?;
        let snapshot = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let (tx, rx) = mpsc::channel(TAIL_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(follow(path, replay, snapshot, tx, cancel.clone()));
        Ok(Tail { lines: rx, cancel })
    }
}

/// A live subscription to a log file.
#[derive(Debug)]
pub struct Tail {
    lines: mpsc::Receiver<String>,
    cancel: CancellationToken,
}

impl Tail {
    /// Waits for the next line. Returns `None` once the tail is cancelled.
    pub async fn next_line(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.lines.recv() => line,
        }
    }

    /// Stops following. Calling this more than once is harmless.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns a process name into its log file stem.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// Strips ANSI escape codes for plain-text display. Invalid UTF-8 is replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// A fixed-capacity ring buffer keeping the most recent lines.
#[derive(Debug, Clone)]
struct RecentLines {
    max_lines: usize,
    lines: VecDeque<String>,
}

impl RecentLines {
    fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line, dropping the oldest ones beyond capacity.
    fn push(&mut self, line: String) {
        if self.max_lines == 0 {
            return;
        }
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn into_lines(self) -> VecDeque<String> {
        self.lines
    }
}

async fn follow(
    path: PathBuf,
    replay: usize,
    snapshot: u64,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    // Replay from what was on disk when the tail was opened. A trailing partial
    // line is left for the follow loop.
    let mut offset = match read_complete_lines(&path, 0, Some(snapshot), RecentLines::new(replay)).await {
        Ok((recent, next)) => {
            for line in recent.into_lines() {
                if !deliver(&tx, &cancel, line).await {
                    return;
                }
            }
            next
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to replay log");
            snapshot
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => {}
        }
        let len = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "log not readable yet");
                continue;
            }
        };
        if len < offset {
            // Truncated underneath us; start over.
            offset = 0;
        }
        if len == offset {
            continue;
        }
        match read_complete_lines(&path, offset, None, RecentLines::new(usize::MAX)).await {
            Ok((lines, next)) => {
                offset = next;
                for line in lines.into_lines() {
                    if !deliver(&tx, &cancel, line).await {
                        return;
                    }
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "failed to read log"),
        }
    }
}

async fn deliver(tx: &mpsc::Sender<String>, cancel: &CancellationToken, line: String) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(line) => sent.is_ok(),
    }
}

/// Reads newline-terminated lines starting at `offset`, stopping at `limit`
/// bytes (or EOF). Returns the retained lines and the offset just past the last
/// complete line.
async fn read_complete_lines(
    path: &Path,
    offset: u64,
    limit: Option<u64>,
    mut keep: RecentLines,
) -> std::io::Result<(RecentLines, u64)> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let span = limit.map(|end| end.saturating_sub(offset)).unwrap_or(u64::MAX);
    let mut reader = BufReader::new(file.take(span));
    let mut consumed = offset;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        consumed += read as u64;
        let text = String::from_utf8_lossy(&buf);
        keep.push(text.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok((keep, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(tail: &mut Tail) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), tail.next_line())
            .await
            .expect("timed out waiting for a log line")
    }

    async fn nothing_within(tail: &mut Tail, wait: Duration) -> bool {
        tokio::time::timeout(wait, tail.next_line()).await.is_err()
    }

    #[test]
    fn slugify_lowercases_and_hyphenates() {
        assert_eq!(slugify("Web App Server"), "web-app-server");
        assert_eq!(slugify("api"), "api");
    }

    #[test]
    fn path_is_memoized_and_creates_file() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs/nested");
        let path = store.path("My Service").unwrap();
        assert_eq!(path, temp.path().join("logs/nested/my-service.log"));
        assert!(path.exists());

        append(&path, "kept\n");
        let again = store.path("My Service").unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn truncate_empties_file() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "one\ntwo\n");
        store.truncate("api").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn path_fails_when_directory_cannot_be_created() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "file, not a dir").unwrap();
        let store = LogStore::new(&blocker, "logs");
        let err = store.path("api").unwrap_err();
        assert!(matches!(err, LogError::CreateDir { .. }));
    }

    #[tokio::test]
    async fn tail_replays_last_lines_then_follows() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "L1\nL2\nL3\nL4\nL5\n");

        let mut tail = store.tail("api", 2).unwrap();
        append(&path, "L6\n");

        assert_eq!(next(&mut tail).await.as_deref(), Some("L4"));
        assert_eq!(next(&mut tail).await.as_deref(), Some("L5"));
        assert_eq!(next(&mut tail).await.as_deref(), Some("L6"));
    }

    #[tokio::test]
    async fn tail_replays_no_more_than_available() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "a\nb\n");

        let mut tail = store.tail("api", 10).unwrap();
        assert_eq!(next(&mut tail).await.as_deref(), Some("a"));
        assert_eq!(next(&mut tail).await.as_deref(), Some("b"));
        assert!(nothing_within(&mut tail, Duration::from_millis(400)).await);

        append(&path, "c\n");
        assert_eq!(next(&mut tail).await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn tail_zero_only_yields_new_lines() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "old\n");

        let mut tail = store.tail("api", 0).unwrap();
        append(&path, "new\n");
        assert_eq!(next(&mut tail).await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn tail_waits_for_line_terminator() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();

        let mut tail = store.tail("api", 0).unwrap();
        append(&path, "par");
        assert!(nothing_within(&mut tail, Duration::from_millis(400)).await);
        append(&path, "tial\n");
        assert_eq!(next(&mut tail).await.as_deref(), Some("partial"));
    }

    #[tokio::test]
    async fn tail_restarts_after_truncation() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "before truncation with a long line\n");

        let mut tail = store.tail("api", 0).unwrap();
        store.truncate("api").unwrap();
        tokio::time::sleep(TAIL_POLL_INTERVAL * 3).await;
        append(&path, "fresh\n");
        assert_eq!(next(&mut tail).await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn concurrent_tails_see_same_lines() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();

        let mut first = store.tail("api", 0).unwrap();
        let mut second = store.tail("api", 0).unwrap();
        append(&path, "shared\n");
        assert_eq!(next(&mut first).await.as_deref(), Some("shared"));
        assert_eq!(next(&mut second).await.as_deref(), Some("shared"));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = LogStore::new(temp.path(), "logs");
        let path = store.path("api").unwrap();
        append(&path, "line\n");

        let mut tail = store.tail("api", 5).unwrap();
        tail.cancel();
        tail.cancel();
        assert_eq!(tail.next_line().await, None);
    }

    #[test]
    fn sanitize_strips_ansi() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m"), "red");
    }
}
