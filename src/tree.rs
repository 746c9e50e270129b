//! Whole-process-tree signaling.
//!
//! Shells and package-manager wrappers often keep grandchildren alive after the
//! immediate child is signaled, so termination targets every descendant of a
//! pid as well as its process group.
//!
//! - **Linux**: walks `/proc/<pid>/task/<pid>/children`, falling back to a scan
//!   of `/proc/*/stat`
//! - **macOS**: asks `pgrep -P`
//! - **Other**: only the root is known

/// Signals understood by [`signal_tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

/// Returns `root` followed by all of its descendants, parents before children.
pub fn collect_tree(root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    let mut idx = 0;
    while idx < tree.len() {
        for child in find_children(tree[idx]) {
            if !tree.contains(&child) {
                tree.push(child);
            }
        }
        idx += 1;
    }
    tree
}

/// Sends `signal` to `root`, every descendant and the process group led by `root`.
///
/// The tree is collected before anything is signaled, since descendants get
/// reparented once their parent dies. Returns the pids that were targeted.
pub fn signal_tree(root: u32, signal: ProcessSignal) -> Vec<u32> {
    let tree = collect_tree(root);
    send_group_signal(root, signal);
    // Leaves first.
    for pid in tree.iter().rev() {
        send_os_signal(*pid, signal);
    }
    tree
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    unsafe {
        let _ = libc::kill(pid, raw_signal(signal));
    }
}

#[cfg(unix)]
fn send_group_signal(leader: u32, signal: ProcessSignal) {
    let Ok(pid) = i32::try_from(leader) else {
        return;
    };
    unsafe {
        let _ = libc::kill(-pid, raw_signal(signal));
    }
}

#[cfg(unix)]
fn raw_signal(signal: ProcessSignal) -> i32 {
    match signal {
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigKill => libc::SIGKILL,
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, _signal: ProcessSignal) {
    // No signals here; taskkill takes the whole tree down.
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output();
}

#[cfg(not(unix))]
fn send_group_signal(_leader: u32, _signal: ProcessSignal) {}

#[cfg(target_os = "linux")]
fn find_children(pid: u32) -> Vec<u32> {
    // /proc/<pid>/task/<pid>/children needs CONFIG_PROC_CHILDREN.
    let children_path = format!("/proc/{pid}/task/{pid}/children");
    if let Ok(contents) = std::fs::read_to_string(&children_path) {
        return contents
            .split_whitespace()
            .filter_map(|s| s.parse::<u32>().ok())
            .collect();
    }
    scan_children_from_proc(pid)
}

#[cfg(target_os = "linux")]
fn scan_children_from_proc(ppid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(child_pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{child_pid}/stat")) else {
            continue;
        };
        if parent_from_stat(&stat) == Some(ppid) {
            children.push(child_pid);
        }
    }
    children
}

/// Parses the parent pid out of a `/proc/<pid>/stat` line: `pid (comm) state ppid ...`.
#[cfg(target_os = "linux")]
fn parent_from_stat(stat: &str) -> Option<u32> {
    let end = stat.rfind(')')?;
    stat.get(end + 2..)?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(target_os = "macos")]
fn find_children(pid: u32) -> Vec<u32> {
    std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| {
            s.lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn find_children(_pid: u32) -> Vec<u32> {
    Vec::new()
}
