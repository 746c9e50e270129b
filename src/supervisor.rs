//! Top-level orchestration.
//!
//! The [`Supervisor`] owns every managed process and the shared log store. It
//! runs the group lifecycle (initialize, rebuild all, die) and wires the
//! navigation graph that the interactive UI walks.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::{join_all, try_join_all, BoxFuture, FutureExt};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LogError;
use crate::logs::{sanitize_text, LogStore, TAIL_POLL_INTERVAL};
use crate::manager::{ManagedProcess, ShutdownConfig};
use crate::nav::{Finite, Graph, Input, Navigator, NodeId, Ongoing, Session, StateNode};
use crate::process::Descriptor;
use crate::terminal::print_line;

/// Lines replayed when following a single process.
const PROCESS_TAIL_REPLAY: usize = 100;
/// Lines replayed per process when following every process at once.
const ALL_TAIL_REPLAY: usize = 20;

pub struct Supervisor {
    logs: Arc<LogStore>,
    processes: Vec<Arc<ManagedProcess>>,
    shutdown: CancellationToken,
    stopped: OnceCell<()>,
}

impl Supervisor {
    /// Creates the supervisor and every log file up front.
    pub fn new(descriptor: Descriptor) -> Result<Self, LogError> {
        let logs = Arc::new(LogStore::new(&descriptor.root_dir, &descriptor.log_path));
        for spec in &descriptor.processes {
            logs.path(&spec.name)?;
        }
        let grace = ShutdownConfig::new(descriptor.shutdown_grace_ms);
        let shutdown = CancellationToken::new();
        let processes = descriptor
            .processes
            .into_iter()
            .map(|spec| {
                Arc::new(ManagedProcess::new(
                    spec,
                    Arc::clone(&logs),
                    descriptor.root_dir.clone(),
                    grace,
                    shutdown.clone(),
                ))
            })
            .collect();
        Ok(Self {
            logs,
            processes,
            shutdown,
            stopped: OnceCell::new(),
        })
    }

    /// Cancelled once [`die`](Self::die) has been called.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Installs every process concurrently, then starts them in configuration
    /// order. A process that fails to start is logged and skipped. Nothing more
    /// is started once [`die`](Self::die) has been called.
    pub async fn initialize(&self) -> Result<()> {
        try_join_all(self.processes.iter().map(|process| self.install_one(process))).await?;
        for process in &self.processes {
            if self.shutdown.is_cancelled() {
                debug!("shutting down; skipping remaining starts");
                break;
            }
            if let Err(err) = process.start().await {
                error!(process = %process.name(), error = %err, "failed to start");
            }
        }
        Ok(())
    }

    async fn install_one(&self, process: &ManagedProcess) -> Result<i32> {
        let name = process.name();
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }
        // Start from an empty file so the tail cannot miss the truncation.
        self.logs
            .truncate(name)
            .with_context(|| format!("failed to prepare log for {name}"))?;
        let mut tail = self
            .logs
            .tail(name, 0)
            .with_context(|| format!("failed to follow log for {name}"))?;

        let install = process.install();
        tokio::pin!(install);
        let code = loop {
            tokio::select! {
                code = &mut install => break code.with_context(|| format!("failed to install {name}"))?,
                Some(line) = tail.next_line() => forward(name, &line),
            }
        };

        // Give the tail a couple of polls to pick up the last install lines.
        let settle = tokio::time::sleep(TAIL_POLL_INTERVAL * 2);
        tokio::pin!(settle);
        loop {
            tokio::select! {
                _ = &mut settle => break,
                line = tail.next_line() => match line {
                    Some(line) => forward(name, &line),
                    None => break,
                },
            }
        }
        tail.cancel();
        Ok(code)
    }

    /// Stops everything, then initializes again.
    pub async fn rebuild_all(&self) -> Result<()> {
        info!("rebuilding all processes");
        self.stop_all().await;
        self.initialize().await
    }

    /// Stops every process concurrently.
    pub async fn stop_all(&self) {
        let results = join_all(self.processes.iter().map(|process| process.stop())).await;
        for (process, result) in self.processes.iter().zip(results) {
            if let Err(err) = result {
                error!(process = %process.name(), error = %err, "failed to stop");
            }
        }
    }

    /// Halts navigation and stops every process.
    ///
    /// The stop sequence runs once; concurrent and later callers wait for that
    /// same sequence.
    pub async fn die(&self) {
        self.shutdown.cancel();
        self.stopped
            .get_or_init(|| async {
                info!("shutting down");
                self.stop_all().await;
            })
            .await;
    }

    /// Builds the navigation graph and returns it with the main menu's id.
    pub fn build_graph(self: &Arc<Self>) -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let main = graph.reserve("main");

        let tail_all = graph.add(StateNode::prompt(
            "tail all",
            Some(self.follow(self.names(), ALL_TAIL_REPLAY, true)),
            main,
        ));
        let rebuild_all = graph.add(StateNode::action(
            "rebuild all",
            self.task(|sup| async move {
                if let Err(err) = sup.rebuild_all().await {
                    error!(error = %format!("{err:#}"), "rebuild all failed");
                }
            }),
            main,
        ));
        let quit = graph.add(StateNode::end(
            "quit",
            Some(self.task(|sup| async move { sup.die().await })),
        ));
        graph.define(main, StateNode::menu("main", None, vec![tail_all, rebuild_all, quit]));

        for idx in (0..self.processes.len()).rev() {
            let submenu = self.process_menu(&mut graph, idx, main);
            graph.prepend_option(main, submenu);
        }
        (graph, main)
    }

    fn process_menu(self: &Arc<Self>, graph: &mut Graph, idx: usize, main: NodeId) -> NodeId {
        let name = self.processes[idx].name().to_string();
        let menu = graph.reserve(name.clone());

        let tail = graph.add(StateNode::prompt(
            "tail",
            Some(self.follow(vec![name.clone()], PROCESS_TAIL_REPLAY, false)),
            menu,
        ));
        let restart = graph.add(StateNode::action(
            "restart",
            self.process_task(idx, |process| async move {
                if let Err(err) = process.restart().await {
                    error!(process = %process.name(), error = %err, "restart failed");
                }
            }),
            menu,
        ));
        let rebuild = graph.add(StateNode::action(
            "rebuild",
            self.process_task(idx, |process| async move {
                match process.rebuild().await {
                    Ok(0) => {}
                    Ok(code) => warn!(process = %process.name(), code, "rebuilt with failing install"),
                    Err(err) => error!(process = %process.name(), error = %err, "rebuild failed"),
                }
            }),
            menu,
        ));
        let stop = graph.add(StateNode::action(
            "stop",
            self.process_task(idx, |process| async move {
                if let Err(err) = process.stop().await {
                    error!(process = %process.name(), error = %err, "stop failed");
                }
            }),
            menu,
        ));
        let start = graph.add(StateNode::action(
            "start",
            self.process_task(idx, |process| async move {
                if let Err(err) = process.start().await {
                    error!(process = %process.name(), error = %err, "start failed");
                }
            }),
            menu,
        ));
        let back = graph.add(StateNode::action("back", Finite::from_fn(|| async {}), main));

        graph.define(
            menu,
            StateNode::menu(name, None, vec![tail, restart, rebuild, stop, start, back]),
        );
        menu
    }

    fn names(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.name().to_string()).collect()
    }

    fn task<F, Fut>(self: &Arc<Self>, task: F) -> Finite
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let sup = Arc::clone(self);
        Finite::from_fn(move || task(Arc::clone(&sup)))
    }

    fn process_task<F, Fut>(&self, idx: usize, task: F) -> Finite
    where
        F: Fn(Arc<ManagedProcess>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let process = Arc::clone(&self.processes[idx]);
        Finite::from_fn(move || {
            let work = task(Arc::clone(&process));
            let process = Arc::clone(&process);
            async move {
                work.await;
                let status = process.status().await;
                info!(process = %process.name(), status = %status.label(), "status");
            }
        })
    }

    fn follow(&self, names: Vec<String>, replay: usize, prefixed: bool) -> Ongoing {
        let logs = Arc::clone(&self.logs);
        Ongoing::new(move || LogFollow::new(Arc::clone(&logs), names.clone(), replay, prefixed))
    }

    /// Initializes, then walks the navigation graph until it exits, then dies.
    pub async fn run<I: Input>(self: &Arc<Self>, input: I) -> Result<()> {
        let result = self.initialize().await;
        if result.is_ok() {
            let (graph, main) = self.build_graph();
            let mut navigator = Navigator::new(graph, input, self.shutdown_token(), main);
            let exit = navigator.run().await;
            debug!(?exit, node = ?navigator.current(), "navigation finished");
        }
        self.die().await;
        result
    }

    /// Initializes, then prints every log until shutdown.
    pub async fn run_headless(&self) -> Result<()> {
        let result = self.initialize().await;
        if result.is_ok() {
            let mut follow = LogFollow::new(Arc::clone(&self.logs), self.names(), 0, true);
            tokio::select! {
                _ = follow.start() => {}
                _ = self.shutdown.cancelled() => {}
            }
            Box::new(follow).stop().await;
        }
        self.die().await;
        result
    }
}

fn forward(name: &str, line: &str) {
    info!(process = %name, "{}", sanitize_text(line));
}

/// Prints one or more process logs while a node is visited.
struct LogFollow {
    logs: Arc<LogStore>,
    names: Vec<String>,
    replay: usize,
    prefixed: bool,
    cancel: CancellationToken,
    printers: Vec<JoinHandle<()>>,
}

impl LogFollow {
    fn new(logs: Arc<LogStore>, names: Vec<String>, replay: usize, prefixed: bool) -> Self {
        Self {
            logs,
            names,
            replay,
            prefixed,
            cancel: CancellationToken::new(),
            printers: Vec::new(),
        }
    }
}

impl Session for LogFollow {
    fn start(&mut self) -> BoxFuture<'_, ()> {
        async move {
            for name in &self.names {
                let mut tail = match self.logs.tail(name, self.replay) {
                    Ok(tail) => tail,
                    Err(err) => {
                        warn!(process = %name, error = %err, "cannot follow log");
                        continue;
                    }
                };
                let prefix = if self.prefixed {
                    format!("[{}] ", name)
                } else {
                    String::new()
                };
                let cancel = self.cancel.clone();
                self.printers.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            line = tail.next_line() => match line {
                                Some(line) => print_line(&format!("{}{}", prefix, sanitize_text(&line))),
                                None => break,
                            },
                        }
                    }
                }));
            }
            self.cancel.cancelled().await;
        }
        .boxed()
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.cancel.cancel();
            join_all(self.printers).await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Choice, Key};
    use crate::process::{CommandSpec, ProcessSpec, ProcessStatus};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::TempDir;

    fn spec(name: &str, run: &str, install: Option<&str>) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            run: CommandSpec::new(run),
            install: install.map(CommandSpec::new),
            stop: None,
        }
    }

    fn supervisor(temp: &TempDir, processes: Vec<ProcessSpec>) -> Arc<Supervisor> {
        Arc::new(
            Supervisor::new(Descriptor {
                root_dir: temp.path().to_path_buf(),
                log_path: "logs".to_string(),
                shutdown_grace_ms: 500,
                processes,
            })
            .unwrap(),
        )
    }

    async fn wait_for_log(sup: &Supervisor, name: &str, needle: &str) -> String {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let log = read_log(sup, name);
                if log.contains(needle) {
                    return log;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn assert_all_stopped(sup: &Supervisor) {
        assert_eq!(total_handles(sup), 0);
        for process in &sup.processes {
            assert_eq!(process.status().await, ProcessStatus::Idle);
            let pending = tokio::time::timeout(Duration::from_secs(1), process.wait()).await;
            assert_eq!(pending.unwrap(), None);
        }
    }

    fn read_log(sup: &Supervisor, name: &str) -> String {
        std::fs::read_to_string(sup.logs.path(name).unwrap()).unwrap()
    }

    fn total_handles(sup: &Supervisor) -> usize {
        sup.processes.iter().map(|p| p.handle_count()).sum()
    }

    #[derive(Default)]
    struct Script {
        choices: VecDeque<Choice>,
    }

    impl Input for Script {
        fn present_choice<'a>(&'a mut self, _prompt: &'a str, _options: &'a [String]) -> BoxFuture<'a, Choice> {
            let next = self.choices.pop_front().unwrap_or(Choice::Interrupted);
            futures::future::ready(next).boxed()
        }

        fn next_key(&mut self) -> BoxFuture<'_, Key> {
            futures::future::ready(Key::Char(' ')).boxed()
        }
    }

    #[tokio::test]
    async fn initialize_installs_then_starts_everything() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(
            &temp,
            vec![
                spec("A", "echo running-A; sleep 30", Some("echo installed-A")),
                spec("B", "sleep 30", None),
            ],
        );
        sup.initialize().await.unwrap();

        let log = wait_for_log(&sup, "A", "running-A").await;
        assert_eq!(
            log.lines().collect::<Vec<_>>(),
            vec!["installed-A", "exited with code 0", "running-A"]
        );
        for process in &sup.processes {
            assert!(matches!(process.status().await, ProcessStatus::Running { .. }));
        }
        assert_eq!(total_handles(&sup), 2);

        tokio::time::timeout(Duration::from_secs(10), sup.die()).await.unwrap();
        assert_all_stopped(&sup).await;
        assert!(sup.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn exit_code_is_visible_after_initialize() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("C", "exit 3", None)]);
        sup.initialize().await.unwrap();
        assert_eq!(sup.processes[0].wait().await, Some(3));
        assert_eq!(read_log(&sup, "C").lines().last(), Some("exited with code 3"));
        sup.die().await;
    }

    #[tokio::test]
    async fn rebuild_all_restarts_processes() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("A", "sleep 30", Some("echo built"))]);
        sup.initialize().await.unwrap();
        sup.rebuild_all().await.unwrap();

        assert_eq!(total_handles(&sup), 1);
        assert_eq!(read_log(&sup, "A"), "built\nexited with code 0\n");
        sup.die().await;
        assert_eq!(total_handles(&sup), 0);
    }

    #[tokio::test]
    async fn rebuild_all_truncates_and_starts_in_order() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(
            &temp,
            vec![
                spec("A", "echo A >> order.txt; sleep 30", Some("echo built-A")),
                spec("B", "echo B >> order.txt; sleep 30", Some("echo built-B")),
            ],
        );
        sup.initialize().await.unwrap();
        sup.rebuild_all().await.unwrap();

        assert_eq!(read_log(&sup, "A"), "built-A\nexited with code 0\n");
        assert_eq!(read_log(&sup, "B"), "built-B\nexited with code 0\n");
        assert_eq!(total_handles(&sup), 2);

        // Starts are sequential, so the shells were forked in order.
        let pids: Vec<u32> = {
            let mut pids = Vec::new();
            for process in &sup.processes {
                match process.status().await {
                    ProcessStatus::Running { pid: Some(pid) } => pids.push(pid),
                    other => panic!("expected a running process, got {:?}", other),
                }
            }
            pids
        };
        assert!(pids[0] < pids[1], "start order was {:?}", pids);

        let order_path = temp.path().join("order.txt");
        tokio::time::timeout(Duration::from_secs(10), async {
            while std::fs::read_to_string(&order_path).unwrap_or_default().lines().count() < 4 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let order = std::fs::read_to_string(&order_path).unwrap();
        assert_eq!(order.matches('A').count(), 2);
        assert_eq!(order.matches('B').count(), 2);

        sup.die().await;
        assert_all_stopped(&sup).await;
    }

    #[tokio::test]
    async fn die_during_rebuild_leaves_nothing_running() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("A", "sleep 30", Some("sleep 1"))]);
        sup.initialize().await.unwrap();

        let rebuild = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.rebuild_all().await })
        };
        tokio::time::sleep(Duration::from_millis(400)).await;
        tokio::time::timeout(Duration::from_secs(10), sup.die()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), rebuild)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        sup.die().await;

        assert!(sup.shutdown_token().is_cancelled());
        assert_all_stopped(&sup).await;
    }

    #[test]
    fn log_files_exist_before_anything_runs() {
        let temp = TempDir::new().unwrap();
        let _sup = supervisor(&temp, vec![spec("Web App", "true", None)]);
        assert!(temp.path().join("logs").join("web-app.log").exists());
    }

    #[tokio::test]
    async fn concurrent_die_stops_once() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(
            &temp,
            vec![ProcessSpec {
                name: "A".to_string(),
                run: CommandSpec::new("sleep 30"),
                install: None,
                stop: Some(CommandSpec::new("echo stop >> stops.txt")),
            }],
        );
        sup.initialize().await.unwrap();

        let (a, b) = {
            let (first, second) = (Arc::clone(&sup), Arc::clone(&sup));
            tokio::join!(
                tokio::spawn(async move { first.die().await }),
                tokio::spawn(async move { second.die().await }),
            )
        };
        a.unwrap();
        b.unwrap();
        sup.die().await;

        let stops = std::fs::read_to_string(temp.path().join("stops.txt")).unwrap();
        assert_eq!(stops.lines().count(), 1);
        assert_eq!(total_handles(&sup), 0);
    }

    #[tokio::test]
    async fn graph_lists_processes_first() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("api", "true", None), spec("web", "true", None)]);
        let (graph, main) = sup.build_graph();

        assert_eq!(
            graph.option_labels(main),
            vec!["api", "web", "tail all", "rebuild all", "quit"]
        );
        for (idx, name) in ["api", "web"].into_iter().enumerate() {
            let submenu = graph.options(main)[idx];
            assert_eq!(graph.node(submenu).name(), name);
            assert_eq!(
                graph.option_labels(submenu),
                vec!["tail", "restart", "rebuild", "stop", "start", "back"]
            );
        }
    }

    #[tokio::test]
    async fn quit_from_menu_stops_everything() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("api", "sleep 30", None)]);
        // api, tail all, rebuild all, quit
        let input = Script {
            choices: VecDeque::from([Choice::Selected(3)]),
        };
        tokio::time::timeout(Duration::from_secs(10), sup.run(input))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total_handles(&sup), 0);
        assert!(sup.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn interrupted_navigation_still_dies() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("api", "sleep 30", None)]);
        tokio::time::timeout(Duration::from_secs(10), sup.run(Script::default()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(total_handles(&sup), 0);
    }

    #[tokio::test]
    async fn headless_run_ends_on_die() {
        let temp = TempDir::new().unwrap();
        let sup = supervisor(&temp, vec![spec("api", "sleep 30", None)]);
        let runner = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.run_headless().await })
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            while sup.processes[0].handle_count() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        sup.die().await;
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(total_handles(&sup), 0);
    }
}
