//! Interactive navigation as a state machine.
//!
//! The UI is a directed graph of [`StateNode`]s stored in a [`Graph`] arena and
//! addressed by [`NodeId`]. Cycles are plain edges. Entering a node creates a
//! fresh [`Session`] from the node's factory; the [`Navigator`] owns that
//! session for the visit and always awaits its `stop` before entering the next
//! node, so visits never overlap.
//!
//! There are two kinds of factory. A [`Finite`] session's `start` runs to
//! completion, so Action and End nodes only accept those. An [`Ongoing`]
//! session's `start` may keep going for as long as the visit lasts (following
//! a log, say), so Prompt and Menu nodes only accept those and abandon `start`
//! when input arrives.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{Choice, Key};

/// Stable address of a node in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// The work attached to one visit of a node.
pub trait Session: Send {
    /// Does the visit's work.
    fn start(&mut self) -> BoxFuture<'_, ()>;
    /// Releases whatever the visit holds. Called exactly once, after `start`
    /// has finished or been abandoned.
    fn stop(self: Box<Self>) -> BoxFuture<'static, ()>;
}

type Factory = Arc<dyn Fn() -> Box<dyn Session> + Send + Sync>;

/// Creates sessions whose `start` resolves.
#[derive(Clone)]
pub struct Finite(Factory);

/// Creates sessions whose `start` may run until the visit ends.
#[derive(Clone)]
pub struct Ongoing(Factory);

impl Finite {
    pub fn new<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Session + 'static,
    {
        Self(Arc::new(move || Box::new(factory()) as Box<dyn Session>))
    }

    /// A task with nothing to release afterwards.
    pub fn from_fn<F, Fut>(task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(move || OneShot(Some(task().boxed())))
    }
}

impl Ongoing {
    pub fn new<F, S>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Session + 'static,
    {
        Self(Arc::new(move || Box::new(factory()) as Box<dyn Session>))
    }
}

struct OneShot(Option<BoxFuture<'static, ()>>);

impl Session for OneShot {
    fn start(&mut self) -> BoxFuture<'_, ()> {
        match self.0.take() {
            Some(work) => work,
            None => futures::future::ready(()).boxed(),
        }
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

/// What a node does and where it leads.
pub enum NodeKind {
    /// Terminal node. Runs its task, then traversal finishes.
    End { task: Option<Finite> },
    /// Runs its task to completion, then moves on.
    Action { task: Finite, on_complete: NodeId },
    /// Waits for any key, then moves on.
    Prompt { watch: Option<Ongoing>, on_any_key: NodeId },
    /// Lets the user pick one of its options.
    Menu { watch: Option<Ongoing>, options: Vec<NodeId> },
}

/// One vertex of the navigation graph.
pub struct StateNode {
    name: String,
    kind: NodeKind,
}

impl StateNode {
    pub fn end(name: impl Into<String>, task: Option<Finite>) -> Self {
        Self::with_kind(name, NodeKind::End { task })
    }

    pub fn action(name: impl Into<String>, task: Finite, on_complete: NodeId) -> Self {
        Self::with_kind(name, NodeKind::Action { task, on_complete })
    }

    pub fn prompt(name: impl Into<String>, watch: Option<Ongoing>, on_any_key: NodeId) -> Self {
        Self::with_kind(name, NodeKind::Prompt { watch, on_any_key })
    }

    pub fn menu(name: impl Into<String>, watch: Option<Ongoing>, options: Vec<NodeId>) -> Self {
        Self::with_kind(name, NodeKind::Menu { watch, options })
    }

    fn with_kind(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiates this visit's session, if the node has any work attached.
    pub fn enter(&self) -> Option<Box<dyn Session>> {
        let factory = match &self.kind {
            NodeKind::End { task } => task.as_ref().map(|t| &t.0),
            NodeKind::Action { task, .. } => Some(&task.0),
            NodeKind::Prompt { watch, .. } | NodeKind::Menu { watch, .. } => {
                watch.as_ref().map(|w| &w.0)
            }
        };
        factory.map(|factory| factory())
    }
}

/// Arena of nodes.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<StateNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: StateNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Allocates an id before its node can be built, for wiring cycles.
    /// The placeholder is an End node until [`define`](Self::define) replaces it.
    pub fn reserve(&mut self, name: impl Into<String>) -> NodeId {
        self.add(StateNode::end(name, None))
    }

    pub fn define(&mut self, id: NodeId, node: StateNode) {
        self.nodes[id.0] = node;
    }

    /// Puts `option` at the front of a menu's options.
    ///
    /// # Panics
    ///
    /// Panics if `menu` is not a Menu node.
    pub fn prepend_option(&mut self, menu: NodeId, option: NodeId) {
        match &mut self.nodes[menu.0].kind {
            NodeKind::Menu { options, .. } => options.insert(0, option),
            _ => panic!("node {:?} is not a menu", self.nodes[menu.0].name),
        }
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.0]
    }

    /// A menu's options, in order. Empty for other kinds.
    pub fn options(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Menu { options, .. } => options,
            _ => &[],
        }
    }

    /// Display labels of a menu's options, in order.
    pub fn option_labels(&self, id: NodeId) -> Vec<String> {
        self.options(id)
            .iter()
            .map(|option| self.node(*option).name.clone())
            .collect()
    }
}

/// Terminal input, as the navigator sees it.
pub trait Input: Send {
    /// Shows `options` under `prompt` and resolves with the user's pick.
    fn present_choice<'a>(&'a mut self, prompt: &'a str, options: &'a [String]) -> BoxFuture<'a, Choice>;
    /// Resolves on the next key press.
    fn next_key(&mut self) -> BoxFuture<'_, Key>;
}

/// Why traversal stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// An End node was reached.
    Finished,
    /// The shutdown token was cancelled.
    Halted,
    /// The user pressed the interrupt key.
    Interrupted,
}

enum Step {
    Next(NodeId),
    Exit(Exit),
}

/// Walks a [`Graph`], one node at a time.
pub struct Navigator<I> {
    graph: Graph,
    input: I,
    shutdown: CancellationToken,
    current: NodeId,
}

impl<I: Input> Navigator<I> {
    pub fn new(graph: Graph, input: I, shutdown: CancellationToken, start: NodeId) -> Self {
        Self {
            graph,
            input,
            shutdown,
            current: start,
        }
    }

    pub fn current(&self) -> NodeId {
        self.current
    }

    /// Traverses until an End node, an interrupt, or shutdown.
    ///
    /// # Panics
    ///
    /// Panics if the input returns a menu index outside the presented options.
    pub async fn run(&mut self) -> Exit {
        loop {
            if self.shutdown.is_cancelled() {
                return Exit::Halted;
            }
            match self.step().await {
                Step::Next(next) => self.current = next,
                Step::Exit(exit) => return exit,
            }
        }
    }

    async fn step(&mut self) -> Step {
        let node = self.graph.node(self.current);
        debug!(node = %node.name(), "entering");
        let mut session = node.enter();

        match &node.kind {
            NodeKind::Action { on_complete, .. } => {
                if let Some(session) = session.as_mut() {
                    session.start().await;
                }
                release(session).await;
                Step::Next(*on_complete)
            }
            NodeKind::End { .. } => {
                if let Some(session) = session.as_mut() {
                    session.start().await;
                }
                release(session).await;
                Step::Exit(Exit::Finished)
            }
            NodeKind::Prompt { on_any_key, .. } => {
                let key = while_running(&mut session, &self.shutdown, self.input.next_key()).await;
                release(session).await;
                match key {
                    None => Step::Exit(Exit::Halted),
                    Some(Key::Interrupt) => Step::Exit(Exit::Interrupted),
                    Some(_) => Step::Next(*on_any_key),
                }
            }
            NodeKind::Menu { options, .. } => {
                let labels = self.graph.option_labels(self.current);
                let choice = while_running(
                    &mut session,
                    &self.shutdown,
                    self.input.present_choice(&node.name, &labels),
                )
                .await;
                release(session).await;
                match choice {
                    None => Step::Exit(Exit::Halted),
                    Some(Choice::Interrupted) => Step::Exit(Exit::Interrupted),
                    Some(Choice::Selected(idx)) => Step::Next(options[idx]),
                }
            }
        }
    }
}

// Drives the session's start alongside `wait`. Start finishing early is fine;
// once `wait` resolves, start is dropped. `None` means shutdown won.
async fn while_running<T>(
    session: &mut Option<Box<dyn Session>>,
    shutdown: &CancellationToken,
    wait: impl Future<Output = T>,
) -> Option<T> {
    let work = async {
        if let Some(session) = session.as_mut() {
            session.start().await;
        }
    };
    tokio::pin!(work);
    tokio::pin!(wait);
    let mut working = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut work, if working => working = false,
            _ = shutdown.cancelled() => return None,
            value = &mut wait => return Some(value),
        }
    }
}

async fn release(session: Option<Box<dyn Session>>) {
    if let Some(session) = session {
        session.stop().await;
    }
}
