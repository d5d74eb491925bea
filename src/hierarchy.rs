//! Hierarchy tracker
//!
//! Live parent/child process tree. Nodes live in an arena indexed by process
//! id and are kept after their process exits, so history stays queryable for
//! the lifetime of the tracker.
//!
//! A child whose parent is unknown or already stopped when it registers is an
//! orphan: the edge is kept in a separate orphan map, the child is listed as a
//! root, and tree queries reattach it under the recorded parent. Reattachment
//! is applied at every level, so grandchildren of a dead intermediate are
//! still found.
//!
//! Node states: `Running -> Stopping -> Stopped`, or `Running -> Stopped` on an
//! unexpected exit. `Stopped` is terminal.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Role;
use crate::token::ProcessId;
use crate::wait::poll_until;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("process {0} is not tracked")]
    UnknownProcess(ProcessId),

    #[error("process {0} is already tracked")]
    AlreadyTracked(ProcessId),

    #[error("{0}")]
    LimitExceeded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Running,
    Stopping,
    Stopped,
}

/// Limits enforced before a spawn or registration is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Deepest permitted node; the root is depth 0.
    pub max_depth: usize,
    /// Live direct children per node, orphans included.
    pub max_children: usize,
    /// Live processes across the whole tracker.
    pub max_live: usize,
    /// Wall-clock lifetime after which a running process is reaped.
    pub process_timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_children: 32,
            max_live: 512,
            process_timeout_secs: 3_600,
        }
    }
}

/// Graceful-then-forceful termination timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationSettings {
    pub grace_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            grace_timeout_ms: 5_000,
            poll_interval_ms: 50,
        }
    }
}

/// OS-facing signalling for termination.
pub trait ProcessSignaler: Send + Sync {
    /// Ask the process to exit (SIGTERM or equivalent).
    fn terminate(&self, pid: &ProcessId) -> std::io::Result<()>;

    /// Kill the process unconditionally (SIGKILL or equivalent).
    fn kill(&self, pid: &ProcessId) -> std::io::Result<()>;

    fn is_alive(&self, pid: &ProcessId) -> bool;
}

#[derive(Debug, Clone)]
struct HierarchyNode {
    pid: ProcessId,
    parent: Option<ProcessId>,
    role: Role,
    state: NodeState,
    depth: usize,
    children: Vec<usize>,
    registered_at: Instant,
    exit_status: Option<i32>,
}

#[derive(Debug, Default)]
struct Arena {
    nodes: Vec<HierarchyNode>,
    index: HashMap<ProcessId, usize>,
    /// child -> parent it could not attach to
    orphans: HashMap<ProcessId, ProcessId>,
}

impl Arena {
    fn node(&self, pid: &ProcessId) -> Option<&HierarchyNode> {
        self.index.get(pid).map(|&i| &self.nodes[i])
    }

    fn node_mut(&mut self, pid: &ProcessId) -> Option<&mut HierarchyNode> {
        let i = *self.index.get(pid)?;
        Some(&mut self.nodes[i])
    }

    fn orphans_by_parent(&self) -> HashMap<&ProcessId, Vec<&ProcessId>> {
        let mut map: HashMap<&ProcessId, Vec<&ProcessId>> = HashMap::new();
        for (child, parent) in &self.orphans {
            map.entry(parent).or_default().push(child);
        }
        for children in map.values_mut() {
            children.sort();
        }
        map
    }

    fn live_children(&self, pid: &ProcessId) -> usize {
        let direct = self
            .node(pid)
            .map(|n| {
                n.children
                    .iter()
                    .filter(|&&c| self.nodes[c].state != NodeState::Stopped)
                    .count()
            })
            .unwrap_or(0);
        let orphaned = self
            .orphans
            .iter()
            .filter(|(child, parent)| {
                *parent == pid && self.node(child).is_some_and(|n| n.state != NodeState::Stopped)
            })
            .count();
        direct + orphaned
    }

    fn live(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state != NodeState::Stopped)
            .count()
    }
}

/// Snapshot of a subtree with orphans reattached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTree {
    pub process_id: ProcessId,
    pub role: Role,
    pub state: NodeState,
    /// Reached through the orphan map rather than a direct child link.
    pub reattached: bool,
    pub exit_status: Option<i32>,
    pub children: Vec<ProcessTree>,
}

impl ProcessTree {
    /// Ids in pre-order (parents before children).
    pub fn ids(&self) -> Vec<ProcessId> {
        let mut out = vec![self.process_id.clone()];
        for child in &self.children {
            out.extend(child.ids());
        }
        out
    }

    /// Ids in post-order (children before parents).
    pub fn post_order(&self) -> Vec<ProcessId> {
        let mut out = Vec::new();
        for child in &self.children {
            out.extend(child.post_order());
        }
        out.push(self.process_id.clone());
        out
    }

    pub fn contains(&self, pid: &ProcessId) -> bool {
        &self.process_id == pid || self.children.iter().any(|c| c.contains(pid))
    }
}

#[derive(Debug, Default)]
pub struct HierarchyTracker {
    arena: RwLock<Arena>,
    limits: ResourceLimits,
    termination: TerminationSettings,
}

impl HierarchyTracker {
    pub fn new(limits: ResourceLimits, termination: TerminationSettings) -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
            limits,
            termination,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Track a newly registered process.
    pub fn register(
        &self,
        pid: ProcessId,
        parent: Option<ProcessId>,
        role: Role,
        depth: usize,
    ) -> Result<(), TrackerError> {
        let mut arena = self.arena.write();
        if arena.index.contains_key(&pid) {
            return Err(TrackerError::AlreadyTracked(pid));
        }

        let idx = arena.nodes.len();
        arena.nodes.push(HierarchyNode {
            pid: pid.clone(),
            parent: parent.clone(),
            role,
            state: NodeState::Running,
            depth,
            children: Vec::new(),
            registered_at: Instant::now(),
            exit_status: None,
        });
        arena.index.insert(pid.clone(), idx);

        if let Some(parent) = parent {
            let attachable = arena
                .node(&parent)
                .is_some_and(|p| p.state != NodeState::Stopped);
            match arena.index.get(&parent).copied() {
                Some(p) if attachable => arena.nodes[p].children.push(idx),
                _ => {
                    log::info!("process {pid} registered as orphan of {parent}");
                    arena.orphans.insert(pid, parent);
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, pid: &ProcessId) -> Option<NodeState> {
        self.arena.read().node(pid).map(|n| n.state)
    }

    pub fn parent_of(&self, pid: &ProcessId) -> Option<ProcessId> {
        self.arena.read().node(pid).and_then(|n| n.parent.clone())
    }

    pub fn is_orphan(&self, pid: &ProcessId) -> bool {
        self.arena.read().orphans.contains_key(pid)
    }

    /// Processes with no attached parent: true roots and orphans.
    pub fn roots(&self) -> Vec<ProcessId> {
        let arena = self.arena.read();
        let mut roots: Vec<ProcessId> = arena
            .nodes
            .iter()
            .filter(|n| n.parent.is_none() || arena.orphans.contains_key(&n.pid))
            .map(|n| n.pid.clone())
            .collect();
        roots.sort();
        roots
    }

    pub fn live_count(&self) -> usize {
        self.arena.read().live()
    }

    /// Admission check for a process about to exist at `depth` under `parent`.
    pub fn check_admission(&self, parent: Option<&ProcessId>, depth: usize) -> Result<(), TrackerError> {
        let arena = self.arena.read();
        if depth > self.limits.max_depth {
            return Err(TrackerError::LimitExceeded(format!(
                "depth {depth} exceeds max_depth {}",
                self.limits.max_depth
            )));
        }
        let live = arena.live();
        if live >= self.limits.max_live {
            return Err(TrackerError::LimitExceeded(format!(
                "{live} live processes, max_live is {}",
                self.limits.max_live
            )));
        }
        if let Some(parent) = parent {
            let children = arena.live_children(parent);
            if children >= self.limits.max_children {
                return Err(TrackerError::LimitExceeded(format!(
                    "{parent} has {children} live children, max_children is {}",
                    self.limits.max_children
                )));
            }
        }
        Ok(())
    }

    /// Admission check a tracked parent runs before spawning.
    pub fn check_spawn(&self, parent: &ProcessId) -> Result<(), TrackerError> {
        let depth = self
            .arena
            .read()
            .node(parent)
            .map(|n| n.depth + 1)
            .ok_or_else(|| TrackerError::UnknownProcess(parent.clone()))?;
        self.check_admission(Some(parent), depth)
    }

    /// The subtree under `root`, with orphans reattached recursively.
    pub fn get_tree(&self, root: &ProcessId) -> Option<ProcessTree> {
        let arena = self.arena.read();
        let orphans = arena.orphans_by_parent();
        let mut visited = HashSet::new();
        build_tree(&arena, &orphans, root, false, &mut visited)
    }

    /// Record an exit notification. Returns `false` if the node was already
    /// stopped.
    pub fn mark_exited(&self, pid: &ProcessId, exit_status: Option<i32>) -> Result<bool, TrackerError> {
        let mut arena = self.arena.write();
        let node = arena
            .node_mut(pid)
            .ok_or_else(|| TrackerError::UnknownProcess(pid.clone()))?;
        if node.state == NodeState::Stopped {
            return Ok(false);
        }
        node.state = NodeState::Stopped;
        node.exit_status = exit_status;
        Ok(true)
    }

    /// Mark running processes older than the wall-clock timeout as stopped,
    /// freeing their slots. Returns the reaped ids.
    pub fn reap_expired(&self, now: Instant) -> Vec<ProcessId> {
        let timeout = Duration::from_secs(self.limits.process_timeout_secs);
        let mut arena = self.arena.write();
        let mut reaped = Vec::new();
        for node in arena.nodes.iter_mut() {
            if node.state == NodeState::Running
                && now.saturating_duration_since(node.registered_at) >= timeout
            {
                node.state = NodeState::Stopped;
                reaped.push(node.pid.clone());
            }
        }
        if !reaped.is_empty() {
            log::warn!("reaped {} process(es) past their wall-clock timeout", reaped.len());
        }
        reaped
    }

    /// Terminate `root` and everything below it, children first.
    ///
    /// Each running process is sent a graceful signal and given the grace
    /// timeout to exit before it is killed; with `forceful` it is killed at
    /// once. Returns the ids this call terminated, in termination order.
    pub fn terminate_tree(
        &self,
        root: &ProcessId,
        forceful: bool,
        signaler: &dyn ProcessSignaler,
    ) -> Result<Vec<ProcessId>, TrackerError> {
        let tree = self
            .get_tree(root)
            .ok_or_else(|| TrackerError::UnknownProcess(root.clone()))?;

        let mut terminated = Vec::new();
        for pid in tree.post_order() {
            if !self.begin_stop(&pid) {
                continue;
            }
            self.stop_process(&pid, forceful, signaler);
            if let Some(node) = self.arena.write().node_mut(&pid) {
                node.state = NodeState::Stopped;
            }
            terminated.push(pid);
        }
        log::info!("terminated {} process(es) under {root}", terminated.len());
        Ok(terminated)
    }

    /// Running -> Stopping. Returns `false` if the node was not running.
    fn begin_stop(&self, pid: &ProcessId) -> bool {
        let mut arena = self.arena.write();
        match arena.node_mut(pid) {
            Some(node) if node.state == NodeState::Running => {
                node.state = NodeState::Stopping;
                true
            }
            _ => false,
        }
    }

    fn stop_process(&self, pid: &ProcessId, forceful: bool, signaler: &dyn ProcessSignaler) {
        if !forceful {
            match signaler.terminate(pid) {
                Ok(()) => {
                    let grace = Duration::from_millis(self.termination.grace_timeout_ms);
                    let interval = Duration::from_millis(self.termination.poll_interval_ms.max(1));
                    if poll_until(grace, interval, || !signaler.is_alive(pid)).is_ok() {
                        return;
                    }
                    log::warn!("{pid} still alive after grace period, killing");
                }
                Err(err) => log::warn!("graceful stop of {pid} failed: {err}, killing"),
            }
        }
        if let Err(err) = signaler.kill(pid) {
            log::warn!("kill of {pid} failed: {err}");
        }
    }
}

fn build_tree(
    arena: &Arena,
    orphans: &HashMap<&ProcessId, Vec<&ProcessId>>,
    pid: &ProcessId,
    reattached: bool,
    visited: &mut HashSet<ProcessId>,
) -> Option<ProcessTree> {
    let node = arena.node(pid)?;
    if !visited.insert(pid.clone()) {
        return None;
    }

    let mut children: Vec<ProcessTree> = node
        .children
        .iter()
        .filter_map(|&c| build_tree(arena, orphans, &arena.nodes[c].pid, false, visited))
        .collect();
    if let Some(adopted) = orphans.get(pid) {
        children.extend(
            adopted
                .iter()
                .filter_map(|child| build_tree(arena, orphans, child, true, visited)),
        );
    }

    Some(ProcessTree {
        process_id: node.pid.clone(),
        role: node.role,
        state: node.state,
        reattached,
        exit_status: node.exit_status,
        children,
    })
}
