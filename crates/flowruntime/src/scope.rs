//! Execution scopes.
//!
//! The root graph runs in the root scope. Every loop round and every
//! iteration element runs its container's body graph in a new scope frame that
//! points at its parent by id. Frames live in an arena owned by the
//! coordinator, so nesting depth never turns into call-stack depth.
//!
//! A frame leaves the arena as soon as it finishes, fails or is abandoned, and
//! its slot is reused. Ids carry the slot's generation, so a worker report for
//! a closed scope never reaches the frame that took over the slot.

use crate::graph::Graph;
use crate::readiness::EdgeStateTracker;
use crate::tracker::ExecutionTracker;
use flowcore::condition::ConditionGroup;
use flowcore::{NodeConfig, NodeExecution, NodeId, Value, VariablePool};
use std::collections::HashSet;
use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;
use std::time::Instant;

/// Arena slot plus the generation it was handed out in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId {
    slot: usize,
    generation: u32,
}

pub const ROOT_SCOPE: ScopeId = ScopeId {
    slot: 0,
    generation: 0,
};

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Index into the coordinator's container arena
pub(crate) type ContainerId = usize;

#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameKind {
    Root,
    LoopRound { container: ContainerId, round: usize },
    IterationItem { container: ContainerId, index: usize },
}

pub(crate) struct ScopeFrame {
    pub parent: Option<ScopeId>,
    pub kind: FrameKind,
    pub graph: Arc<Graph>,
    pub edges: EdgeStateTracker,
    pub pool: VariablePool,
    pub tracker: Arc<ExecutionTracker>,
    /// Nodes queued, running, finished or skipped in this scope
    pub scheduled: HashSet<NodeId>,
    pub executed: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
}

impl ScopeFrame {
    pub fn new(parent: Option<ScopeId>, kind: FrameKind, graph: Arc<Graph>, pool: VariablePool) -> Self {
        Self {
            parent,
            kind,
            edges: EdgeStateTracker::new(&graph),
            graph,
            pool,
            tracker: Arc::new(ExecutionTracker::new()),
            scheduled: HashSet::new(),
            executed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn container(&self) -> Option<ContainerId> {
        match self.kind {
            FrameKind::Root => None,
            FrameKind::LoopRound { container, .. } | FrameKind::IterationItem { container, .. } => {
                Some(container)
            }
        }
    }
}

struct Slot {
    generation: u32,
    frame: Option<ScopeFrame>,
}

/// Open scope frames, with the root frame in slot 0
pub(crate) struct FrameArena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl FrameArena {
    pub fn new(root: ScopeFrame) -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                frame: Some(root),
            }],
            free: Vec::new(),
        }
    }

    /// Open a frame, reusing a closed slot when there is one
    pub fn insert(&mut self, frame: ScopeFrame) -> ScopeId {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.generation = entry.generation.wrapping_add(1);
                entry.frame = Some(frame);
                ScopeId {
                    slot,
                    generation: entry.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    frame: Some(frame),
                });
                ScopeId {
                    slot: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: ScopeId) -> Option<&ScopeFrame> {
        self.slots
            .get(id.slot)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.frame.as_ref())
    }

    pub fn get_mut(&mut self, id: ScopeId) -> Option<&mut ScopeFrame> {
        self.slots
            .get_mut(id.slot)
            .filter(|entry| entry.generation == id.generation)
            .and_then(|entry| entry.frame.as_mut())
    }

    pub fn contains(&self, id: ScopeId) -> bool {
        self.get(id).is_some()
    }

    /// Close a child frame and free its slot. The root frame stays.
    pub fn remove(&mut self, id: ScopeId) -> Option<ScopeFrame> {
        if id == ROOT_SCOPE {
            return None;
        }
        let entry = self
            .slots
            .get_mut(id.slot)
            .filter(|entry| entry.generation == id.generation)?;
        let frame = entry.frame.take()?;
        self.free.push(id.slot);
        Some(frame)
    }

    /// Ids of the open child frames
    pub fn children(&self) -> Vec<ScopeId> {
        self.open()
            .filter(|(id, _)| *id != ROOT_SCOPE)
            .map(|(id, _)| id)
            .collect()
    }

    /// Open frames whose parent is `parent`
    pub fn children_of(&self, parent: ScopeId) -> Vec<ScopeId> {
        self.open()
            .filter(|(_, frame)| frame.parent == Some(parent))
            .map(|(id, _)| id)
            .collect()
    }

    /// Open frames, root included
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Slots ever allocated, open or free
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn open(&self) -> impl Iterator<Item = (ScopeId, &ScopeFrame)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry.frame.as_ref().map(|frame| {
                (
                    ScopeId {
                        slot,
                        generation: entry.generation,
                    },
                    frame,
                )
            })
        })
    }
}

impl Index<ScopeId> for FrameArena {
    type Output = ScopeFrame;

    fn index(&self, id: ScopeId) -> &ScopeFrame {
        match self.get(id) {
            Some(frame) => frame,
            None => panic!("scope {} is closed", id),
        }
    }
}

impl IndexMut<ScopeId> for FrameArena {
    fn index_mut(&mut self, id: ScopeId) -> &mut ScopeFrame {
        match self.get_mut(id) {
            Some(frame) => frame,
            None => panic!("scope {} is closed", id),
        }
    }
}

/// Bookkeeping of one running loop node
pub(crate) struct LoopRun {
    pub parent: ScopeId,
    pub node_id: NodeId,
    pub config: Arc<NodeConfig>,
    pub record: NodeExecution,
    pub body: Arc<Graph>,
    pub max_iterations: usize,
    pub condition: Option<ConditionGroup>,
    pub variable_names: Vec<String>,
    /// Layer holding the loop variables, owned by the loop node
    pub loop_pool: VariablePool,
    /// Pool of the last finished round, for conditions reading body outputs
    pub last_round_pool: Option<VariablePool>,
    pub rounds_started: usize,
    pub started: Instant,
}

/// Bookkeeping of one running iteration node
pub(crate) struct IterationRun {
    pub parent: ScopeId,
    pub node_id: NodeId,
    pub config: Arc<NodeConfig>,
    pub record: NodeExecution,
    pub body: Arc<Graph>,
    pub output_selector: Vec<String>,
    pub concurrency: usize,
    pub items: Vec<Value>,
    pub next_index: usize,
    pub running: HashSet<ScopeId>,
    pub outputs: Vec<Option<Value>>,
    pub started: Instant,
}

pub(crate) enum ContainerRun {
    Loop(LoopRun),
    Iteration(IterationRun),
}

impl ContainerRun {
    pub fn node_id(&self) -> &str {
        match self {
            ContainerRun::Loop(run) => &run.node_id,
            ContainerRun::Iteration(run) => &run.node_id,
        }
    }

    pub fn parent(&self) -> ScopeId {
        match self {
            ContainerRun::Loop(run) => run.parent,
            ContainerRun::Iteration(run) => run.parent,
        }
    }

    pub fn config(&self) -> &Arc<NodeConfig> {
        match self {
            ContainerRun::Loop(run) => &run.config,
            ContainerRun::Iteration(run) => &run.config,
        }
    }

    pub fn record(&self) -> &NodeExecution {
        match self {
            ContainerRun::Loop(run) => &run.record,
            ContainerRun::Iteration(run) => &run.record,
        }
    }

    pub fn started(&self) -> Instant {
        match self {
            ContainerRun::Loop(run) => run.started,
            ContainerRun::Iteration(run) => run.started,
        }
    }
}
