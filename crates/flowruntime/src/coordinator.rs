//! Scheduling loop of one run.
//!
//! The coordinator is the only writer of edge states, the ready queue and
//! node outputs. Workers report back over a channel and the coordinator
//! applies each report in arrival order. Loop rounds and iteration elements
//! are scope frames in an arena, driven by the same loop as the root graph.
//! Root-scope progress is also reported to the response coordinator, which
//! turns it into stream chunks in answer order.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::GraphExecution;
use crate::graph::{Edge, Graph, GraphNode, IterationSpec, LoopSpec, NodeKind};
use crate::layers::{LayerContext, LayerStack};
use crate::readiness::{EdgeState, EdgeStateTracker, ReadinessChecker};
use crate::response::ResponseCoordinator;
use crate::scope::{
    ContainerId, ContainerRun, FrameArena, FrameKind, IterationRun, LoopRun, ScopeFrame, ScopeId,
    ROOT_SCOPE,
};
use crate::state::{GraphExecutionState, PendingNode, RuntimeState, SnapshotError};
use crate::worker::{
    finalize, Backpressure, CompletionStatus, NodeCompletion, NodeInvocation, WorkerMessage,
    WorkerPool, WorkerStats,
};
use chrono::Utc;
use flowcore::{
    Command, CommandChannel, ErrorStrategy, ExecutionType, GraphEvent, NodeError, NodeExecution,
    NodeExecutionStatus, NodeId, NodeOutcome, NodeRunResult, RunId, Value, FAIL_BRANCH_HANDLE,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Ready node waiting for submission
#[derive(Debug, Clone)]
struct Pending {
    scope: ScopeId,
    node_id: NodeId,
    predecessor: Option<NodeId>,
}

/// How the scheduling loop ended, failures aside
enum RunEnd {
    Succeeded,
    Stopped(Option<String>),
    Paused {
        reason: Option<String>,
        snapshot: String,
    },
}

pub(crate) struct Coordinator {
    run_id: RunId,
    config: EngineConfig,
    state: Arc<RuntimeState>,
    execution: GraphExecution,
    layers: LayerStack,
    events: mpsc::Sender<GraphEvent>,
    outbox: Vec<GraphEvent>,
    commands: CommandChannel,
    pool: WorkerPool,
    messages: mpsc::UnboundedReceiver<WorkerMessage>,
    cancellation: CancellationToken,
    frames: FrameArena,
    /// Taken out when the container completes
    containers: Vec<Option<ContainerRun>>,
    pending: VecDeque<Pending>,
    responses: ResponseCoordinator,
    /// Set once a pause command arrived, holding its reason
    pause_requested: Option<Option<String>>,
    started: Instant,
    last_poll: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        run_id: RunId,
        graph: Arc<Graph>,
        state: Arc<RuntimeState>,
        config: EngineConfig,
        commands: CommandChannel,
        layers: LayerStack,
        events: mpsc::Sender<GraphEvent>,
    ) -> Self {
        let (message_tx, messages) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(&config.worker_pool(), message_tx);
        let responses = ResponseCoordinator::new(run_id, graph.clone());
        let root = ScopeFrame::new(None, FrameKind::Root, graph, state.variable_pool().clone());

        Self {
            run_id,
            config,
            state,
            execution: GraphExecution::new(run_id),
            layers,
            events,
            outbox: Vec::new(),
            commands,
            pool,
            messages,
            cancellation: CancellationToken::new(),
            frames: FrameArena::new(root),
            containers: Vec::new(),
            pending: VecDeque::new(),
            responses,
            pause_requested: None,
            started: Instant::now(),
            last_poll: None,
        }
    }

    pub fn worker_stats(&self) -> Arc<WorkerStats> {
        self.pool.stats()
    }

    /// Drive the run to a terminal or paused state. `resume` is the root
    /// scope's scheduling state taken from a restored snapshot.
    pub async fn run(mut self, resume: Option<GraphExecutionState>) -> GraphExecution {
        if let Err(e) = self.execution.start() {
            tracing::warn!(error = %e, "Run already started");
        }
        let resumed = resume.is_some();
        self.layers.on_graph_start(&LayerContext {
            run_id: self.run_id,
            root_node_id: self.frames[ROOT_SCOPE].graph.root_id(),
            state: self.state.as_ref(),
            resumed,
        });
        self.emit(GraphEvent::WorkflowRunStarted {
            run_id: self.run_id,
            timestamp: Utc::now(),
        });

        let outcome = match self.seed(resume) {
            Ok(()) => self.drive().await,
            Err(e) => Err(e),
        };

        // In-flight nodes are told to stop; their reports are never read.
        self.cancellation.cancel();
        self.pool.stop();
        self.execution.scope_slots = self.frames.capacity();
        self.finish(outcome);
        self.flush_events().await;
        self.execution
    }

    fn seed(&mut self, resume: Option<GraphExecutionState>) -> Result<(), EngineError> {
        let root = &mut self.frames[ROOT_SCOPE];
        match resume {
            None => {
                let root_id = root.graph.root_id().to_string();
                root.scheduled.insert(root_id.clone());
                self.pending.push_back(Pending {
                    scope: ROOT_SCOPE,
                    node_id: root_id,
                    predecessor: None,
                });
            }
            Some(saved) => {
                root.edges = EdgeStateTracker::from_states(&root.graph, saved.edge_states)
                    .ok_or_else(|| {
                        SnapshotError::GraphMismatch("edge count differs from the graph".to_string())
                    })?;
                root.scheduled.extend(saved.executed_nodes.iter().cloned());
                root.scheduled.extend(saved.skipped_nodes.iter().cloned());
                root.executed = saved.executed_nodes;
                root.skipped = saved.skipped_nodes;
                if let Some(stream) = saved.response_stream {
                    self.responses.restore(stream);
                }
                for entry in saved.ready_queue {
                    root.scheduled.insert(entry.node_id.clone());
                    self.pending.push_back(Pending {
                        scope: ROOT_SCOPE,
                        node_id: entry.node_id,
                        predecessor: entry.predecessor_node_id,
                    });
                }
                tracing::info!(
                    run_id = %self.run_id,
                    ready = self.pending.len(),
                    "Resuming run from snapshot"
                );
                return Ok(());
            }
        }
        let events = self.responses.start(&self.frames[ROOT_SCOPE].pool);
        self.emit_all(events);
        Ok(())
    }

    async fn drive(&mut self) -> Result<RunEnd, EngineError> {
        loop {
            self.flush_events().await;

            if let Some(end) = self.poll_commands().await {
                return Ok(end);
            }
            self.check_time_limit()?;

            let mut progressed = self.dispatch_pending().await?;
            progressed |= self.drain_messages()?;
            progressed |= self.settle_frames()?;

            if let Some(end) = self.check_root_finished()? {
                return Ok(end);
            }
            self.state.set_ready_queue_size(self.pending.len());

            if !progressed {
                self.flush_events().await;
                self.wait().await?;
            }
        }
    }

    async fn poll_commands(&mut self) -> Option<RunEnd> {
        let interval = self.config.command_poll_interval();
        if self.last_poll.is_some_and(|at| at.elapsed() < interval) {
            return None;
        }
        self.last_poll = Some(Instant::now());

        for command in self.commands.poll().await {
            match command {
                Command::Abort { reason } => {
                    tracing::info!(run_id = %self.run_id, reason = ?reason, "Abort requested");
                    return Some(RunEnd::Stopped(reason));
                }
                Command::Pause { reason } => {
                    if self.pause_requested.is_none() {
                        tracing::info!(run_id = %self.run_id, reason = ?reason, "Pause requested");
                        self.pause_requested = Some(reason);
                    }
                }
            }
        }
        None
    }

    fn check_time_limit(&self) -> Result<(), EngineError> {
        if self.started.elapsed() > self.config.max_execution_time() {
            return Err(EngineError::RunTimeout {
                seconds: self.config.max_execution_time_secs,
            });
        }
        Ok(())
    }

    /// Block until a worker reports or the poll interval elapses
    async fn wait(&mut self) -> Result<(), EngineError> {
        let interval = self.config.command_poll_interval();
        let next = tokio::select! {
            message = self.messages.recv() => message,
            _ = tokio::time::sleep(interval) => return Ok(()),
        };
        match next {
            Some(message) => self.handle_message(message),
            None => {
                tokio::time::sleep(interval).await;
                Ok(())
            }
        }
    }

    fn drain_messages(&mut self) -> Result<bool, EngineError> {
        let mut handled = false;
        while let Ok(message) = self.messages.try_recv() {
            self.handle_message(message)?;
            handled = true;
        }
        Ok(handled)
    }

    fn handle_message(&mut self, message: WorkerMessage) -> Result<(), EngineError> {
        let scope = message.scope();
        if !self.frames.contains(scope) {
            tracing::debug!(scope = %scope, "Discarding report from a closed scope");
            return Ok(());
        }
        match message {
            WorkerMessage::Started { execution, .. } => {
                self.emit(GraphEvent::NodeRunStarted {
                    run_id: self.run_id,
                    execution,
                });
            }
            WorkerMessage::Retry {
                execution,
                retry_index,
                ..
            } => {
                self.emit(GraphEvent::NodeRunRetry {
                    run_id: self.run_id,
                    execution,
                    retry_index,
                });
            }
            WorkerMessage::Chunk { scope, chunk } => {
                if scope != ROOT_SCOPE {
                    tracing::trace!(
                        scope = %scope,
                        selector = %chunk.selector.join("."),
                        "Chunk outside the root scope ignored"
                    );
                    return Ok(());
                }
                let events = self.responses.on_chunk(chunk, &self.frames[ROOT_SCOPE].pool);
                self.emit_all(events);
            }
            WorkerMessage::Completed(completion) => self.process_completion(completion)?,
        }
        Ok(())
    }

    async fn dispatch_pending(&mut self) -> Result<bool, EngineError> {
        let mut progressed = false;
        let mut deferred = VecDeque::new();

        while let Some(entry) = self.pending.pop_front() {
            if !self.frames.contains(entry.scope) {
                progressed = true;
                continue;
            }
            if entry.scope == ROOT_SCOPE && self.pause_requested.is_some() {
                deferred.push_back(entry);
                continue;
            }

            let graph = self.frames[entry.scope].graph.clone();
            let Some(node) = graph.node(&entry.node_id) else {
                tracing::warn!(node_id = %entry.node_id, "Ready node missing from its graph");
                continue;
            };

            let is_executable = matches!(node.kind, NodeKind::Executable(_));
            if is_executable
                && self.config.backpressure == Backpressure::Reject
                && !self.pool.has_capacity()
            {
                self.pending.push_front(entry);
                break;
            }

            if self.state.node_run_steps() >= self.config.max_execution_steps {
                return Err(EngineError::ExecutionLimit {
                    max_steps: self.config.max_execution_steps,
                });
            }
            let index = self.state.increment_node_run_steps();
            let record = self.new_record(entry.scope, node, index, entry.predecessor.clone());
            progressed = true;

            match &node.kind {
                NodeKind::Executable(executable) => {
                    let frame = &self.frames[entry.scope];
                    frame.tracker.add(&entry.node_id);
                    let invocation = NodeInvocation {
                        scope: entry.scope,
                        run_id: self.run_id,
                        node: executable.clone(),
                        config: node.config.clone(),
                        variable_pool: frame.pool.clone(),
                        tracker: frame.tracker.clone(),
                        cancellation: self.cancellation.child_token(),
                        execution: record,
                    };
                    self.pool.submit(invocation).await?;
                }
                NodeKind::Loop(spec) => self.start_loop(entry.scope, node, spec, record)?,
                NodeKind::Iteration(spec) => self.start_iteration(entry.scope, node, spec, record)?,
            }
        }

        deferred.extend(self.pending.drain(..));
        self.pending = deferred;
        Ok(progressed)
    }

    fn new_record(
        &self,
        scope: ScopeId,
        node: &GraphNode,
        index: u64,
        predecessor_node_id: Option<NodeId>,
    ) -> NodeExecution {
        let container_id = |container: ContainerId| {
            self.containers
                .get(container)
                .and_then(Option::as_ref)
                .map(|run| run.node_id().to_string())
        };
        let (in_loop_id, in_iteration_id, scope_index) = match self.frames[scope].kind {
            FrameKind::Root => (None, None, None),
            FrameKind::LoopRound { container, round } => (container_id(container), None, Some(round)),
            FrameKind::IterationItem { container, index } => {
                (None, container_id(container), Some(index))
            }
        };
        NodeExecution {
            id: Uuid::new_v4(),
            node_id: node.id().to_string(),
            node_type: node.node_type(),
            title: node.config.title.clone(),
            index,
            predecessor_node_id,
            status: NodeExecutionStatus::Running,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            process_data: BTreeMap::new(),
            error: None,
            elapsed_ms: 0,
            started_at: Utc::now(),
            finished_at: None,
            in_loop_id,
            in_iteration_id,
            scope_index,
        }
    }

    fn process_completion(&mut self, completion: NodeCompletion) -> Result<(), EngineError> {
        let scope = completion.scope;
        if !self.frames.contains(scope) {
            return Ok(());
        }
        let NodeCompletion {
            status,
            execution,
            result,
            error,
            ..
        } = completion;
        let node_id = execution.node_id.clone();
        let graph = self.frames[scope].graph.clone();
        let execution_type = graph
            .node(&node_id)
            .map(GraphNode::execution_type)
            .unwrap_or(ExecutionType::Normal);

        self.frames[scope].executed.push(node_id.clone());
        self.state.add_tokens(result.metadata.total_tokens);

        match status {
            CompletionStatus::Succeeded => {
                self.frames[scope]
                    .pool
                    .add_node_outputs(&node_id, &result.outputs)?;
                if scope == ROOT_SCOPE && execution_type == ExecutionType::Response {
                    self.state.merge_response_outputs(&result.outputs);
                }
                self.emit(GraphEvent::NodeRunSucceeded {
                    run_id: self.run_id,
                    execution,
                });
                self.report_finished(scope, &node_id);

                if execution_type == ExecutionType::Branch {
                    let handle = result
                        .edge_source_handle
                        .ok_or_else(|| EngineError::MissingBranch(node_id.clone()))?;
                    tracing::debug!(node_id = %node_id, handle = %handle, "Branch selected");
                    self.route(scope, &graph, &node_id, |edge| edge.source_handle == handle);
                } else {
                    self.route(scope, &graph, &node_id, |edge| {
                        edge.source_handle != FAIL_BRANCH_HANDLE
                    });
                }
            }
            CompletionStatus::Exception(strategy) => {
                self.state.record_exception();
                self.execution.record_exception();
                self.frames[scope]
                    .pool
                    .add_node_outputs(&node_id, &result.outputs)?;
                self.emit(GraphEvent::NodeRunException {
                    run_id: self.run_id,
                    execution,
                });
                self.report_finished(scope, &node_id);

                let has_fail_branch = graph
                    .outgoing_edges(&node_id)
                    .any(|edge| edge.source_handle == FAIL_BRANCH_HANDLE);
                let take_fail_branch = strategy == ErrorStrategy::ContinueOnError && has_fail_branch;
                self.route(scope, &graph, &node_id, |edge| {
                    (edge.source_handle == FAIL_BRANCH_HANDLE) == take_fail_branch
                });
            }
            CompletionStatus::Failed => {
                self.emit(GraphEvent::NodeRunFailed {
                    run_id: self.run_id,
                    execution,
                });
                let message = error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "node failed".to_string());
                if scope == ROOT_SCOPE {
                    return Err(EngineError::RunFailed {
                        error: message,
                        node_id: Some(node_id),
                    });
                }
                self.fail_frame(scope, &node_id, &message)?;
            }
        }
        Ok(())
    }

    /// Resolve every outgoing edge of `node_id`, queue the targets that became
    /// ready and propagate skips
    fn route(&mut self, scope: ScopeId, graph: &Graph, node_id: &str, take: impl Fn(&Edge) -> bool) {
        let frame = &mut self.frames[scope];
        let mut taken = Vec::new();
        for edge in graph.outgoing_edges(node_id) {
            if take(edge) {
                frame.edges.mark_taken(edge.index);
                taken.push(edge.index);
            } else {
                frame.edges.mark_skipped(edge.index);
            }
        }

        let ready = ReadinessChecker::new(graph, &frame.edges).get_ready_downstream_nodes(node_id);
        for target in ready {
            if frame.scheduled.insert(target.clone()) {
                self.pending.push_back(Pending {
                    scope,
                    node_id: target,
                    predecessor: Some(node_id.to_string()),
                });
            }
        }

        self.cascade_skips(scope, graph, node_id);

        if scope == ROOT_SCOPE {
            for edge in taken {
                let events = self.responses.on_edge_taken(edge, &self.frames[ROOT_SCOPE].pool);
                self.emit_all(events);
            }
        }
    }

    fn report_finished(&mut self, scope: ScopeId, node_id: &str) {
        if scope == ROOT_SCOPE {
            let events = self.responses.on_node_finished(node_id, &self.frames[ROOT_SCOPE].pool);
            self.emit_all(events);
        }
    }

    /// Skip every node whose incoming edges are all skipped, transitively.
    /// A node whose last unresolved edge gets skipped while another one is
    /// taken becomes ready here.
    fn cascade_skips(&mut self, scope: ScopeId, graph: &Graph, from: &str) {
        let frame = &mut self.frames[scope];
        let mut skipped = Vec::new();
        let mut worklist: Vec<NodeId> = graph
            .outgoing_edges(from)
            .filter(|edge| frame.edges.state(edge.index) == EdgeState::Skipped)
            .map(|edge| edge.target.clone())
            .collect();

        while let Some(target) = worklist.pop() {
            if frame.scheduled.contains(&target) {
                continue;
            }
            let analysis = frame.edges.analyze(graph, &target);
            if analysis.all_skipped {
                tracing::debug!(node_id = %target, "Node skipped");
                frame.scheduled.insert(target.clone());
                frame.skipped.push(target.clone());
                for edge in graph.outgoing_edges(&target) {
                    frame.edges.mark_skipped(edge.index);
                    worklist.push(edge.target.clone());
                }
                skipped.push(target);
            } else if ReadinessChecker::new(graph, &frame.edges).is_node_ready(&target) {
                frame.scheduled.insert(target.clone());
                self.pending.push_back(Pending {
                    scope,
                    node_id: target,
                    predecessor: Some(from.to_string()),
                });
            }
        }

        if scope == ROOT_SCOPE {
            for node_id in skipped {
                let events = self.responses.on_node_skipped(&node_id, &self.frames[ROOT_SCOPE].pool);
                self.emit_all(events);
            }
        }
    }

    fn start_loop(
        &mut self,
        scope: ScopeId,
        node: &GraphNode,
        spec: &LoopSpec,
        record: NodeExecution,
    ) -> Result<(), EngineError> {
        let node_id = node.id().to_string();
        self.frames[scope].tracker.add(&node_id);
        self.emit(GraphEvent::NodeRunStarted {
            run_id: self.run_id,
            execution: record.clone(),
        });
        self.emit(GraphEvent::LoopStarted {
            run_id: self.run_id,
            node_id: node_id.clone(),
            timestamp: Utc::now(),
        });

        let parent_pool = self.frames[scope].pool.clone();
        let loop_pool = parent_pool.child_scope(Some(&node_id));
        for variable in &spec.variables {
            let value = match &variable.value_selector {
                Some(selector) => parent_pool.get(selector).unwrap_or(Value::Null),
                None => Value::from_json(variable.value.clone()),
            };
            loop_pool.add(&[node_id.as_str(), variable.name.as_str()], value)?;
        }
        loop_pool.add(&[node_id.as_str(), "index"], Value::from(0i64))?;

        let container = self.containers.len();
        self.containers.push(Some(ContainerRun::Loop(LoopRun {
            parent: scope,
            node_id,
            config: node.config.clone(),
            record,
            body: spec.body.clone(),
            max_iterations: spec.max_iterations,
            condition: spec.condition.clone(),
            variable_names: spec.variables.iter().map(|v| v.name.clone()).collect(),
            loop_pool,
            last_round_pool: None,
            rounds_started: 0,
            started: Instant::now(),
        })));
        self.advance_loop(container)
    }

    /// Start the next round or complete the loop
    fn advance_loop(&mut self, container: ContainerId) -> Result<(), EngineError> {
        let Some(Some(ContainerRun::Loop(run))) = self.containers.get_mut(container) else {
            return Ok(());
        };
        let round = run.rounds_started;
        let keep_going = match &run.condition {
            Some(condition) => {
                let pool = run.last_round_pool.as_ref().unwrap_or(&run.loop_pool);
                condition.evaluate(pool)
            }
            None => round < run.max_iterations,
        };

        if !keep_going {
            let outputs: BTreeMap<String, Value> = run
                .variable_names
                .iter()
                .filter_map(|name| {
                    run.loop_pool
                        .get(&[run.node_id.as_str(), name.as_str()])
                        .map(|value| (name.clone(), value))
                })
                .collect();
            tracing::debug!(node_id = %run.node_id, rounds = round, "Loop finished");
            return self.complete_container(container, Ok(outputs));
        }

        if round >= run.max_iterations {
            let node_id = run.node_id.clone();
            let max_iterations = run.max_iterations;
            let mut record = run.record.clone();
            let error = EngineError::MaxIterationExceeded {
                node_id: node_id.clone(),
                max_iterations,
            };
            record.status = NodeExecutionStatus::Failed;
            record.error = Some(error.to_string());
            record.elapsed_ms = run.started.elapsed().as_millis() as u64;
            record.finished_at = Some(Utc::now());
            self.emit(GraphEvent::LoopFailed {
                run_id: self.run_id,
                node_id,
                steps: round,
                error: error.to_string(),
                timestamp: Utc::now(),
            });
            self.emit(GraphEvent::NodeRunFailed {
                run_id: self.run_id,
                execution: record,
            });
            return Err(error);
        }

        if round > 0 {
            run.loop_pool
                .assign(&[run.node_id.as_str(), "index"], Value::from(round as i64))?;
        }
        run.rounds_started += 1;
        let node_id = run.node_id.clone();
        let body = run.body.clone();
        let round_pool = run.loop_pool.child_scope(None);
        let parent = run.parent;

        self.emit(GraphEvent::LoopNext {
            run_id: self.run_id,
            node_id,
            index: round,
            timestamp: Utc::now(),
        });
        self.push_frame(
            parent,
            FrameKind::LoopRound { container, round },
            body,
            round_pool,
        );
        Ok(())
    }

    fn start_iteration(
        &mut self,
        scope: ScopeId,
        node: &GraphNode,
        spec: &IterationSpec,
        record: NodeExecution,
    ) -> Result<(), EngineError> {
        let node_id = node.id().to_string();
        self.frames[scope].tracker.add(&node_id);
        self.emit(GraphEvent::NodeRunStarted {
            run_id: self.run_id,
            execution: record.clone(),
        });

        let items = self.frames[scope].pool.get(&spec.iterator_selector);
        let container = self.containers.len();
        self.containers.push(Some(ContainerRun::Iteration(IterationRun {
            parent: scope,
            node_id: node_id.clone(),
            config: node.config.clone(),
            record,
            body: spec.body.clone(),
            output_selector: spec.output_selector.clone(),
            concurrency: spec.concurrency.max(1),
            items: Vec::new(),
            next_index: 0,
            running: Default::default(),
            outputs: Vec::new(),
            started: Instant::now(),
        })));

        let items = match items {
            Some(Value::Array(items)) => items,
            other => {
                let found = other.as_ref().map_or("nothing", Value::type_name);
                return self.complete_container(
                    container,
                    Err(format!(
                        "iterator {} must be an array, found {}",
                        spec.iterator_selector.join("."),
                        found
                    )),
                );
            }
        };

        self.emit(GraphEvent::IterationStarted {
            run_id: self.run_id,
            node_id,
            total: items.len(),
            timestamp: Utc::now(),
        });
        if let Some(Some(ContainerRun::Iteration(run))) = self.containers.get_mut(container) {
            run.outputs = vec![None; items.len()];
            run.items = items;
        }
        self.advance_iteration(container)
    }

    /// Start elements up to the concurrency bound, or complete the iteration
    /// once every element finished
    fn advance_iteration(&mut self, container: ContainerId) -> Result<(), EngineError> {
        loop {
            let Some(Some(ContainerRun::Iteration(run))) = self.containers.get_mut(container) else {
                return Ok(());
            };
            if run.next_index >= run.items.len() {
                if run.running.is_empty() {
                    let outputs = run
                        .outputs
                        .drain(..)
                        .map(|output| output.unwrap_or(Value::Null))
                        .collect::<Vec<_>>();
                    let outputs = BTreeMap::from([("output".to_string(), Value::Array(outputs))]);
                    return self.complete_container(container, Ok(outputs));
                }
                return Ok(());
            }
            if run.running.len() >= run.concurrency {
                return Ok(());
            }

            let index = run.next_index;
            run.next_index += 1;
            let item = run.items[index].clone();
            let node_id = run.node_id.clone();
            let body = run.body.clone();
            let parent = run.parent;

            let item_pool = self.frames[parent].pool.child_scope(None);
            item_pool.add(&[node_id.as_str(), "item"], item)?;
            item_pool.add(&[node_id.as_str(), "index"], Value::from(index as i64))?;

            self.emit(GraphEvent::IterationNext {
                run_id: self.run_id,
                node_id,
                index,
                timestamp: Utc::now(),
            });
            let frame = self.push_frame(
                parent,
                FrameKind::IterationItem { container, index },
                body,
                item_pool,
            );
            if let Some(Some(ContainerRun::Iteration(run))) = self.containers.get_mut(container) {
                run.running.insert(frame);
            }
        }
    }

    fn push_frame(
        &mut self,
        parent: ScopeId,
        kind: FrameKind,
        graph: Arc<Graph>,
        pool: flowcore::VariablePool,
    ) -> ScopeId {
        let mut frame = ScopeFrame::new(Some(parent), kind, graph, pool);
        let root_id = frame.graph.root_id().to_string();
        frame.scheduled.insert(root_id.clone());
        let scope = self.frames.insert(frame);
        self.pending.push_back(Pending {
            scope,
            node_id: root_id,
            predecessor: None,
        });
        scope
    }

    /// Close child frames that have nothing running and nothing queued
    fn settle_frames(&mut self) -> Result<bool, EngineError> {
        let mut progressed = false;
        loop {
            let idle: Vec<ScopeId> = self
                .frames
                .children()
                .into_iter()
                .filter(|&scope| self.is_idle(scope))
                .collect();
            if idle.is_empty() {
                return Ok(progressed);
            }
            // A report sent before the tracker emptied may still be queued.
            if self.drain_messages()? {
                progressed = true;
                continue;
            }
            for scope in idle {
                if self.is_idle(scope) {
                    self.finish_frame(scope)?;
                }
            }
            progressed = true;
        }
    }

    fn is_idle(&self, scope: ScopeId) -> bool {
        self.frames
            .get(scope)
            .is_some_and(|frame| frame.tracker.is_empty())
            && !self.pending.iter().any(|entry| entry.scope == scope)
    }

    fn finish_frame(&mut self, scope: ScopeId) -> Result<(), EngineError> {
        let Some(frame) = self.frames.remove(scope) else {
            return Ok(());
        };
        let pool = frame.pool;
        match frame.kind {
            FrameKind::Root => Ok(()),
            FrameKind::LoopRound { container, .. } => {
                if let Some(Some(ContainerRun::Loop(run))) = self.containers.get_mut(container) {
                    run.last_round_pool = Some(pool);
                }
                self.advance_loop(container)
            }
            FrameKind::IterationItem { container, index } => {
                if let Some(Some(ContainerRun::Iteration(run))) = self.containers.get_mut(container) {
                    run.running.remove(&scope);
                    let output = pool.get(&run.output_selector).unwrap_or(Value::Null);
                    if let Some(slot) = run.outputs.get_mut(index) {
                        *slot = Some(output);
                    }
                }
                self.advance_iteration(container)
            }
        }
    }

    /// A node inside a container failed under fail-fast: the container fails
    /// and its own error strategy decides what happens next
    fn fail_frame(&mut self, scope: ScopeId, node_id: &str, error: &str) -> Result<(), EngineError> {
        let Some(container) = self.frames.get(scope).and_then(ScopeFrame::container) else {
            return Ok(());
        };
        self.close_scope(scope);
        // Siblings still running are abandoned; their late results are dropped.
        let siblings: Vec<ScopeId> = match self.containers.get(container) {
            Some(Some(ContainerRun::Iteration(run))) => run.running.iter().copied().collect(),
            _ => Vec::new(),
        };
        for sibling in siblings {
            self.close_scope(sibling);
        }
        self.complete_container(container, Err(format!("node {} failed: {}", node_id, error)))
    }

    /// Remove a frame together with every frame and container nested in it
    fn close_scope(&mut self, scope: ScopeId) {
        let mut stack = vec![scope];
        while let Some(scope) = stack.pop() {
            if self.frames.remove(scope).is_none() {
                continue;
            }
            stack.extend(self.frames.children_of(scope));
            for slot in self.containers.iter_mut() {
                if slot.as_ref().is_some_and(|run| run.parent() == scope) {
                    *slot = None;
                }
            }
        }
        let frames = &self.frames;
        self.pending.retain(|entry| frames.contains(entry.scope));
        self.trim_containers();
        tracing::debug!(scope = %scope, open = self.frames.len(), "Scope closed");
    }

    /// Drop freed container slots from the end of the arena
    fn trim_containers(&mut self) {
        while matches!(self.containers.last(), Some(None)) {
            self.containers.pop();
        }
    }

    /// Turn a finished container into an ordinary completion of its node in
    /// the parent scope
    fn complete_container(
        &mut self,
        container: ContainerId,
        result: Result<BTreeMap<String, Value>, String>,
    ) -> Result<(), EngineError> {
        let Some(run) = self.containers.get_mut(container).and_then(Option::take) else {
            return Ok(());
        };
        self.trim_containers();
        let parent = run.parent();
        let node_id = run.node_id().to_string();
        let config = run.config().clone();

        let mut record = run.record().clone();
        record.elapsed_ms = run.started().elapsed().as_millis() as u64;
        record.finished_at = Some(Utc::now());

        let timestamp = Utc::now();
        let event = match (&run, &result) {
            (ContainerRun::Loop(run), Ok(outputs)) => GraphEvent::LoopSucceeded {
                run_id: self.run_id,
                node_id: node_id.clone(),
                steps: run.rounds_started,
                outputs: outputs.clone(),
                timestamp,
            },
            (ContainerRun::Loop(run), Err(error)) => GraphEvent::LoopFailed {
                run_id: self.run_id,
                node_id: node_id.clone(),
                steps: run.rounds_started,
                error: error.clone(),
                timestamp,
            },
            (ContainerRun::Iteration(_), Ok(outputs)) => GraphEvent::IterationSucceeded {
                run_id: self.run_id,
                node_id: node_id.clone(),
                outputs: outputs.clone(),
                timestamp,
            },
            (ContainerRun::Iteration(_), Err(error)) => GraphEvent::IterationFailed {
                run_id: self.run_id,
                node_id: node_id.clone(),
                error: error.clone(),
                timestamp,
            },
        };
        self.emit(event);

        let outcome = NodeOutcome::from_run(
            result
                .map(|outputs| NodeRunResult::new().with_outputs(outputs))
                .map_err(NodeError::ExecutionFailed),
        );
        let completion = finalize(parent, &config, record, outcome);
        self.frames[parent].tracker.remove(&node_id);
        self.process_completion(completion)
    }

    fn check_root_finished(&mut self) -> Result<Option<RunEnd>, EngineError> {
        if !self.frames[ROOT_SCOPE].tracker.is_empty() {
            return Ok(None);
        }
        if self.drain_messages()? {
            return Ok(None);
        }
        let frames = &self.frames;
        self.pending.retain(|entry| frames.contains(entry.scope));
        if self.pending.is_empty() {
            return Ok(Some(RunEnd::Succeeded));
        }
        if let Some(reason) = self.pause_requested.clone() {
            if self.pending.iter().all(|entry| entry.scope == ROOT_SCOPE) {
                return Ok(Some(self.pause(reason)?));
            }
        }
        Ok(None)
    }

    /// Scheduling state of the root scope; the ready queue holds the root
    /// entries not yet submitted
    fn root_state(&self) -> GraphExecutionState {
        let root = &self.frames[ROOT_SCOPE];
        GraphExecutionState {
            edge_states: root.edges.states().to_vec(),
            executed_nodes: root.executed.clone(),
            skipped_nodes: root.skipped.clone(),
            ready_queue: self
                .pending
                .iter()
                .filter(|entry| entry.scope == ROOT_SCOPE)
                .map(|entry| PendingNode {
                    node_id: entry.node_id.clone(),
                    predecessor_node_id: entry.predecessor.clone(),
                })
                .collect(),
            response_stream: Some(self.responses.state().clone()),
        }
    }

    fn pause(&mut self, reason: Option<String>) -> Result<RunEnd, EngineError> {
        let saved = self.root_state();
        self.state.set_ready_queue_size(saved.ready_queue.len());
        self.state.set_execution_state(Some(saved));
        let snapshot = self.state.dumps()?;
        tracing::info!(run_id = %self.run_id, ready = self.pending.len(), "Run paused");
        Ok(RunEnd::Paused { reason, snapshot })
    }

    fn finish(&mut self, outcome: Result<RunEnd, EngineError>) {
        let run_id = self.run_id;
        if !matches!(outcome, Ok(RunEnd::Paused { .. })) {
            // Kept for inspection; resuming a finished run schedules nothing.
            self.state.set_execution_state(Some(self.root_state()));
        }
        match outcome {
            Ok(RunEnd::Succeeded) => {
                log_transition(self.execution.succeed());
                let outputs = self.state.outputs();
                self.emit(GraphEvent::WorkflowRunSucceeded {
                    run_id,
                    outputs,
                    exceptions_count: self.state.exceptions_count(),
                    timestamp: Utc::now(),
                });
                self.layers.on_graph_end(None, &self.state);
            }
            Ok(RunEnd::Stopped(reason)) => {
                log_transition(self.execution.stop(reason.clone()));
                self.emit(GraphEvent::WorkflowRunStopped {
                    run_id,
                    reason,
                    timestamp: Utc::now(),
                });
                self.layers.on_graph_end(None, &self.state);
            }
            Ok(RunEnd::Paused { reason, snapshot }) => {
                log_transition(self.execution.pause(reason.clone()));
                self.emit(GraphEvent::WorkflowRunPaused {
                    run_id,
                    reason,
                    snapshot,
                    timestamp: Utc::now(),
                });
                self.layers.on_graph_end(None, &self.state);
            }
            Err(error) => {
                let (message, node_id) = match error {
                    EngineError::RunFailed { error, node_id } => (error, node_id),
                    EngineError::MaxIterationExceeded { ref node_id, .. } => {
                        (error.to_string(), Some(node_id.clone()))
                    }
                    EngineError::MissingBranch(ref node_id) => {
                        (error.to_string(), Some(node_id.clone()))
                    }
                    other => (other.to_string(), None),
                };
                log_transition(self.execution.fail(message.clone(), node_id.clone()));
                self.emit(GraphEvent::WorkflowRunFailed {
                    run_id,
                    error: message.clone(),
                    node_id,
                    exceptions_count: self.state.exceptions_count(),
                    timestamp: Utc::now(),
                });
                self.layers.on_graph_end(Some(&message), &self.state);
            }
        }
    }

    /// Hand the event to the layers now and queue it for the run's stream
    fn emit(&mut self, event: GraphEvent) {
        self.layers.on_event(&event, &self.state);
        self.outbox.push(event);
    }

    fn emit_all(&mut self, events: Vec<GraphEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    async fn flush_events(&mut self) {
        for event in std::mem::take(&mut self.outbox) {
            if self.events.send(event).await.is_err() {
                tracing::trace!(run_id = %self.run_id, "Event stream closed");
            }
        }
    }
}

fn log_transition(result: Result<(), crate::execution::InvalidTransition>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Ignoring run status change");
    }
}
