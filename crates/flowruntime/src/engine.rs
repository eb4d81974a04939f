//! Entry point for running one graph.

use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::execution::GraphExecution;
use crate::graph::Graph;
use crate::layers::{Layer, LayerStack};
use crate::state::RuntimeState;
use crate::worker::WorkerStats;
use flowcore::{CommandChannel, GraphEvent, RunId};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One run of a graph against a runtime state.
///
/// ```ignore
/// let engine = GraphEngine::new(run_id, graph, state, EngineConfig::default(), commands)
///     .layer(LoggingLayer::new());
/// let mut run = engine.run();
/// while let Some(event) = run.next_event().await {
///     println!("{}", event.name());
/// }
/// ```
pub struct GraphEngine {
    run_id: RunId,
    graph: Arc<Graph>,
    state: Arc<RuntimeState>,
    config: EngineConfig,
    commands: CommandChannel,
    layers: LayerStack,
}

impl GraphEngine {
    pub fn new(
        run_id: RunId,
        graph: Arc<Graph>,
        state: Arc<RuntimeState>,
        config: EngineConfig,
        commands: CommandChannel,
    ) -> Self {
        Self {
            run_id,
            graph,
            state,
            config,
            commands,
            layers: LayerStack::default(),
        }
    }

    /// Attach a layer; layers see events in attachment order
    pub fn layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    /// Start the run on the current tokio runtime.
    ///
    /// A state restored from a paused snapshot carries the scheduling state of
    /// the root graph; the run then continues from its ready queue instead of
    /// starting at the root node.
    pub fn run(self) -> GraphRun {
        let (events_tx, events) = mpsc::channel(self.config.event_buffer_size.max(1));
        let resume = self.state.take_execution_state();
        let coordinator = Coordinator::new(
            self.run_id,
            self.graph,
            self.state.clone(),
            self.config,
            self.commands,
            self.layers,
            events_tx,
        );
        let workers = coordinator.worker_stats();
        let handle = tokio::spawn(coordinator.run(resume));

        GraphRun {
            run_id: self.run_id,
            state: self.state,
            workers,
            events,
            handle,
        }
    }
}

/// Handle to a started run: its ordered event stream and its final status
pub struct GraphRun {
    run_id: RunId,
    state: Arc<RuntimeState>,
    workers: Arc<WorkerStats>,
    events: mpsc::Receiver<GraphEvent>,
    handle: JoinHandle<GraphExecution>,
}

impl GraphRun {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    /// Worker pool counters of this run
    pub fn workers(&self) -> &Arc<WorkerStats> {
        &self.workers
    }

    pub async fn next_event(&mut self) -> Option<GraphEvent> {
        self.events.recv().await
    }

    /// Read events until the stream ends
    pub async fn collect_events(mut self) -> Vec<GraphEvent> {
        let mut collected = Vec::new();
        while let Some(event) = self.events.recv().await {
            collected.push(event);
        }
        collected
    }

    /// Wait for the coordinator and return the run's final status. Events
    /// not yet read are dropped.
    pub async fn wait(self) -> Option<GraphExecution> {
        drop(self.events);
        match self.handle.await {
            Ok(execution) => Some(execution),
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "Coordinator task failed");
                None
            }
        }
    }
}

impl Stream for GraphRun {
    type Item = GraphEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<GraphEvent>> {
        self.events.poll_recv(cx)
    }
}
