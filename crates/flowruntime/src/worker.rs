//! Bounded, elastic pool of tasks running node bodies.
//!
//! Workers never touch edge state or the variable pool's write side: they run
//! the node, apply retry and error strategy, and report back to the
//! coordinator over an unbounded channel.
//!
//! The pool starts `min_workers` tasks. Each submit checks the backlog (queued
//! nodes no idle worker is about to take) and spawns workers while it reaches
//! `scale_up_threshold`, up to `max_workers`. A worker idle for
//! `idle_timeout` exits unless the pool is already at `min_workers`.

use crate::scope::ScopeId;
use crate::tracker::ExecutionTracker;
use chrono::Utc;
use flowcore::{
    ChunkSink, ErrorStrategy, Node, NodeConfig, NodeContext, NodeError, NodeExecution,
    NodeExecutionStatus, NodeOutcome, NodeRunResult, RunId, StreamChunk, Value, VariablePool,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What `submit` does when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    /// Wait for room in the queue
    #[default]
    Block,
    /// Fail with [`WorkerPoolError::QueueFull`]
    Reject,
}

#[derive(Error, Debug)]
pub enum WorkerPoolError {
    #[error("Worker queue is full")]
    QueueFull,

    #[error("Worker pool is stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    /// Backlog that triggers spawning one more worker
    pub scale_up_threshold: usize,
    pub idle_timeout: Duration,
}

/// Live counters of a pool, readable while the run is going
#[derive(Debug, Default)]
pub struct WorkerStats {
    live: AtomicUsize,
    busy: AtomicUsize,
    peak: AtomicUsize,
}

impl WorkerStats {
    /// Worker tasks currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Workers currently running a node
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Most workers alive at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn idle(&self) -> usize {
        self.live().saturating_sub(self.busy())
    }

    /// Count a new worker if the pool is below `max`
    fn try_grow(&self, max: usize) -> bool {
        let grown = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            });
        match grown {
            Ok(previous) => {
                self.peak.fetch_max(previous + 1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    /// Uncount an idle worker unless the pool is at `min`
    fn try_shrink(&self, min: usize) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > min).then(|| live - 1)
            })
            .is_ok()
    }
}

/// One node run handed to the pool
pub struct NodeInvocation {
    pub scope: ScopeId,
    pub run_id: RunId,
    pub node: Arc<dyn Node>,
    pub config: Arc<NodeConfig>,
    pub variable_pool: VariablePool,
    /// Tracker of the scope the node belongs to; the coordinator adds the node
    /// before submitting and the worker removes it when it reports back
    pub tracker: Arc<ExecutionTracker>,
    pub cancellation: CancellationToken,
    /// Record with id, index and scope fields filled in by the coordinator
    pub execution: NodeExecution,
}

/// How a node run ended once retries and the error strategy were applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Succeeded,
    /// Failed, but the error strategy keeps the run going
    Exception(ErrorStrategy),
    /// Failed under fail-fast
    Failed,
}

#[derive(Debug)]
pub struct NodeCompletion {
    pub scope: ScopeId,
    pub status: CompletionStatus,
    /// Finalised record
    pub execution: NodeExecution,
    /// Outputs to store and the branch chosen, if any
    pub result: NodeRunResult,
    pub error: Option<NodeError>,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Started {
        scope: ScopeId,
        execution: NodeExecution,
    },
    Retry {
        scope: ScopeId,
        execution: NodeExecution,
        retry_index: u32,
    },
    /// Output piece streamed by a running node
    Chunk {
        scope: ScopeId,
        chunk: StreamChunk,
    },
    Completed(NodeCompletion),
}

impl WorkerMessage {
    pub fn scope(&self) -> ScopeId {
        match self {
            WorkerMessage::Started { scope, .. }
            | WorkerMessage::Retry { scope, .. }
            | WorkerMessage::Chunk { scope, .. } => *scope,
            WorkerMessage::Completed(completion) => completion.scope,
        }
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<NodeInvocation>,
    backpressure: Backpressure,
    queue_capacity: usize,
    scale_up_threshold: usize,
    max_workers: usize,
    shutdown: CancellationToken,
    shared: Arc<WorkerShared>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// State every worker task holds on to
struct WorkerShared {
    receiver: Mutex<mpsc::Receiver<NodeInvocation>>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    shutdown: CancellationToken,
    stats: Arc<WorkerStats>,
    min_workers: usize,
    idle_timeout: Duration,
    next_id: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `min_workers` worker tasks reporting on `messages`
    pub fn new(config: &WorkerPoolConfig, messages: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let max_workers = config.max_workers.max(1);
        let min_workers = config.min_workers.clamp(1, max_workers);

        let pool = Self {
            sender,
            backpressure: config.backpressure,
            queue_capacity: config.queue_capacity.max(1),
            scale_up_threshold: config.scale_up_threshold.max(1),
            max_workers,
            shutdown: shutdown.clone(),
            shared: Arc::new(WorkerShared {
                receiver: Mutex::new(receiver),
                messages,
                shutdown,
                stats: Arc::new(WorkerStats::default()),
                min_workers,
                idle_timeout: config.idle_timeout,
                next_id: AtomicUsize::new(0),
            }),
            handles: parking_lot::Mutex::new(Vec::new()),
        };
        for _ in 0..min_workers {
            pool.spawn_worker();
        }

        tracing::debug!(
            min_workers,
            max_workers,
            capacity = config.queue_capacity,
            "Worker pool started"
        );
        pool
    }

    /// Enqueue according to the configured backpressure policy
    pub async fn submit(&self, invocation: NodeInvocation) -> Result<(), WorkerPoolError> {
        match self.backpressure {
            Backpressure::Block => {
                if !self.has_capacity() {
                    self.scale_up();
                }
                self.sender
                    .send(invocation)
                    .await
                    .map_err(|_| WorkerPoolError::Stopped)?;
                self.scale_up();
                Ok(())
            }
            Backpressure::Reject => self.try_submit(invocation),
        }
    }

    /// Enqueue without waiting
    pub fn try_submit(&self, invocation: NodeInvocation) -> Result<(), WorkerPoolError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerPoolError::Stopped);
        }
        self.sender.try_send(invocation).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WorkerPoolError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => WorkerPoolError::Stopped,
        })?;
        self.scale_up();
        Ok(())
    }

    /// Workers finish their current node and exit; queued work is dropped
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether the queue has a free slot right now
    pub fn has_capacity(&self) -> bool {
        self.sender.capacity() > 0
    }

    /// Nodes waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.queue_capacity.saturating_sub(self.sender.capacity())
    }

    pub fn worker_count(&self) -> usize {
        self.shared.stats.live()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.shared.stats.clone()
    }

    fn scale_up(&self) {
        let stats = &self.shared.stats;
        while !self.shutdown.is_cancelled()
            && self.queue_depth().saturating_sub(stats.idle()) >= self.scale_up_threshold
            && stats.try_grow(self.max_workers)
        {
            let live = stats.live();
            self.launch();
            tracing::debug!(live, queue_depth = self.queue_depth(), "Scaled worker pool up");
        }
    }

    fn spawn_worker(&self) {
        if self.shared.stats.try_grow(self.max_workers) {
            self.launch();
        }
    }

    /// Start a worker task already counted in `live`
    fn launch(&self) {
        let shared = self.shared.clone();
        let worker_id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(worker_loop(worker_id, shared));
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<WorkerShared>) {
    let stats = &shared.stats;
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            invocation = tokio::time::timeout(shared.idle_timeout, async {
                shared.receiver.lock().await.recv().await
            }) => match invocation {
                Ok(invocation) => invocation,
                Err(_) if stats.try_shrink(shared.min_workers) => {
                    tracing::debug!(worker_id, live = stats.live(), "Idle worker retired");
                    return;
                }
                Err(_) => continue,
            },
        };
        let Some(invocation) = next else {
            break;
        };
        stats.busy.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker_id, node_id = %invocation.config.id, "Worker picked up node");
        run_invocation(invocation, &shared.messages).await;
        stats.busy.fetch_sub(1, Ordering::SeqCst);
    }
    stats.live.fetch_sub(1, Ordering::SeqCst);
    tracing::debug!(worker_id, "Worker exited");
}

/// Reports the completion and releases the tracker entry when dropped, so a
/// node that panics or whose task is torn down still gets accounted for.
struct CompletionGuard<'a> {
    scope: ScopeId,
    tracker: Arc<ExecutionTracker>,
    messages: &'a mpsc::UnboundedSender<WorkerMessage>,
    execution: NodeExecution,
    completion: Option<NodeCompletion>,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => {
                let error = NodeError::ExecutionFailed("node run was interrupted".to_string());
                let mut execution = self.execution.clone();
                execution.status = NodeExecutionStatus::Failed;
                execution.error = Some(error.to_string());
                execution.finished_at = Some(Utc::now());
                NodeCompletion {
                    scope: self.scope,
                    status: CompletionStatus::Failed,
                    execution,
                    result: NodeRunResult::default(),
                    error: Some(error),
                }
            }
        };
        let node_id = completion.execution.node_id.clone();
        let messages = self.messages;
        self.tracker.remove_then(&node_id, || {
            let _ = messages.send(WorkerMessage::Completed(completion));
        });
    }
}

async fn run_invocation(invocation: NodeInvocation, messages: &mpsc::UnboundedSender<WorkerMessage>) {
    let NodeInvocation {
        scope,
        run_id,
        node,
        config,
        variable_pool,
        tracker,
        cancellation,
        mut execution,
    } = invocation;

    execution.started_at = Utc::now();
    execution.status = NodeExecutionStatus::Running;
    let _ = messages.send(WorkerMessage::Started {
        scope,
        execution: execution.clone(),
    });

    let mut guard = CompletionGuard {
        scope,
        tracker,
        messages,
        execution: execution.clone(),
        completion: None,
    };

    let started = Instant::now();
    let retry = config.retry.unwrap_or_default();
    let mut attempt = 0u32;
    let chunks = {
        let messages = messages.clone();
        ChunkSink::new(move |chunk| {
            let _ = messages.send(WorkerMessage::Chunk { scope, chunk });
        })
    };

    let outcome = loop {
        let ctx = NodeContext {
            run_id,
            execution_id: execution.id,
            node_id: config.id.clone(),
            config: config.clone(),
            variable_pool: variable_pool.clone(),
            cancellation: cancellation.clone(),
            attempt,
            chunks: chunks.clone(),
        };
        let result = match AssertUnwindSafe(node.run(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(NodeError::ExecutionFailed(format!("node {} panicked", config.id))),
        };
        let outcome = NodeOutcome::from_run(result);

        match &outcome {
            NodeOutcome::Failure(failure)
                if failure.error.is_retryable()
                    && attempt < retry.max_attempts
                    && !cancellation.is_cancelled() =>
            {
                attempt += 1;
                tracing::warn!(
                    node_id = %config.id,
                    attempt,
                    max_attempts = retry.max_attempts,
                    error = %failure.error,
                    "Node failed, retrying"
                );
                let mut retry_record = execution.clone();
                retry_record.status = NodeExecutionStatus::Retry;
                retry_record.error = Some(failure.error.to_string());
                retry_record.inputs = failure.partial.inputs.clone();
                retry_record.elapsed_ms = started.elapsed().as_millis() as u64;
                let _ = messages.send(WorkerMessage::Retry {
                    scope,
                    execution: retry_record,
                    retry_index: attempt,
                });
                tokio::select! {
                    _ = cancellation.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(retry.interval_ms)) => {}
                }
            }
            _ => break outcome,
        }
    };

    execution.elapsed_ms = started.elapsed().as_millis() as u64;
    execution.finished_at = Some(Utc::now());
    guard.completion = Some(finalize(scope, &config, execution, outcome));
}

/// Apply the node's error strategy to a finished run
pub(crate) fn finalize(
    scope: ScopeId,
    config: &NodeConfig,
    mut execution: NodeExecution,
    outcome: NodeOutcome,
) -> NodeCompletion {
    match outcome {
        NodeOutcome::Success(result) => {
            execution.status = NodeExecutionStatus::Succeeded;
            execution.inputs = result.inputs.clone();
            execution.outputs = result.outputs.clone();
            execution.process_data = result.process_data.clone();
            NodeCompletion {
                scope,
                status: CompletionStatus::Succeeded,
                execution,
                result,
                error: None,
            }
        }
        NodeOutcome::Failure(failure) => {
            let error = failure.error;
            let partial = failure.partial;
            execution.error = Some(error.to_string());
            execution.inputs = partial.inputs.clone();
            execution.process_data = partial.process_data.clone();

            let error_outputs = BTreeMap::from([
                ("error_message".to_string(), Value::from(error.to_string())),
                ("error_type".to_string(), Value::from(error.error_type())),
            ]);

            let (status, outputs) = match config.error_strategy {
                ErrorStrategy::FailFast => {
                    tracing::error!(node_id = %config.id, error = %error, "Node failed");
                    execution.status = NodeExecutionStatus::Failed;
                    (CompletionStatus::Failed, BTreeMap::new())
                }
                ErrorStrategy::ContinueOnError => {
                    tracing::warn!(node_id = %config.id, error = %error, "Node failed, continuing");
                    execution.status = NodeExecutionStatus::Failed;
                    (CompletionStatus::Exception(ErrorStrategy::ContinueOnError), error_outputs)
                }
                ErrorStrategy::DefaultValue => {
                    tracing::warn!(node_id = %config.id, error = %error, "Node failed, using default value");
                    execution.status = NodeExecutionStatus::Exception;
                    let mut outputs = config.default_outputs();
                    outputs.extend(error_outputs);
                    (CompletionStatus::Exception(ErrorStrategy::DefaultValue), outputs)
                }
            };
            execution.outputs = outputs.clone();

            NodeCompletion {
                scope,
                status,
                execution,
                result: NodeRunResult {
                    outputs,
                    ..partial
                },
                error: Some(error),
            }
        }
    }
}
