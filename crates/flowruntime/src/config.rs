use crate::worker::{Backpressure, WorkerPoolConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and sizing of one graph run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers kept alive while the run is idle
    pub min_workers: usize,
    /// Upper bound on node bodies running at once
    pub max_workers: usize,
    /// Queued nodes without an idle worker that make the pool grow by one
    pub scale_up_threshold: usize,
    /// Workers above `min_workers` exit after idling this long
    pub worker_idle_timeout_ms: u64,
    /// Ready nodes waiting for a free worker
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    /// Coordinator wakes at least this often to poll commands
    pub command_poll_interval_ms: u64,
    /// Node runs allowed per run, loop rounds included
    pub max_execution_steps: u64,
    pub max_execution_time_secs: u64,
    /// Capacity of the per-run event stream and the runtime's broadcast bus
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 1,
            worker_idle_timeout_ms: 5_000,
            queue_capacity: 256,
            backpressure: Backpressure::Block,
            command_poll_interval_ms: 50,
            max_execution_steps: 500,
            max_execution_time_secs: 1200,
            event_buffer_size: 1000,
        }
    }
}

impl EngineConfig {
    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
            backpressure: self.backpressure,
            scale_up_threshold: self.scale_up_threshold,
            idle_timeout: Duration::from_millis(self.worker_idle_timeout_ms.max(1)),
        }
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_interval_ms.max(1))
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }
}
