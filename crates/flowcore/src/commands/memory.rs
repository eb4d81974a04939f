use super::{Command, CommandTransport, TransportError};
use crate::RunId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Process-local command transport, one queue per run
#[derive(Default)]
pub struct InMemoryCommandTransport {
    queues: Mutex<HashMap<RunId, VecDeque<Command>>>,
}

impl InMemoryCommandTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, run_id: RunId) -> usize {
        self.queues.lock().get(&run_id).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl CommandTransport for InMemoryCommandTransport {
    async fn publish(&self, run_id: RunId, command: &Command) -> Result<(), TransportError> {
        self.queues
            .lock()
            .entry(run_id)
            .or_default()
            .push_back(command.clone());
        Ok(())
    }

    async fn fetch(&self, run_id: RunId) -> Result<Vec<Command>, TransportError> {
        Ok(self
            .queues
            .lock()
            .remove(&run_id)
            .map(Vec::from)
            .unwrap_or_default())
    }
}
