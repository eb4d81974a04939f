//! Out-of-band control of a running graph.
//!
//! Callers publish [`Command`]s keyed by run id through a
//! [`CommandTransport`]; the engine polls its own run's commands between
//! scheduling steps. Delivery is best effort: transport failures are logged
//! and never surface to the caller or the run.

#[cfg(feature = "iggy")]
mod iggy_channel;
mod memory;

#[cfg(feature = "iggy")]
pub use iggy_channel::{IggyCommandConfig, IggyCommandTransport};
pub use memory::InMemoryCommandTransport;

use crate::RunId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Wire format: `{"type": "abort" | "pause", "reason": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Pause {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Command {
    pub fn abort(reason: impl Into<String>) -> Self {
        Command::Abort {
            reason: Some(reason.into()),
        }
    }

    pub fn pause(reason: impl Into<String>) -> Self {
        Command::Pause {
            reason: Some(reason.into()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Command::Abort { reason } | Command::Pause { reason } => reason.as_deref(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode command: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish command: {0}")]
    PublishFailed(String),

    #[error("Failed to poll commands: {0}")]
    PollFailed(String),
}

/// Moves commands from senders to the run they target
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn publish(&self, run_id: RunId, command: &Command) -> Result<(), TransportError>;

    /// Take every command queued for `run_id` without blocking for new ones
    async fn fetch(&self, run_id: RunId) -> Result<Vec<Command>, TransportError>;
}

/// Caller-side handle for sending commands to any run
#[derive(Clone)]
pub struct CommandSender {
    transport: Arc<dyn CommandTransport>,
}

impl CommandSender {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    /// Publish a command. Returns whether the transport accepted it; a
    /// failure only means pause/abort is unavailable for that run for now.
    pub async fn send(&self, run_id: RunId, command: Command) -> bool {
        match self.transport.publish(run_id, &command).await {
            Ok(()) => {
                tracing::info!(%run_id, ?command, "Command sent");
                true
            }
            Err(e) => {
                tracing::warn!(%run_id, ?command, error = %e, "Failed to deliver command");
                false
            }
        }
    }
}

/// Engine-side view of one run's commands
#[derive(Clone)]
pub struct CommandChannel {
    run_id: RunId,
    transport: Arc<dyn CommandTransport>,
}

impl CommandChannel {
    pub fn new(run_id: RunId, transport: Arc<dyn CommandTransport>) -> Self {
        Self { run_id, transport }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Drain pending commands; transport errors read as "no commands"
    pub async fn poll(&self) -> Vec<Command> {
        match self.transport.fetch(self.run_id).await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Command poll failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct BrokenTransport;

    #[async_trait]
    impl CommandTransport for BrokenTransport {
        async fn publish(&self, _: RunId, _: &Command) -> Result<(), TransportError> {
            Err(TransportError::Unavailable("down".to_string()))
        }

        async fn fetch(&self, _: RunId) -> Result<Vec<Command>, TransportError> {
            Err(TransportError::PollFailed("down".to_string()))
        }
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_value(Command::abort("user request")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "abort", "reason": "user request"}));

        let parsed: Command = serde_json::from_str(r#"{"type":"pause"}"#).unwrap();
        assert_eq!(parsed, Command::Pause { reason: None });
    }

    #[tokio::test]
    async fn transport_failures_are_swallowed() {
        let transport: Arc<dyn CommandTransport> = Arc::new(BrokenTransport);
        let run_id = Uuid::new_v4();

        let sender = CommandSender::new(transport.clone());
        assert!(!sender.send(run_id, Command::abort("x")).await);

        let channel = CommandChannel::new(run_id, transport);
        assert!(channel.poll().await.is_empty());
    }
}
