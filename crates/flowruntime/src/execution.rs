//! Run-level state machine.

use chrono::{DateTime, Utc};
use flowcore::{NodeId, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Stopped,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid run transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Status and outcome of one run, owned by its coordinator
#[derive(Debug, Clone, Serialize)]
pub struct GraphExecution {
    pub run_id: RunId,
    status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    pub abort_reason: Option<String>,
    pub error: Option<String>,
    pub error_node_id: Option<NodeId>,
    pub exceptions_count: u64,
    /// Scope frame slots the run allocated; closed scopes hand theirs on, so
    /// this tracks the most scopes open at once
    pub scope_slots: usize,
}

impl GraphExecution {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: ExecutionStatus::NotStarted,
            started_at: None,
            finished_at: None,
            pause_reason: None,
            abort_reason: None,
            error: None,
            error_node_id: None,
            exceptions_count: 0,
            scope_slots: 0,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    fn transition(&mut self, to: ExecutionStatus) -> Result<(), InvalidTransition> {
        let allowed = match (self.status, to) {
            (ExecutionStatus::NotStarted, ExecutionStatus::Running) => true,
            (ExecutionStatus::Running, next) => next != ExecutionStatus::Running,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        match to {
            ExecutionStatus::Running => self.started_at = Some(Utc::now()),
            _ => self.finished_at = Some(Utc::now()),
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(ExecutionStatus::Running)
    }

    pub fn succeed(&mut self) -> Result<(), InvalidTransition> {
        self.transition(ExecutionStatus::Succeeded)
    }

    /// Record the first fatal error
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        node_id: Option<NodeId>,
    ) -> Result<(), InvalidTransition> {
        self.transition(ExecutionStatus::Failed)?;
        self.error = Some(error.into());
        self.error_node_id = node_id;
        Ok(())
    }

    pub fn stop(&mut self, reason: Option<String>) -> Result<(), InvalidTransition> {
        self.transition(ExecutionStatus::Stopped)?;
        self.abort_reason = reason;
        Ok(())
    }

    pub fn pause(&mut self, reason: Option<String>) -> Result<(), InvalidTransition> {
        self.transition(ExecutionStatus::Paused)?;
        self.pause_reason = reason;
        Ok(())
    }

    pub fn record_exception(&mut self) {
        self.exceptions_count += 1;
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn lifecycle_transitions() {
        let mut execution = GraphExecution::new(Uuid::new_v4());
        assert!(execution.succeed().is_err());

        execution.start().unwrap();
        assert!(execution.is_running());
        execution.fail("boom", Some("a".to_string())).unwrap();
        assert_eq!(execution.status(), ExecutionStatus::Failed);
        assert_eq!(execution.error_node_id.as_deref(), Some("a"));

        let err = execution.stop(None).unwrap_err();
        assert_eq!(err.from, ExecutionStatus::Failed);
    }

    #[test]
    fn paused_runs_are_not_terminal() {
        let mut execution = GraphExecution::new(Uuid::new_v4());
        execution.start().unwrap();
        execution.pause(Some("review".to_string())).unwrap();
        assert!(!execution.status().is_terminal());
        assert!(execution.start().is_err());
    }
}
