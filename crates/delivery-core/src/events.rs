//! Event types for the audit log.
//!
//! One event is appended per notable transition: a goal being requested,
//! an execution starting or finishing, a duplicate being suppressed, and
//! managed deployments starting or stopping.

use crate::types::{DeploymentKey, ExecutionState, Id, StatusState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StatusReceived,
    GoalRequested,
    ExecutionStarted,
    ExecutionFinished,
    DuplicateSuppressed,
    DeploymentStarted,
    DeploymentTerminated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StatusReceived => "STATUS_RECEIVED",
            Self::GoalRequested => "GOAL_REQUESTED",
            Self::ExecutionStarted => "EXECUTION_STARTED",
            Self::ExecutionFinished => "EXECUTION_FINISHED",
            Self::DuplicateSuppressed => "DUPLICATE_SUPPRESSED",
            Self::DeploymentStarted => "DEPLOYMENT_STARTED",
            Self::DeploymentTerminated => "DEPLOYMENT_TERMINATED",
        }
    }
}

/// Payload for STATUS_RECEIVED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReceivedPayload {
    pub context: String,
    pub state: StatusState,
    pub target_url: Option<String>,
}

/// Payload for GOAL_REQUESTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalRequestedPayload {
    pub context: String,
    /// Gate decision that let the request through.
    pub decision: String,
}

/// Payload for EXECUTION_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStartedPayload {
    pub execution_id: Id,
    pub context: String,
    pub log_url: Option<String>,
}

/// Payload for EXECUTION_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFinishedPayload {
    pub execution_id: Id,
    pub state: ExecutionState,
    pub reported: StatusState,
    pub duration_ms: u64,
    pub diagnosis: Option<String>,
}

/// Payload for DUPLICATE_SUPPRESSED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateSuppressedPayload {
    pub key: String,
}

/// Payload for DEPLOYMENT_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStartedPayload {
    pub key: DeploymentKey,
    pub port: u16,
    pub pid: Option<u32>,
    pub endpoint: String,
}

/// Payload for DEPLOYMENT_TERMINATED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTerminatedPayload {
    pub key: DeploymentKey,
    pub pid: Option<u32>,
    /// Whether the process confirmed exit within the wait window.
    pub exited: bool,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    StatusReceived(StatusReceivedPayload),
    GoalRequested(GoalRequestedPayload),
    ExecutionStarted(ExecutionStartedPayload),
    ExecutionFinished(ExecutionFinishedPayload),
    DuplicateSuppressed(DuplicateSuppressedPayload),
    DeploymentStarted(DeploymentStartedPayload),
    DeploymentTerminated(DeploymentTerminatedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::StatusReceived(_) => EventType::StatusReceived,
            Self::GoalRequested(_) => EventType::GoalRequested,
            Self::ExecutionStarted(_) => EventType::ExecutionStarted,
            Self::ExecutionFinished(_) => EventType::ExecutionFinished,
            Self::DuplicateSuppressed(_) => EventType::DuplicateSuppressed,
            Self::DeploymentStarted(_) => EventType::DeploymentStarted,
            Self::DeploymentTerminated(_) => EventType::DeploymentTerminated,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
