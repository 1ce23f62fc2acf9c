//! Core types for the delivery daemon.
//!
//! Status entries and snapshots describe what a commit looks like from the
//! outside; executions and deployments describe what the daemon did about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for executions, events and progress logs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// State of a single status context on a commit.
///
/// `WaitingForApproval` is reported when a goal finished but a human must
/// sign off before dependents may run. It is neither pending nor success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
    WaitingForApproval,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::WaitingForApproval => "waiting_for_approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "error" => Some(Self::Error),
            "waiting_for_approval" => Some(Self::WaitingForApproval),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one goal execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
    AwaitingApproval,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "AWAITING_APPROVAL" => Self::AwaitingApproval,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// How a local deployment starts the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Run the jar produced by the build goal.
    #[default]
    Jar,
    /// Run from a fresh checkout with `mvn spring-boot:run`.
    Source,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jar => "jar",
            Self::Source => "source",
        }
    }
}

// --- Commit and status model ---

fn default_branch() -> String {
    "master".to_string()
}

/// A commit on a branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    /// Branch the push landed on. Falls back to `master` when unknown.
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl CommitRef {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        sha: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            sha: sha.into(),
            branch: branch.into(),
        }
    }

    /// Key identifying the local deployment slot for this commit's branch.
    pub fn deployment_key(&self) -> DeploymentKey {
        DeploymentKey {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
        }
    }
}

impl std::fmt::Display for CommitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.sha)
    }
}

/// One reported status on a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// External context string identifying the goal (e.g. `delivery/build`).
    pub context: String,
    pub state: StatusState,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl StatusEntry {
    pub fn new(context: impl Into<String>, state: StatusState) -> Self {
        Self {
            context: context.into(),
            state,
            target_url: None,
            description: None,
        }
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A commit's statuses at decision time plus the context under evaluation.
///
/// Entries are kept in arrival order. A later entry for a context supersedes
/// any earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub context: String,
    pub siblings: Vec<StatusEntry>,
}

impl StatusSnapshot {
    pub fn new(context: impl Into<String>, siblings: Vec<StatusEntry>) -> Self {
        Self {
            context: context.into(),
            siblings,
        }
    }

    /// Latest entry for `context`, if one was ever reported.
    pub fn latest(&self, context: &str) -> Option<&StatusEntry> {
        self.siblings.iter().rfind(|s| s.context == context)
    }

    /// Latest entry for the context under evaluation.
    pub fn ours(&self) -> Option<&StatusEntry> {
        self.latest(&self.context)
    }

    /// Same siblings, evaluated for a different context.
    pub fn for_context(&self, context: &str) -> Self {
        Self {
            context: context.to_string(),
            siblings: self.siblings.clone(),
        }
    }

    /// One entry per context, latest value, first-seen order.
    pub fn current(&self) -> Vec<StatusEntry> {
        let mut seen: Vec<&str> = Vec::new();
        for entry in &self.siblings {
            if !seen.contains(&entry.context.as_str()) {
                seen.push(&entry.context);
            }
        }
        seen.into_iter()
            .filter_map(|c| self.latest(c).cloned())
            .collect()
    }
}

// --- Goal results ---

/// Uniform result every goal executor returns.
///
/// `code == 0` with `require_approval == false` is the only plain success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteGoalResult {
    pub code: i32,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ExecuteGoalResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: if code == 0 { 1 } else { code },
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn awaiting_approval(message: impl Into<String>) -> Self {
        Self {
            require_approval: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == 0 && !self.require_approval
    }
}

// --- Records ---

/// One goal execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Id,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub branch: String,
    /// Status context of the goal this attempt ran for.
    pub context: String,
    pub goal_name: String,
    pub state: ExecutionState,
    /// Path to the durable progress log on disk.
    pub log_path: Option<String>,
    /// Link to the progress log served by the daemon.
    pub log_url: Option<String>,
    pub target_url: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn commit(&self) -> CommitRef {
        CommitRef::new(&self.owner, &self.repo, &self.sha, &self.branch)
    }
}

/// An event in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    /// Commit the event concerns; deployment events have none.
    pub sha: Option<String>,
    /// Execution this event belongs to (optional).
    pub execution_id: Option<Id>,
    /// Event type name (e.g., `GOAL_REQUESTED`, `EXECUTION_FINISHED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}

/// Identifies a logical local deployment slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl DeploymentKey {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Context root the deployed application is served under.
    pub fn context_root(&self) -> String {
        format!("/{}/{}/{}", self.owner, self.repo, self.branch)
    }
}

impl std::fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.repo, self.branch)
    }
}

/// Snapshot of a live managed deployment, as exposed over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub key: DeploymentKey,
    pub port: u16,
    pub pid: Option<u32>,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
}
