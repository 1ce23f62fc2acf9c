//! Inbound event handling.
//!
//! The dispatcher owns the startup-time table of goal registrations. Every
//! inbound event is recorded, then every registered goal is offered to the
//! runner; the gate decides which of them actually run.

use std::sync::Arc;

use delivery_core::events::{EventPayload, StatusReceivedPayload};
use delivery_core::{
    CommitRef, ExecutionState, Id, Pipeline, StatusEntry, StatusSnapshot, StatusState,
};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::{AttemptOutcome, GoalExecutionRunner, GoalExecutor};
use crate::reporter::{ReporterError, StatusReporter, StatusSource};
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Reporter(#[from] ReporterError),
    #[error("goal {context} is not waiting for approval")]
    NotWaiting { context: String },
    #[error("goal {context} has not failed")]
    NotRetryable { context: String },
    #[error("goal {0} is not part of the pipeline")]
    UnknownGoal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// One goal and the executor that handles it.
pub struct GoalRegistration {
    pub context: String,
    pub executor: Arc<dyn GoalExecutor>,
}

impl std::fmt::Debug for GoalRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalRegistration")
            .field("context", &self.context)
            .field("executor", &self.executor.name())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishedGoal {
    pub context: String,
    pub execution_id: Id,
    pub state: ExecutionState,
    pub reported: StatusState,
}

/// What one dispatch did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchSummary {
    pub finished: Vec<FinishedGoal>,
    pub suppressed: usize,
}

pub struct Dispatcher {
    runner: Arc<GoalExecutionRunner>,
    reporter: Arc<dyn StatusReporter>,
    source: Arc<dyn StatusSource>,
    storage: Arc<Storage>,
    registrations: Vec<GoalRegistration>,
    loopback: bool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registrations", &self.registrations)
            .field("loopback", &self.loopback)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        runner: Arc<GoalExecutionRunner>,
        reporter: Arc<dyn StatusReporter>,
        source: Arc<dyn StatusSource>,
        storage: Arc<Storage>,
        loopback: bool,
    ) -> Self {
        Self {
            runner,
            reporter,
            source,
            storage,
            registrations: Vec::new(),
            loopback,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        self.runner.pipeline()
    }

    /// Register the executor for a declared goal.
    pub fn register(&mut self, context: &str, executor: Arc<dyn GoalExecutor>) -> Result<()> {
        if self.pipeline().goal(context).is_none() {
            return Err(DispatchError::UnknownGoal(context.to_string()));
        }
        debug!(context = %context, executor = executor.name(), "registered goal executor");
        self.registrations.retain(|r| r.context != context);
        self.registrations.push(GoalRegistration {
            context: context.to_string(),
            executor,
        });
        Ok(())
    }

    pub fn registrations(&self) -> &[GoalRegistration] {
        &self.registrations
    }

    /// A push: plan every goal of the pipeline, then dispatch.
    pub async fn on_push(&self, commit: &CommitRef) -> Result<DispatchSummary> {
        self.plan(commit).await?;
        Ok(self.evaluate(commit).await)
    }

    /// An inbound status event: record it, then dispatch.
    pub async fn on_status(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<DispatchSummary> {
        self.record(commit, entry).await?;
        Ok(self.evaluate(commit).await)
    }

    /// Sign off a goal that is waiting for approval, then dispatch.
    pub async fn approve(&self, commit: &CommitRef, context: &str) -> Result<DispatchSummary> {
        self.sign_off(commit, context).await?;
        Ok(self.evaluate(commit).await)
    }

    /// Put a failed goal back to pending and dispatch it again.
    pub async fn retry(&self, commit: &CommitRef, context: &str) -> Result<DispatchSummary> {
        self.reopen(commit, context).await?;
        Ok(self.evaluate(commit).await)
    }

    /// Report every goal of the pipeline pending for the commit.
    pub async fn plan(&self, commit: &CommitRef) -> Result<()> {
        info!(commit = %commit, pipeline = %self.pipeline().name, "planning goals");
        for goal in self.pipeline().goals() {
            let entry = StatusEntry::new(&goal.context, StatusState::Pending)
                .with_description(goal.pending_description());
            self.reporter.set_status(commit, &entry).await?;
        }
        Ok(())
    }

    /// Record an inbound status without dispatching.
    ///
    /// A repeat of the latest entry is a redelivery. So is a `pending` entry
    /// already seen for the goal: it cannot reset a goal that has since
    /// finished. Retries go through [`Dispatcher::retry`].
    pub async fn record(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<()> {
        let history = self.source.snapshot(commit, &entry.context).await?;
        if is_redelivery(&history, entry) {
            debug!(sha = %commit.sha, context = %entry.context, state = %entry.state, "status event redelivered");
            return Ok(());
        }
        self.reporter.set_status(commit, entry).await?;
        let payload = EventPayload::StatusReceived(StatusReceivedPayload {
            context: entry.context.clone(),
            state: entry.state,
            target_url: entry.target_url.clone(),
        });
        if let Err(e) = self.storage.append_event(Some(&commit.sha), None, &payload).await {
            warn!(sha = %commit.sha, error = %e, "failed to append event");
        }
        Ok(())
    }

    /// Mark a waiting goal successful without dispatching.
    pub async fn sign_off(&self, commit: &CommitRef, context: &str) -> Result<()> {
        let goal = self
            .pipeline()
            .goal(context)
            .ok_or_else(|| DispatchError::UnknownGoal(context.to_string()))?;
        let current = self.current_state(commit, context).await?;
        if current != Some(StatusState::WaitingForApproval) {
            return Err(DispatchError::NotWaiting {
                context: context.to_string(),
            });
        }

        info!(commit = %commit, context = %context, "goal approved");
        let entry = StatusEntry::new(context, StatusState::Success)
            .with_description(&goal.success_description);
        self.reporter.set_status(commit, &entry).await?;
        Ok(())
    }

    /// Reset a failed goal to pending without dispatching.
    pub async fn reopen(&self, commit: &CommitRef, context: &str) -> Result<()> {
        let goal = self
            .pipeline()
            .goal(context)
            .ok_or_else(|| DispatchError::UnknownGoal(context.to_string()))?;
        let current = self.current_state(commit, context).await?;
        if !matches!(current, Some(StatusState::Failure | StatusState::Error)) {
            return Err(DispatchError::NotRetryable {
                context: context.to_string(),
            });
        }

        info!(commit = %commit, context = %context, "retrying goal");
        let entry = StatusEntry::new(context, StatusState::Pending)
            .with_description(goal.pending_description());
        self.reporter.set_status(commit, &entry).await?;
        Ok(())
    }

    async fn current_state(&self, commit: &CommitRef, context: &str) -> Result<Option<StatusState>> {
        let snapshot = self.source.snapshot(commit, context).await?;
        Ok(snapshot.ours().map(|s| s.state))
    }

    /// Offer every registered goal to the runner.
    ///
    /// With loopback on, goals unblocked by this round's results run in the
    /// next round, until a round finishes nothing.
    pub async fn evaluate(&self, commit: &CommitRef) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let rounds = if self.loopback {
            self.registrations.len() + 1
        } else {
            1
        };

        for _ in 0..rounds {
            let outcomes = join_all(self.registrations.iter().map(|r| {
                self.runner
                    .run(commit, &r.context, Arc::clone(&r.executor))
            }))
            .await;

            let mut progressed = false;
            for (registration, outcome) in self.registrations.iter().zip(outcomes) {
                match outcome {
                    AttemptOutcome::Finished(report) => {
                        progressed = true;
                        summary.finished.push(FinishedGoal {
                            context: registration.context.clone(),
                            execution_id: report.execution_id,
                            state: report.state,
                            reported: report.reported.state,
                        });
                    }
                    AttemptOutcome::DuplicateSuppressed => summary.suppressed += 1,
                    AttemptOutcome::StatusUnavailable(reason) => {
                        warn!(sha = %commit.sha, context = %registration.context, reason = %reason, "skipped goal");
                    }
                    AttemptOutcome::GateDenied(_) => {}
                }
            }
            if !progressed {
                break;
            }
        }
        summary
    }
}

fn is_redelivery(history: &StatusSnapshot, entry: &StatusEntry) -> bool {
    if history.latest(&entry.context) == Some(entry) {
        return true;
    }
    entry.state == StatusState::Pending && history.siblings.contains(entry)
}
