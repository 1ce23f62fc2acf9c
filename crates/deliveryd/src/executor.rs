//! Goal execution: gate, deduplicate, run, interpret, report.
//!
//! [`GoalExecutionRunner::run`] is the boundary every goal attempt passes
//! through. An attempt starts only when the phase gate says `Run` and no
//! identical attempt is in flight. Whatever the executor does, including
//! returning an error or panicking, the attempt ends with exactly one
//! terminal status report.
//!
//! ```text
//! Pending -> Running -> Succeeded
//!                    -> AwaitingApproval
//!                    -> Failed
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use delivery_core::events::{
    DuplicateSuppressedPayload, EventPayload, ExecutionFinishedPayload, ExecutionStartedPayload,
    GoalRequestedPayload,
};
use delivery_core::gate::{self, GateDecision};
use delivery_core::interpret::{InterpretedLog, InterpreterChain};
use delivery_core::{
    CommitRef, ExecuteGoalResult, Execution, ExecutionState, Goal, Id, Pipeline, StatusEntry,
    StatusSnapshot, StatusState,
};
use futures_util::FutureExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifact::ArtifactError;
use crate::build::BuildError;
use crate::checkout::CheckoutError;
use crate::dedup::Deduplicator;
use crate::deployer::DeployError;
use crate::progress_log::{LogFactory, ProgressLog};
use crate::reporter::{Notification, Notifier, ReporterError, RetryAction, StatusReporter, StatusSource};
use crate::storage::Storage;
use crate::supervisor::SupervisorError;

/// Everything an executor may fail with. The runner turns each into a
/// reported failure; none escape it.
#[derive(Debug, Error)]
pub enum GoalError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Reporter(#[from] ReporterError),
    #[error("{0}")]
    Failed(String),
    #[error("goal panicked: {0}")]
    Panicked(String),
}

impl GoalError {
    /// Missing tooling will not fix itself on retry.
    pub fn is_tooling_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Supervisor(SupervisorError::ToolingUnavailable { .. })
                | Self::Checkout(CheckoutError::GitUnavailable)
                | Self::Deploy(DeployError::Supervisor(SupervisorError::ToolingUnavailable { .. }))
        )
    }
}

/// What an executor gets to work with.
pub struct GoalContext {
    pub commit: CommitRef,
    pub goal: Goal,
    /// Statuses at the moment the gate admitted this attempt.
    pub snapshot: StatusSnapshot,
    pub log: Arc<dyn ProgressLog>,
    pub execution_id: Id,
}

impl std::fmt::Debug for GoalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalContext")
            .field("commit", &self.commit)
            .field("goal", &self.goal.name)
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

impl GoalContext {
    /// Append one line to the progress log.
    pub fn progress(&self, line: impl AsRef<str>) {
        let _ = self.log.write(&format!("{}\n", line.as_ref()));
    }

    /// Target URL a sibling goal reported, e.g. the built artifact.
    pub fn sibling_target_url(&self, context: &str) -> Option<String> {
        self.snapshot
            .latest(context)
            .filter(|s| s.state == StatusState::Success)
            .and_then(|s| s.target_url.clone())
    }
}

/// The body of one goal.
#[async_trait]
pub trait GoalExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError>;

    /// Heuristics applied to the log when this goal fails.
    fn interpreter(&self) -> InterpreterChain {
        InterpreterChain::default()
    }
}

/// How one call to [`GoalExecutionRunner::run`] ended.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The gate refused; nothing ran. Not an error.
    GateDenied(GateDecision),
    /// An identical attempt is already in flight.
    DuplicateSuppressed,
    /// The status snapshot could not be read; nothing ran.
    StatusUnavailable(String),
    Finished(AttemptReport),
}

#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub execution_id: Id,
    pub state: ExecutionState,
    /// The terminal status this attempt reported.
    pub reported: StatusEntry,
    /// False when the status write itself failed.
    pub reported_ok: bool,
    pub diagnosis: Option<InterpretedLog>,
}

pub struct GoalExecutionRunner {
    pipeline: Arc<Pipeline>,
    dedup: Arc<Deduplicator>,
    source: Arc<dyn StatusSource>,
    reporter: Arc<dyn StatusReporter>,
    notifier: Arc<dyn Notifier>,
    logs: LogFactory,
    storage: Arc<Storage>,
    retry_enabled: bool,
}

impl std::fmt::Debug for GoalExecutionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalExecutionRunner")
            .field("pipeline", &self.pipeline.name)
            .field("retry_enabled", &self.retry_enabled)
            .finish_non_exhaustive()
    }
}

impl GoalExecutionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<Pipeline>,
        dedup: Arc<Deduplicator>,
        source: Arc<dyn StatusSource>,
        reporter: Arc<dyn StatusReporter>,
        notifier: Arc<dyn Notifier>,
        logs: LogFactory,
        storage: Arc<Storage>,
        retry_enabled: bool,
    ) -> Self {
        Self {
            pipeline,
            dedup,
            source,
            reporter,
            notifier,
            logs,
            storage,
            retry_enabled,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run the goal for `context` on `commit` if the gate allows it.
    pub async fn run(
        &self,
        commit: &CommitRef,
        context: &str,
        executor: Arc<dyn GoalExecutor>,
    ) -> AttemptOutcome {
        if let Err(outcome) = self.admit(commit, context).await {
            return outcome;
        }

        let key = format!("{}/{}@{}:{}", commit.owner, commit.repo, commit.sha, context);
        let attempt = self
            .dedup
            .run_exclusive(&key, || self.attempt(commit, context, executor))
            .await;

        match attempt {
            Some(outcome) => outcome,
            None => {
                let payload = EventPayload::DuplicateSuppressed(DuplicateSuppressedPayload { key });
                self.audit(commit, None, &payload).await;
                AttemptOutcome::DuplicateSuppressed
            }
        }
    }

    /// Gate check. `Ok` carries the snapshot the gate admitted.
    async fn admit(
        &self,
        commit: &CommitRef,
        context: &str,
    ) -> Result<StatusSnapshot, AttemptOutcome> {
        let snapshot = self.source.snapshot(commit, context).await.map_err(|e| {
            error!(sha = %commit.sha, context = %context, error = %e, "failed to read statuses");
            AttemptOutcome::StatusUnavailable(e.to_string())
        })?;

        match gate::evaluate(&self.pipeline, &snapshot) {
            GateDecision::Run => Ok(snapshot),
            decision => {
                debug!(
                    sha = %commit.sha,
                    context = %context,
                    decision = decision.as_str(),
                    "gate denied goal"
                );
                Err(AttemptOutcome::GateDenied(decision))
            }
        }
    }

    async fn attempt(
        &self,
        commit: &CommitRef,
        context: &str,
        executor: Arc<dyn GoalExecutor>,
    ) -> AttemptOutcome {
        // A redelivered event may arrive right after the previous attempt
        // released the key; its status is no longer pending by then.
        let snapshot = match self.admit(commit, context).await {
            Ok(snapshot) => snapshot,
            Err(outcome) => return outcome,
        };
        let Some(goal) = self.pipeline.goal(context).cloned() else {
            return AttemptOutcome::GateDenied(GateDecision::Undeclared);
        };

        let execution_id = Id::new();
        let short_sha: String = commit.sha.chars().take(7).collect();
        let created = self
            .logs
            .create(&execution_id, &format!("{short_sha} {}", goal.name));
        let now = Utc::now();
        let execution = Execution {
            id: execution_id.clone(),
            owner: commit.owner.clone(),
            repo: commit.repo.clone(),
            sha: commit.sha.clone(),
            branch: commit.branch.clone(),
            context: context.to_string(),
            goal_name: goal.name.clone(),
            state: ExecutionState::Running,
            log_path: created.path.as_ref().map(|p| p.display().to_string()),
            log_url: created.url.clone(),
            target_url: None,
            message: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.storage.insert_execution(&execution).await {
            error!(execution_id = %execution_id, error = %e, "failed to record execution");
        }
        self.audit(
            commit,
            Some(&execution_id),
            &EventPayload::GoalRequested(GoalRequestedPayload {
                context: context.to_string(),
                decision: GateDecision::Run.as_str().to_string(),
            }),
        )
        .await;
        self.audit(
            commit,
            Some(&execution_id),
            &EventPayload::ExecutionStarted(ExecutionStartedPayload {
                execution_id: execution_id.clone(),
                context: context.to_string(),
                log_url: created.url.clone(),
            }),
        )
        .await;

        info!(
            sha = %commit.sha,
            context = %context,
            goal = %goal.name,
            executor = executor.name(),
            execution_id = %execution_id,
            "executing goal"
        );

        let ctx = GoalContext {
            commit: commit.clone(),
            goal,
            snapshot,
            log: Arc::clone(&created.log),
            execution_id: execution_id.clone(),
        };
        ctx.progress(format!("Executing goal '{}' on {}", ctx.goal.name, commit));

        let started = Instant::now();
        let result = match AssertUnwindSafe(executor.execute(&ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(GoalError::Panicked(panic_message(panic.as_ref()))),
        };

        let report = match result {
            Ok(result) if result.is_success() => self.succeeded(&ctx, result).await,
            Ok(result) if result.require_approval && result.code == 0 => {
                self.awaiting_approval(&ctx, result).await
            }
            Ok(result) => {
                let message = result
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("exit code {}", result.code));
                self.failed(&ctx, executor.as_ref(), &message, false).await
            }
            Err(e) => {
                let fatal = e.is_tooling_unavailable();
                self.failed(&ctx, executor.as_ref(), &e.to_string(), fatal).await
            }
        };

        if let Err(e) = ctx.log.close() {
            warn!(execution_id = %execution_id, error = %e, "failed to close progress log");
        }

        let message = report
            .diagnosis
            .as_ref()
            .map(|d| d.message.clone())
            .or_else(|| report.reported.description.clone());
        if let Err(e) = self
            .storage
            .finish_execution(
                &execution_id,
                report.state,
                report.reported.target_url.as_deref(),
                message.as_deref(),
            )
            .await
        {
            error!(execution_id = %execution_id, error = %e, "failed to record execution result");
        }
        self.audit(
            commit,
            Some(&execution_id),
            &EventPayload::ExecutionFinished(ExecutionFinishedPayload {
                execution_id: execution_id.clone(),
                state: report.state,
                reported: report.reported.state,
                duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                diagnosis: report.diagnosis.as_ref().map(|d| d.message.clone()),
            }),
        )
        .await;

        AttemptOutcome::Finished(report)
    }

    async fn succeeded(&self, ctx: &GoalContext, result: ExecuteGoalResult) -> AttemptReport {
        ctx.progress(format!("Goal '{}' succeeded", ctx.goal.name));
        let mut entry = StatusEntry::new(&ctx.goal.context, StatusState::Success)
            .with_description(&ctx.goal.success_description);
        entry.target_url = result.target_url.or_else(|| ctx.log.url());

        let reported_ok = self.report(ctx, &entry).await;
        info!(
            sha = %ctx.commit.sha,
            context = %ctx.goal.context,
            "goal succeeded"
        );
        AttemptReport {
            execution_id: ctx.execution_id.clone(),
            state: ExecutionState::Succeeded,
            reported: entry,
            reported_ok,
            diagnosis: None,
        }
    }

    async fn awaiting_approval(&self, ctx: &GoalContext, result: ExecuteGoalResult) -> AttemptReport {
        ctx.progress(format!("Goal '{}' requires approval", ctx.goal.name));
        let mut entry = StatusEntry::new(&ctx.goal.context, StatusState::WaitingForApproval)
            .with_description(&ctx.goal.waiting_description);
        entry.target_url = result.target_url.clone().or_else(|| ctx.log.url());

        let reported_ok = self.report(ctx, &entry).await;
        self.notify(Notification {
            commit: ctx.commit.clone(),
            context: ctx.goal.context.clone(),
            title: format!("Goal '{}' is waiting for approval", ctx.goal.name),
            body: result.message.unwrap_or_default(),
            log_url: ctx.log.url(),
            retry: None,
        })
        .await;
        info!(
            sha = %ctx.commit.sha,
            context = %ctx.goal.context,
            "goal awaiting approval"
        );
        AttemptReport {
            execution_id: ctx.execution_id.clone(),
            state: ExecutionState::AwaitingApproval,
            reported: entry,
            reported_ok,
            diagnosis: None,
        }
    }

    async fn failed(
        &self,
        ctx: &GoalContext,
        executor: &dyn GoalExecutor,
        message: &str,
        fatal: bool,
    ) -> AttemptReport {
        ctx.progress(format!("ERROR: {message}"));
        if fatal {
            error!(
                sha = %ctx.commit.sha,
                context = %ctx.goal.context,
                error = %message,
                "required tooling unavailable"
            );
        } else {
            warn!(
                sha = %ctx.commit.sha,
                context = %ctx.goal.context,
                error = %message,
                "goal failed"
            );
        }

        let full_log = ctx.log.log().unwrap_or_default();
        let diagnosis = executor.interpreter().interpret(&full_log);
        let log_url = ctx.log.url();

        let state = if fatal {
            StatusState::Error
        } else {
            StatusState::Failure
        };
        let mut entry =
            StatusEntry::new(&ctx.goal.context, state).with_description(&ctx.goal.failure_description);
        entry.target_url.clone_from(&log_url);
        let reported_ok = self.report(ctx, &entry).await;

        let body = match &diagnosis {
            Some(d) => {
                let mut body = format!("{}\n```\n{}\n```", d.message, d.relevant_part);
                if d.include_full_log {
                    if let Some(url) = &log_url {
                        body.push_str(&format!("\nFull log: {url}"));
                    }
                }
                body
            }
            None => format!("{message}\nNo specific diagnosis; see the full log."),
        };
        let retry = (self.retry_enabled && !fatal).then(|| RetryAction {
            commit: ctx.commit.clone(),
            context: ctx.goal.context.clone(),
        });
        self.notify(Notification {
            commit: ctx.commit.clone(),
            context: ctx.goal.context.clone(),
            title: format!(":x: Failure: {} on {}", ctx.goal.name, ctx.commit),
            body,
            log_url,
            retry,
        })
        .await;

        AttemptReport {
            execution_id: ctx.execution_id.clone(),
            state: ExecutionState::Failed,
            reported: entry,
            reported_ok,
            diagnosis,
        }
    }

    async fn report(&self, ctx: &GoalContext, entry: &StatusEntry) -> bool {
        match self.reporter.set_status(&ctx.commit, entry).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    sha = %ctx.commit.sha,
                    context = %entry.context,
                    state = %entry.state,
                    error = %e,
                    "failed to report goal status"
                );
                false
            }
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.send(&notification).await {
            warn!(
                sha = %notification.commit.sha,
                context = %notification.context,
                error = %e,
                "failed to send notification"
            );
        }
    }

    async fn audit(&self, commit: &CommitRef, execution_id: Option<&Id>, payload: &EventPayload) {
        if let Err(e) = self
            .storage
            .append_event(Some(&commit.sha), execution_id, payload)
            .await
        {
            warn!(sha = %commit.sha, error = %e, "failed to append event");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
