//! Code review goal.
//!
//! Reviewers are commands run in the checked-out project. Every non-blank
//! line a reviewer prints is one review comment. Any comment puts the goal
//! in `AwaitingApproval`; a reviewer that cannot run is reported in the log
//! and skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::command::CommandLine;
use delivery_core::interpret::InterpreterChain;
use delivery_core::ExecuteGoalResult;
use tracing::{info, warn};

use crate::checkout::ProjectCheckout;
use crate::executor::{GoalContext, GoalError, GoalExecutor};
use crate::progress_log::{InMemoryProgressLog, MultiProgressLog, ProgressLog};
use crate::supervisor::{self, Outcome, ProcessSpec};

pub struct ReviewGoalExecutor {
    checkout: Arc<dyn ProjectCheckout>,
    reviewers: Vec<CommandLine>,
    timeout: Duration,
}

impl std::fmt::Debug for ReviewGoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewGoalExecutor")
            .field("reviewers", &self.reviewers)
            .finish_non_exhaustive()
    }
}

impl ReviewGoalExecutor {
    pub fn new(checkout: Arc<dyn ProjectCheckout>, reviewers: Vec<CommandLine>, timeout: Duration) -> Self {
        Self {
            checkout,
            reviewers,
            timeout,
        }
    }

    /// Comments from one reviewer, or `None` if it could not run.
    async fn review(&self, ctx: &GoalContext, reviewer: &CommandLine, cwd: &std::path::Path) -> Option<Vec<String>> {
        let captured = Arc::new(InMemoryProgressLog::new());
        let log: Arc<dyn ProgressLog> = Arc::new(MultiProgressLog::new(vec![
            Arc::clone(&ctx.log),
            Arc::clone(&captured) as Arc<dyn ProgressLog>,
        ]));

        let spec = ProcessSpec::new(reviewer.clone(), cwd);
        match supervisor::run(&spec, log, self.timeout).await {
            Ok(Outcome::Success(_)) => Some(
                captured
                    .contents()
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Ok(Outcome::Failure(reason)) => {
                ctx.progress(format!("Reviewer '{}' failed: {reason}", reviewer.display()));
                warn!(sha = %ctx.commit.sha, reviewer = %reviewer.display(), reason = %reason, "reviewer failed");
                None
            }
            Err(e) => {
                ctx.progress(format!("Reviewer '{}' could not run: {e}", reviewer.display()));
                warn!(sha = %ctx.commit.sha, reviewer = %reviewer.display(), error = %e, "reviewer could not run");
                None
            }
        }
    }
}

#[async_trait]
impl GoalExecutor for ReviewGoalExecutor {
    fn name(&self) -> &'static str {
        "review"
    }

    async fn execute(&self, ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
        let project = self.checkout.clone_commit(&ctx.commit).await?;

        let mut comments = Vec::new();
        for reviewer in &self.reviewers {
            ctx.progress(format!("Running reviewer: {}", reviewer.display()));
            if let Some(found) = self.review(ctx, reviewer, &project.base_dir).await {
                comments.extend(found);
            }
        }

        if comments.is_empty() {
            return Ok(ExecuteGoalResult::success());
        }
        info!(sha = %ctx.commit.sha, comments = comments.len(), "review produced comments");
        let listing: Vec<String> = comments.iter().map(|c| format!("- {c}")).collect();
        Ok(ExecuteGoalResult::awaiting_approval(format!(
            "{} review comment(s):\n{}",
            comments.len(),
            listing.join("\n")
        )))
    }

    fn interpreter(&self) -> InterpreterChain {
        InterpreterChain::empty()
    }
}
