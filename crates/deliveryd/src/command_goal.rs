//! Goals that run configured shell commands in the project, such as scans
//! and promotion.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::command::CommandLine;
use delivery_core::ExecuteGoalResult;

use crate::checkout::ProjectCheckout;
use crate::executor::{GoalContext, GoalError, GoalExecutor};
use crate::supervisor::{self, Outcome, ProcessSpec};

/// Runs commands in order; the first failure fails the goal.
pub struct CommandGoalExecutor {
    name: &'static str,
    checkout: Arc<dyn ProjectCheckout>,
    commands: Vec<CommandLine>,
    timeout: Duration,
}

impl std::fmt::Debug for CommandGoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGoalExecutor")
            .field("name", &self.name)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl CommandGoalExecutor {
    pub fn new(
        name: &'static str,
        checkout: Arc<dyn ProjectCheckout>,
        commands: Vec<CommandLine>,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            checkout,
            commands,
            timeout,
        }
    }

    /// One `sh -c` command per configured string.
    pub fn shell(
        name: &'static str,
        checkout: Arc<dyn ProjectCheckout>,
        commands: &[String],
        timeout: Duration,
    ) -> Self {
        let commands = commands.iter().map(|c| CommandLine::shell(c)).collect();
        Self::new(name, checkout, commands, timeout)
    }
}

#[async_trait]
impl GoalExecutor for CommandGoalExecutor {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
        if self.commands.is_empty() {
            ctx.progress("Nothing to run");
            return Ok(ExecuteGoalResult::success());
        }

        let project = self.checkout.clone_commit(&ctx.commit).await?;
        for command in &self.commands {
            ctx.progress(format!("$ {}", command.display()));
            let spec = ProcessSpec::new(command.clone(), &project.base_dir);
            if let Outcome::Failure(reason) = supervisor::run(&spec, Arc::clone(&ctx.log), self.timeout).await? {
                return Ok(ExecuteGoalResult::failure(1, format!("{}: {reason}", command.display())));
            }
        }
        Ok(ExecuteGoalResult::success())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::checkout::testing::FixedCheckout;
    use crate::executor::testing::{commit, fixture};
    use crate::executor::AttemptOutcome;
    use delivery_core::goals::SCAN_CONTEXT;
    use delivery_core::{ExecutionState, Pipeline, StatusState};
    use tempfile::TempDir;

    fn scan(dir: &TempDir, commands: &[&str]) -> Arc<CommandGoalExecutor> {
        let commands: Vec<String> = commands.iter().map(ToString::to_string).collect();
        Arc::new(CommandGoalExecutor::shell(
            "scan",
            Arc::new(FixedCheckout(dir.path().to_path_buf())),
            &commands,
            Duration::from_secs(10),
        ))
    }

    #[tokio::test]
    async fn commands_run_in_project_directory() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(Pipeline::library()).await;
        let executor = scan(&dir, &["touch scanned", "test -f scanned"]);

        let AttemptOutcome::Finished(report) = fixture.runner.run(&commit(), SCAN_CONTEXT, executor).await
        else {
            panic!("expected finished attempt");
        };
        assert_eq!(report.state, ExecutionState::Succeeded);
        assert!(dir.path().join("scanned").is_file());
    }

    #[tokio::test]
    async fn first_failure_stops_the_goal() {
        let dir = TempDir::new().unwrap();
        let fixture = fixture(Pipeline::library()).await;
        let executor = scan(&dir, &["echo 'secret found in config'; exit 4", "touch never"]);

        let AttemptOutcome::Finished(report) = fixture.runner.run(&commit(), SCAN_CONTEXT, executor).await
        else {
            panic!("expected finished attempt");
        };
        assert_eq!(report.reported.state, StatusState::Failure);
        assert!(!dir.path().join("never").exists());

        let execution = fixture.storage.get_execution(&report.execution_id).await.unwrap();
        let log = std::fs::read_to_string(execution.log_path.unwrap()).unwrap();
        assert!(log.contains("secret found in config"));
        assert!(log.contains("ERROR: sh -c"));
    }
}
