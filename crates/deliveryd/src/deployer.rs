//! Deployers and the deploy goal.
//!
//! [`LocalProcessDeployer`] runs the application as a supervised child
//! process on this machine. A deploy for a key that is already running
//! terminates the old process before the new one is recorded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use delivery_core::command::{self, CommandLine, StartupInfo};
use delivery_core::events::{DeploymentStartedPayload, DeploymentTerminatedPayload, EventPayload};
use delivery_core::goals::{ARTIFACT_CONTEXT, ENDPOINT_CONTEXT};
use delivery_core::marker::StartupMarker;
use delivery_core::{
    CommitRef, DeployMode, DeploymentInfo, DeploymentKey, ExecuteGoalResult, StatusEntry,
    StatusState,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::artifact::{ArtifactFetcher, LocalArtifact};
use crate::checkout::{CheckoutError, ProjectCheckout};
use crate::deployments::{ManagedDeployment, ManagedDeploymentRegistry, RegistryError, Termination};
use crate::executor::{GoalContext, GoalError, GoalExecutor};
use crate::progress_log::{ConsoleProgressLog, ProgressLog};
use crate::reporter::StatusReporter;
use crate::storage::Storage;
use crate::supervisor::{self, FailureReason, Outcome, ProcessSpec, SupervisorError};

/// Grace between SIGTERM and SIGKILL when a failed start is cleaned up.
const FAILED_START_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
    #[error("application failed to start: {0}")]
    StartupFailed(FailureReason),
}

pub type Result<T> = std::result::Result<T, DeployError>;

/// Where a deployment goes and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub key: DeploymentKey,
    pub commit: CommitRef,
}

impl DeployTarget {
    pub fn for_commit(commit: &CommitRef) -> Self {
        Self {
            key: commit.deployment_key(),
            commit: commit.clone(),
        }
    }
}

/// Platform-specific deployment backend.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        artifact: &LocalArtifact,
        target: &DeployTarget,
        log: Arc<dyn ProgressLog>,
    ) -> Result<Vec<DeploymentInfo>>;

    async fn find_deployments(&self, key: &DeploymentKey) -> Vec<DeploymentInfo>;

    /// Returns whether anything was running.
    async fn undeploy(&self, key: &DeploymentKey) -> bool;
}

#[derive(Debug, Clone)]
pub struct LocalDeployOptions {
    /// Scheme and host the endpoint is published under, e.g. `http://localhost`.
    pub base_url: String,
    pub mode: DeployMode,
    pub marker: StartupMarker,
    /// Zero waits indefinitely for the marker.
    pub startup_timeout: Duration,
    pub team: String,
}

type Launcher = Box<dyn Fn(&StartupInfo, &LocalArtifact) -> CommandLine + Send + Sync>;

pub struct LocalProcessDeployer {
    registry: Arc<ManagedDeploymentRegistry>,
    options: LocalDeployOptions,
    checkout: Arc<dyn ProjectCheckout>,
    storage: Option<Arc<Storage>>,
    launcher: Option<Launcher>,
}

impl std::fmt::Debug for LocalProcessDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessDeployer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LocalProcessDeployer {
    pub fn new(
        registry: Arc<ManagedDeploymentRegistry>,
        options: LocalDeployOptions,
        checkout: Arc<dyn ProjectCheckout>,
    ) -> Self {
        Self {
            registry,
            options,
            checkout,
            storage: None,
            launcher: None,
        }
    }

    /// Replace the jar and source startup commands. The process runs in
    /// the artifact's directory.
    pub fn with_launcher(
        mut self,
        launcher: impl Fn(&StartupInfo, &LocalArtifact) -> CommandLine + Send + Sync + 'static,
    ) -> Self {
        self.launcher = Some(Box::new(launcher));
        self
    }

    /// Record deployment lifecycle events in the audit log.
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(&self) -> &Arc<ManagedDeploymentRegistry> {
        &self.registry
    }

    fn endpoint(&self, port: u16, key: &DeploymentKey) -> String {
        format!(
            "{}:{}{}",
            self.options.base_url.trim_end_matches('/'),
            port,
            key.context_root()
        )
    }

    async fn process_spec(
        &self,
        artifact: &LocalArtifact,
        target: &DeployTarget,
        info: &StartupInfo,
    ) -> Result<ProcessSpec> {
        if let Some(launcher) = &self.launcher {
            return Ok(ProcessSpec::new(launcher(info, artifact), &artifact.cwd));
        }
        let cwd = match self.options.mode {
            DeployMode::Jar => artifact.cwd.clone(),
            DeployMode::Source => self.checkout.clone_commit(&target.commit).await?.base_dir,
        };
        Ok(ProcessSpec::new(
            startup_command(self.options.mode, info, artifact),
            cwd,
        ))
    }

    async fn spawn_and_await(
        &self,
        spec: &ProcessSpec,
        log: Arc<dyn ProgressLog>,
    ) -> Result<(supervisor::ProcessHandle, Outcome)> {
        let mut process = supervisor::spawn(spec, log, Some(self.options.marker.clone()))?;
        let outcome = process.outcome_within(self.options.startup_timeout).await;
        if !outcome.is_success() && !process.handle().has_exited() {
            process.shutdown(FAILED_START_GRACE).await;
        }
        Ok((process.handle().clone(), outcome))
    }

    fn watch_exit(&self, deployment: &ManagedDeployment) {
        let registry = Arc::clone(&self.registry);
        let storage = self.storage.clone();
        let handle = deployment.handle.clone();
        let key = deployment.key.clone();
        let pid = deployment.pid();

        tokio::spawn(async move {
            let exit = handle.exited().await;
            if registry.remove_if_same(&key, pid) {
                warn!(key = %key, pid = ?pid, code = ?exit.and_then(|e| e.code), "deployment exited on its own");
                if let Some(storage) = storage {
                    audit(&storage, Termination { key, pid, exited: true }).await;
                }
            }
        });
    }

    async fn audit_termination(&self, termination: Termination) {
        if let Some(storage) = &self.storage {
            audit(storage, termination).await;
        }
    }
}

async fn audit(storage: &Storage, termination: Termination) {
    let payload = EventPayload::DeploymentTerminated(DeploymentTerminatedPayload {
        key: termination.key,
        pid: termination.pid,
        exited: termination.exited,
    });
    if let Err(e) = storage.append_event(None, None, &payload).await {
        warn!(error = %e, "failed to append deployment event");
    }
}

#[async_trait]
impl Deployer for LocalProcessDeployer {
    async fn deploy(
        &self,
        artifact: &LocalArtifact,
        target: &DeployTarget,
        log: Arc<dyn ProgressLog>,
    ) -> Result<Vec<DeploymentInfo>> {
        let key = &target.key;
        let _guard = self.registry.lock_key(key).await;

        let port = self.registry.find_or_allocate_port(key)?;
        if let Some(previous) = self.registry.terminate_if_running(key).await {
            let _ = log.write(&format!("Stopped previous deployment (pid {:?})\n", previous.pid));
            self.audit_termination(previous).await;
        }

        let info = StartupInfo {
            port,
            context_root: key.context_root(),
            team: self.options.team.clone(),
        };
        let spec = self.process_spec(artifact, target, &info).await?;
        let _ = log.write(&format!("Starting {}\n", spec.command.display()));

        let (handle, outcome) = self.spawn_and_await(&spec, log).await?;
        let hit = match outcome {
            Outcome::Success(hit) => hit,
            Outcome::Failure(reason) => {
                warn!(key = %key, port, reason = %reason, "deployment failed to start");
                return Err(DeployError::StartupFailed(reason));
            }
        };
        if let Some(reported) = hit.and_then(|h| h.port) {
            if reported != port {
                warn!(key = %key, allocated = port, reported, "application reported a different port");
            }
        }

        let deployment = ManagedDeployment {
            key: key.clone(),
            port,
            endpoint: self.endpoint(port, key),
            handle,
            started_at: Utc::now(),
        };
        self.registry.record(deployment.clone());
        self.watch_exit(&deployment);
        deployment
            .handle
            .redirect_output(Arc::new(ConsoleProgressLog::new(key.to_string())));

        if let Some(storage) = &self.storage {
            let payload = EventPayload::DeploymentStarted(DeploymentStartedPayload {
                key: key.clone(),
                port,
                pid: deployment.pid(),
                endpoint: deployment.endpoint.clone(),
            });
            if let Err(e) = storage
                .append_event(Some(&target.commit.sha), None, &payload)
                .await
            {
                warn!(error = %e, "failed to append deployment event");
            }
        }

        info!(key = %key, endpoint = %deployment.endpoint, pid = ?deployment.pid(), "deployment started");
        Ok(vec![deployment.info()])
    }

    async fn find_deployments(&self, key: &DeploymentKey) -> Vec<DeploymentInfo> {
        self.registry.get(key).map(|d| d.info()).into_iter().collect()
    }

    async fn undeploy(&self, key: &DeploymentKey) -> bool {
        let _guard = self.registry.lock_key(key).await;
        match self.registry.terminate_if_running(key).await {
            Some(termination) => {
                self.audit_termination(termination).await;
                true
            }
            None => false,
        }
    }
}

/// Deploy the linked artifact, then publish the endpoint.
pub struct DeployGoalExecutor {
    deployer: Arc<dyn Deployer>,
    fetcher: Arc<dyn ArtifactFetcher>,
    reporter: Arc<dyn StatusReporter>,
}

impl std::fmt::Debug for DeployGoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployGoalExecutor").finish_non_exhaustive()
    }
}

impl DeployGoalExecutor {
    pub fn new(
        deployer: Arc<dyn Deployer>,
        fetcher: Arc<dyn ArtifactFetcher>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            deployer,
            fetcher,
            reporter,
        }
    }
}

#[async_trait]
impl GoalExecutor for DeployGoalExecutor {
    fn name(&self) -> &'static str {
        "deploy"
    }

    async fn execute(&self, ctx: &GoalContext) -> std::result::Result<ExecuteGoalResult, GoalError> {
        let Some(url) = ctx.sibling_target_url(ARTIFACT_CONTEXT) else {
            return Ok(ExecuteGoalResult::failure(1, "no artifact linked for this commit"));
        };
        let artifact = self.fetcher.checkout(&url).await?;
        ctx.progress(format!("Deploying {}", artifact.path().display()));

        let target = DeployTarget::for_commit(&ctx.commit);
        let deployments = self
            .deployer
            .deploy(&artifact, &target, Arc::clone(&ctx.log))
            .await?;
        let Some(endpoint) = deployments.first().map(|d| d.endpoint.clone()) else {
            return Ok(ExecuteGoalResult::failure(1, "deployer returned no deployment"));
        };
        ctx.progress(format!("Deployed to {endpoint}"));

        let entry = StatusEntry::new(ENDPOINT_CONTEXT, StatusState::Success)
            .with_target_url(&endpoint)
            .with_description("Endpoint available");
        if let Err(e) = self.reporter.set_status(&ctx.commit, &entry).await {
            error!(sha = %ctx.commit.sha, error = %e, "failed to report endpoint");
        }

        Ok(ExecuteGoalResult::success().with_target_url(endpoint))
    }
}

/// Command that starts the application in `mode`.
pub fn startup_command(mode: DeployMode, info: &StartupInfo, artifact: &LocalArtifact) -> CommandLine {
    match mode {
        DeployMode::Jar => command::executable_jar(info, &artifact.path()),
        DeployMode::Source => command::spring_boot_run(info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::LocalProject;
    use crate::progress_log::InMemoryProgressLog;
    use tempfile::TempDir;

    struct NoCheckout;

    #[async_trait]
    impl ProjectCheckout for NoCheckout {
        async fn clone_commit(&self, _commit: &CommitRef) -> crate::checkout::Result<LocalProject> {
            Err(CheckoutError::GitUnavailable)
        }
    }

    fn deployer(startup_timeout: Duration) -> LocalProcessDeployer {
        LocalProcessDeployer::new(
            Arc::new(ManagedDeploymentRegistry::new(9100, Duration::from_secs(5))),
            LocalDeployOptions {
                base_url: "http://localhost".to_string(),
                mode: DeployMode::Jar,
                marker: StartupMarker::tomcat(),
                startup_timeout,
                team: "T1".to_string(),
            },
            Arc::new(NoCheckout),
        )
    }

    /// Prints the Tomcat banner for the allocated port, then runs `tail`.
    fn script(deployer: LocalProcessDeployer, tail: &'static str) -> LocalProcessDeployer {
        deployer.with_launcher(move |info, _| {
            CommandLine::shell(&format!(
                "echo 'Tomcat started on port(s): {} (http)'; {tail}",
                info.port
            ))
        })
    }

    fn target() -> DeployTarget {
        DeployTarget::for_commit(&CommitRef::new("acme", "shop", "abc123", "master"))
    }

    fn artifact(dir: &TempDir) -> LocalArtifact {
        LocalArtifact {
            cwd: dir.path().to_path_buf(),
            filename: "app.jar".to_string(),
        }
    }

    fn log() -> Arc<dyn ProgressLog> {
        Arc::new(InMemoryProgressLog::new())
    }

    #[test]
    fn startup_command_follows_mode() {
        let info = StartupInfo {
            port: 9100,
            context_root: "/acme/shop/master".to_string(),
            team: "T1".to_string(),
        };
        let dir = TempDir::new().unwrap();
        assert_eq!(startup_command(DeployMode::Source, &info, &artifact(&dir)).program, "mvn");
        let jar = startup_command(DeployMode::Jar, &info, &artifact(&dir));
        assert_eq!(jar.program, "java");
        assert_eq!(jar.args.last().unwrap(), &dir.path().join("app.jar").display().to_string());
    }

    #[tokio::test]
    async fn source_mode_needs_a_checkout() {
        let dir = TempDir::new().unwrap();
        let mut options = deployer(Duration::from_secs(1)).options;
        options.mode = DeployMode::Source;
        let deployer = LocalProcessDeployer::new(
            Arc::new(ManagedDeploymentRegistry::new(9100, Duration::from_secs(1))),
            options,
            Arc::new(NoCheckout),
        );
        let err = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap_err();
        assert!(matches!(err, DeployError::Checkout(CheckoutError::GitUnavailable)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn marker_records_deployment_at_context_root() {
        let dir = TempDir::new().unwrap();
        let deployer = script(deployer(Duration::from_secs(10)), "sleep 30");

        let infos = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].port, 9100);
        assert_eq!(infos[0].endpoint, "http://localhost:9100/acme/shop/master");
        assert_eq!(deployer.find_deployments(&target().key).await, infos);

        assert!(deployer.undeploy(&target().key).await);
        assert!(deployer.find_deployments(&target().key).await.is_empty());
        assert!(!deployer.undeploy(&target().key).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn redeploy_terminates_previous_process_first() {
        let dir = TempDir::new().unwrap();
        let deployer = script(deployer(Duration::from_secs(10)), "sleep 30");

        let first = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap();
        let first_handle = deployer.registry().get(&target().key).unwrap().handle;
        let second = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap();

        assert!(first_handle.has_exited());
        assert_eq!(first[0].port, second[0].port);
        assert_ne!(first[0].pid, second[0].pid);
        assert_eq!(deployer.registry().list().len(), 1);
        deployer.undeploy(&target().key).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_marker_times_out() {
        let dir = TempDir::new().unwrap();
        let deployer = deployer(Duration::from_millis(300))
            .with_launcher(|_, _| CommandLine::shell("echo starting; sleep 30"));

        let err = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap_err();
        assert!(matches!(err, DeployError::StartupFailed(FailureReason::TimedOut)));
        assert!(deployer.find_deployments(&target().key).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_marker_is_ambiguous() {
        let dir = TempDir::new().unwrap();
        let deployer =
            deployer(Duration::from_secs(10)).with_launcher(|_, _| CommandLine::shell("echo done"));

        let err = deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::StartupFailed(FailureReason::AmbiguousCompletion)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_deployment_is_cleared() {
        let dir = TempDir::new().unwrap();
        let deployer = script(deployer(Duration::from_secs(10)), "sleep 0.2");

        deployer.deploy(&artifact(&dir), &target(), log()).await.unwrap();
        for _ in 0..100 {
            if deployer.find_deployments(&target().key).await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("exited deployment was never cleared");
    }
}
