//! deliveryd - continuous delivery daemon
//!
//! Runs the goals of a delivery pipeline for every pushed commit: builds,
//! publishes artifacts, deploys them as local processes and verifies the
//! resulting endpoints. Library components for the daemon process.

pub mod artifact;
pub mod build;
pub mod checkout;
pub mod command_goal;
pub mod dedup;
pub mod deployer;
pub mod deployments;
pub mod dispatch;
pub mod executor;
pub mod progress_log;
pub mod reporter;
pub mod review;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod verifier;

use std::path::PathBuf;
use std::sync::Arc;

use delivery_core::command::CommandLine;
use delivery_core::goals::{
    ARTIFACT_CONTEXT, BUILD_CONTEXT, DEPLOY_CONTEXT, ENDPOINT_CONTEXT, PROMOTE_CONTEXT,
    REVIEW_CONTEXT, SCAN_CONTEXT, VERIFY_CONTEXT,
};
use delivery_core::marker::StartupMarker;
use delivery_core::{Config, Pipeline};
use eyre::WrapErr;
use tracing::{debug, error, info, warn};

use artifact::{ArtifactStore, LocalArtifactFetcher};
use build::{BuildGoalExecutor, BuilderSelector, LinkArtifactGoalExecutor};
use checkout::{GitProjectCheckout, ProjectCheckout};
use command_goal::CommandGoalExecutor;
use dedup::Deduplicator;
use deployer::{DeployGoalExecutor, Deployer, LocalDeployOptions, LocalProcessDeployer};
use deployments::ManagedDeploymentRegistry;
use dispatch::Dispatcher;
use executor::{GoalExecutionRunner, GoalExecutor};
use progress_log::LogFactory;
use reporter::{
    FanoutNotifier, LogNotifier, Notifier, StatusBoard, StatusReporter, StatusSource,
    TimeoutReporter, WebhookNotifier,
};
use review::ReviewGoalExecutor;
use server::AppState;
use storage::Storage;
use verifier::{HttpEndpointVerifier, VerifyGoalExecutor};

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7800).
    pub port: u16,
    /// Bearer token required by the HTTP API, if set.
    pub auth_token: Option<String>,
    /// Pipeline and collaborator settings.
    pub settings: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7800,
            auth_token: std::env::var("DELIVERYD_AUTH_TOKEN").ok(),
            settings: Config::default(),
        }
    }
}

/// Get the default database path (~/.local/share/deliveryd/deliveryd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("deliveryd").join("deliveryd.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    deployer: Arc<LocalProcessDeployer>,
    state: Arc<AppState>,
}

impl Daemon {
    /// Open storage and wire every collaborator for the configured pipeline.
    pub async fn new(config: DaemonConfig) -> eyre::Result<Self> {
        let settings = &config.settings;
        let pipeline = Arc::new(
            Pipeline::template(&settings.pipeline).wrap_err("invalid pipeline setting")?,
        );

        let storage = Storage::new(&config.db_path)
            .await
            .wrap_err_with(|| format!("failed to open {}", config.db_path.display()))?;
        storage
            .migrate_embedded()
            .await
            .wrap_err("failed to migrate database")?;
        let storage = Arc::new(storage);

        let board = Arc::new(StatusBoard::new(Arc::clone(&storage)));
        let reporter: Arc<dyn StatusReporter> = Arc::new(TimeoutReporter::new(
            Arc::clone(&board) as Arc<dyn StatusReporter>,
            settings.status_timeout(),
        ));
        let source: Arc<dyn StatusSource> = board;
        let notifier = build_notifier(settings)?;

        let runner = Arc::new(GoalExecutionRunner::new(
            Arc::clone(&pipeline),
            Arc::new(Deduplicator::new()),
            Arc::clone(&source),
            Arc::clone(&reporter),
            notifier,
            LogFactory::new(&settings.log_dir, &settings.log_base_url),
            Arc::clone(&storage),
            settings.retry_enabled,
        ));

        let checkout: Arc<dyn ProjectCheckout> = Arc::new(GitProjectCheckout::new(
            &settings.checkout_dir,
            &settings.clone_url_template,
        ));
        let marker = StartupMarker::new(&settings.startup_marker)
            .wrap_err("invalid startup_marker pattern")?;
        let registry = Arc::new(ManagedDeploymentRegistry::new(
            settings.lower_port,
            settings.terminate_timeout(),
        ));
        let deployer = Arc::new(
            LocalProcessDeployer::new(
                Arc::clone(&registry),
                LocalDeployOptions {
                    base_url: settings.base_url.clone(),
                    mode: settings.deploy_mode,
                    marker,
                    startup_timeout: settings.deploy_startup_timeout(),
                    team: settings.team.clone(),
                },
                Arc::clone(&checkout),
            )
            .with_storage(Arc::clone(&storage)),
        );

        let mut dispatcher = Dispatcher::new(
            runner,
            Arc::clone(&reporter),
            Arc::clone(&source),
            Arc::clone(&storage),
            settings.loopback_events,
        );
        let collaborators = Collaborators {
            checkout,
            deployer: Arc::clone(&deployer) as Arc<dyn Deployer>,
            reporter,
        };
        for goal in pipeline.goals() {
            match goal_executor(&goal.context, settings, &collaborators) {
                Some(executor) => dispatcher
                    .register(&goal.context, executor)
                    .wrap_err_with(|| format!("failed to register {}", goal.context))?,
                None => debug!(context = %goal.context, "goal has no executor"),
            }
        }
        let dispatcher = Arc::new(dispatcher);

        let state = Arc::new(AppState {
            dispatcher: Arc::clone(&dispatcher),
            storage: Arc::clone(&storage),
            source,
            deployer: Arc::clone(&deployer) as Arc<dyn Deployer>,
            registry,
            auth_token: config.auth_token.clone(),
        });

        Ok(Self {
            config,
            storage,
            dispatcher,
            deployer,
            state,
        })
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Get a reference to the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve the HTTP API until the process is asked to stop.
    pub async fn run(&self) -> eyre::Result<()> {
        info!("deliveryd starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!(
            "pipeline: {} ({} goal executors)",
            self.dispatcher.pipeline().name,
            self.dispatcher.registrations().len()
        );
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        server::start_server(Arc::clone(&self.state), self.config.port)
            .await
            .map_err(|e| eyre::eyre!("HTTP server error: {e}"))
    }

    /// Stop every managed deployment.
    pub async fn shutdown(&self) {
        let terminated = self.deployer.registry().terminate_all().await;
        for termination in terminated.iter().filter(|t| !t.exited) {
            warn!(key = %termination.key, pid = ?termination.pid, "deployment did not exit in time");
        }
        info!(count = terminated.len(), "shutdown complete");
    }
}

/// Shared by the executors built for one pipeline.
struct Collaborators {
    checkout: Arc<dyn ProjectCheckout>,
    deployer: Arc<dyn Deployer>,
    reporter: Arc<dyn StatusReporter>,
}

/// The executor that handles a goal, or `None` for goals reported by
/// another goal (the endpoint is published by the deploy goal).
fn goal_executor(
    context: &str,
    settings: &Config,
    with: &Collaborators,
) -> Option<Arc<dyn GoalExecutor>> {
    let checkout = || Arc::clone(&with.checkout);
    let executor: Arc<dyn GoalExecutor> = match context {
        SCAN_CONTEXT => Arc::new(CommandGoalExecutor::shell(
            "scan",
            checkout(),
            &settings.scan_cmds,
            settings.build_timeout(),
        )),
        REVIEW_CONTEXT => Arc::new(ReviewGoalExecutor::new(
            checkout(),
            settings
                .review_cmds
                .iter()
                .map(|c| CommandLine::shell(c))
                .collect(),
            settings.build_timeout(),
        )),
        BUILD_CONTEXT => Arc::new(BuildGoalExecutor::new(
            checkout(),
            BuilderSelector::standard(),
            settings.build_timeout(),
        )),
        ARTIFACT_CONTEXT => Arc::new(LinkArtifactGoalExecutor::new(ArtifactStore::new(
            &settings.artifact_dir,
        ))),
        DEPLOY_CONTEXT => Arc::new(DeployGoalExecutor::new(
            Arc::clone(&with.deployer),
            Arc::new(LocalArtifactFetcher::new(settings.artifact_dir.join("downloads"))),
            Arc::clone(&with.reporter),
        )),
        VERIFY_CONTEXT => Arc::new(VerifyGoalExecutor::new(Arc::new(HttpEndpointVerifier::new(
            settings.verify_retries,
            settings.verify_interval(),
            settings.status_timeout(),
        )))),
        PROMOTE_CONTEXT => Arc::new(CommandGoalExecutor::shell(
            "promote",
            checkout(),
            settings.promote_cmd.as_slice(),
            settings.build_timeout(),
        )),
        ENDPOINT_CONTEXT => return None,
        other => {
            error!(context = %other, "no executor known for goal");
            return None;
        }
    };
    Some(executor)
}

/// Log notifications always; also POST them when a webhook is configured.
fn build_notifier(settings: &Config) -> eyre::Result<Arc<dyn Notifier>> {
    let log: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let Some(url) = &settings.notify_webhook else {
        return Ok(log);
    };
    let webhook = WebhookNotifier::new(url, settings.status_timeout())
        .wrap_err("failed to create webhook notifier")?;
    Ok(Arc::new(FanoutNotifier::new(vec![log, Arc::new(webhook)])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, pipeline: &str) -> Config {
        Config {
            pipeline: pipeline.to_string(),
            log_dir: dir.path().join("logs"),
            checkout_dir: dir.path().join("checkouts"),
            artifact_dir: dir.path().join("artifacts"),
            ..Config::default()
        }
    }

    fn daemon_config(dir: &TempDir, settings: Config) -> DaemonConfig {
        DaemonConfig {
            db_path: dir.path().join("deliveryd.db"),
            port: 0,
            auth_token: None,
            settings,
        }
    }

    #[tokio::test]
    async fn every_goal_except_endpoint_gets_an_executor() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new(daemon_config(&dir, settings(&dir, "http_service")))
            .await
            .unwrap();

        let contexts: Vec<&str> = daemon
            .dispatcher()
            .registrations()
            .iter()
            .map(|r| r.context.as_str())
            .collect();
        assert_eq!(
            contexts,
            vec![
                SCAN_CONTEXT,
                BUILD_CONTEXT,
                ARTIFACT_CONTEXT,
                DEPLOY_CONTEXT,
                VERIFY_CONTEXT,
                PROMOTE_CONTEXT
            ]
        );
    }

    #[tokio::test]
    async fn unknown_pipeline_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = Daemon::new(daemon_config(&dir, settings(&dir, "mainframe")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid pipeline setting"));
    }

    #[tokio::test]
    async fn bad_startup_marker_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir, "library");
        settings.startup_marker = "started (".to_string();
        let err = Daemon::new(daemon_config(&dir, settings)).await.unwrap_err();
        assert!(err.to_string().contains("startup_marker"));
    }

    #[tokio::test]
    async fn webhook_setting_adds_a_notifier() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir, "library");
        assert!(build_notifier(&settings).is_ok());
        settings.notify_webhook = Some("http://127.0.0.1:9/hook".to_string());
        assert!(build_notifier(&settings).is_ok());
    }
}
