//! Integration tests for the HTTP API.
//!
//! Drives whole pipelines through inbound events, checks that redelivered
//! events run a goal exactly once, and deploys a local process end to end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use delivery_core::command::CommandLine;
use delivery_core::goals::{
    ARTIFACT_CONTEXT, BUILD_CONTEXT, DEPLOY_CONTEXT, ENDPOINT_CONTEXT, SCAN_CONTEXT,
    VERIFY_CONTEXT,
};
use delivery_core::marker::StartupMarker;
use delivery_core::{
    CommitRef, DeployMode, ExecuteGoalResult, Pipeline, StatusEntry, StatusState,
};
use deliveryd::artifact::{file_url, ArtifactStore, LocalArtifactFetcher};
use deliveryd::build::LinkArtifactGoalExecutor;
use deliveryd::checkout::{self, LocalProject, ProjectCheckout};
use deliveryd::dedup::Deduplicator;
use deliveryd::deployer::{DeployGoalExecutor, Deployer, LocalDeployOptions, LocalProcessDeployer};
use deliveryd::deployments::ManagedDeploymentRegistry;
use deliveryd::dispatch::Dispatcher;
use deliveryd::executor::{GoalContext, GoalError, GoalExecutionRunner, GoalExecutor};
use deliveryd::progress_log::LogFactory;
use deliveryd::reporter::{LogNotifier, StatusBoard, StatusReporter, StatusSource};
use deliveryd::server::{create_router, AppState};
use deliveryd::storage::Storage;
use deliveryd::verifier::{EndpointVerifier, VerifyGoalExecutor};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    storage: Arc<Storage>,
    registry: Arc<ManagedDeploymentRegistry>,
    dir: TempDir,
}

/// Hands out one directory as the checkout of every commit.
struct DirCheckout(PathBuf);

#[async_trait]
impl ProjectCheckout for DirCheckout {
    async fn clone_commit(&self, _commit: &CommitRef) -> checkout::Result<LocalProject> {
        Ok(LocalProject {
            base_dir: self.0.clone(),
        })
    }
}

/// Counts invocations and blocks until released.
struct GatedGoal {
    calls: AtomicUsize,
    release: Notify,
}

#[async_trait]
impl GoalExecutor for GatedGoal {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn execute(&self, _ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(ExecuteGoalResult::success())
    }
}

/// Writes a jar into the checkout and links it as the build result.
struct FakeBuild(PathBuf);

#[async_trait]
impl GoalExecutor for FakeBuild {
    fn name(&self) -> &'static str {
        "fake-build"
    }

    async fn execute(&self, ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
        let jar = self.0.join("shop-1.0.jar");
        std::fs::write(&jar, b"PK").map_err(|e| GoalError::Failed(e.to_string()))?;
        ctx.progress("BUILD SUCCESS");
        Ok(ExecuteGoalResult::success().with_target_url(file_url(&jar)))
    }
}

struct AlwaysHealthy;

#[async_trait]
impl EndpointVerifier for AlwaysHealthy {
    async fn verify(&self, _url: &str) -> Result<(), String> {
        Ok(())
    }
}

async fn create_test_app(
    pipeline: Pipeline,
    goals: impl FnOnce(&TempDir, Arc<dyn Deployer>, Arc<dyn StatusReporter>) -> Vec<(&'static str, Arc<dyn GoalExecutor>)>,
) -> TestApp {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);
    let board = Arc::new(StatusBoard::new(Arc::clone(&storage)));

    let runner = Arc::new(GoalExecutionRunner::new(
        Arc::new(pipeline),
        Arc::new(Deduplicator::new()),
        Arc::clone(&board) as Arc<dyn StatusSource>,
        Arc::clone(&board) as Arc<dyn StatusReporter>,
        Arc::new(LogNotifier),
        LogFactory::new(dir.path().join("logs"), "http://127.0.0.1:7800"),
        Arc::clone(&storage),
        true,
    ));

    let registry = Arc::new(ManagedDeploymentRegistry::new(28_000, Duration::from_secs(2)));
    let deployer: Arc<dyn Deployer> = Arc::new(
        LocalProcessDeployer::new(
            Arc::clone(&registry),
            LocalDeployOptions {
                base_url: "http://127.0.0.1".to_string(),
                mode: DeployMode::Jar,
                marker: StartupMarker::tomcat(),
                startup_timeout: Duration::from_secs(10),
                team: "test".to_string(),
            },
            Arc::new(DirCheckout(dir.path().to_path_buf())),
        )
        .with_storage(Arc::clone(&storage))
        .with_launcher(|info, _| {
            CommandLine::shell(&format!(
                "echo 'Tomcat started on port(s): {} (http)'; sleep 30",
                info.port
            ))
        }),
    );

    let mut dispatcher = Dispatcher::new(
        runner,
        Arc::clone(&board) as Arc<dyn StatusReporter>,
        Arc::clone(&board) as Arc<dyn StatusSource>,
        Arc::clone(&storage),
        true,
    );
    for (context, executor) in goals(
        &dir,
        Arc::clone(&deployer),
        Arc::clone(&board) as Arc<dyn StatusReporter>,
    ) {
        dispatcher.register(context, executor).unwrap();
    }

    let state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        storage: Arc::clone(&storage),
        source: board,
        deployer,
        registry: Arc::clone(&registry),
        auth_token: None,
    });

    TestApp {
        router: create_router(state),
        storage,
        registry,
        dir,
    }
}

fn commit() -> CommitRef {
    CommitRef::new("acme", "shop", "9f8e7d6c", "master")
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn pending_scan_event() -> Value {
    json!({
        "commit": commit(),
        "status": StatusEntry::new(SCAN_CONTEXT, StatusState::Pending),
    })
}

// --- Exactly-once dispatch ---

#[tokio::test]
async fn redelivered_pending_event_runs_goal_exactly_once() {
    let scan = Arc::new(GatedGoal {
        calls: AtomicUsize::new(0),
        release: Notify::new(),
    });
    let executor = Arc::clone(&scan);
    let app = create_test_app(Pipeline::library(), move |_, _, _| {
        vec![(SCAN_CONTEXT, executor as Arc<dyn GoalExecutor>)]
    })
    .await;

    // First delivery starts the goal and parks inside it.
    let first = tokio::spawn(
        app.router
            .clone()
            .oneshot(post("/statuses?wait=true", &pending_scan_event())),
    );
    while scan.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A redelivery while it runs is suppressed.
    let response = app
        .router
        .clone()
        .oneshot(post("/statuses?wait=true", &pending_scan_event()))
        .await
        .unwrap();
    let summary = body_to_json(response).await;
    assert_eq!(summary["suppressed"], 1);
    assert_eq!(summary["finished"], json!([]));

    scan.release.notify_one();
    let summary = body_to_json(first.await.unwrap().unwrap()).await;
    assert_eq!(summary["finished"][0]["context"], SCAN_CONTEXT);

    // A late redelivery sees the terminal status and does nothing.
    let response = app
        .router
        .clone()
        .oneshot(post("/statuses?wait=true", &pending_scan_event()))
        .await
        .unwrap();
    let summary = body_to_json(response).await;
    assert_eq!(summary["suppressed"], 0);
    assert_eq!(summary["finished"], json!([]));

    assert_eq!(scan.calls.load(Ordering::SeqCst), 1);
    let successes = app
        .storage
        .list_statuses(&commit())
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.context == SCAN_CONTEXT && s.state == StatusState::Success)
        .count();
    assert_eq!(successes, 1);
}

// --- Local deployment ---

#[cfg(unix)]
#[tokio::test]
async fn push_deploys_and_verifies_local_process() {
    let app = create_test_app(Pipeline::local_deployment(), |dir, deployer, reporter| {
        let workdir = dir.path().to_path_buf();
        vec![
            (
                SCAN_CONTEXT,
                Arc::new(deliveryd::command_goal::CommandGoalExecutor::shell(
                    "scan",
                    Arc::new(DirCheckout(workdir.clone())),
                    &["true".to_string()],
                    Duration::from_secs(10),
                )) as Arc<dyn GoalExecutor>,
            ),
            (BUILD_CONTEXT, Arc::new(FakeBuild(workdir.clone()))),
            (
                ARTIFACT_CONTEXT,
                Arc::new(LinkArtifactGoalExecutor::new(ArtifactStore::new(
                    workdir.join("artifacts"),
                ))),
            ),
            (
                DEPLOY_CONTEXT,
                Arc::new(DeployGoalExecutor::new(
                    deployer,
                    Arc::new(LocalArtifactFetcher::new(workdir.join("downloads"))),
                    reporter,
                )),
            ),
            (
                VERIFY_CONTEXT,
                Arc::new(VerifyGoalExecutor::new(Arc::new(AlwaysHealthy))),
            ),
        ]
    })
    .await;

    let response = app
        .router
        .clone()
        .oneshot(post("/pushes?wait=true", &json!({ "commit": commit() })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(get("/repos/acme/shop/commits/9f8e7d6c/statuses"))
        .await
        .unwrap();
    let statuses: Vec<StatusEntry> = serde_json::from_value(body_to_json(response).await).unwrap();
    for context in [
        SCAN_CONTEXT,
        BUILD_CONTEXT,
        ARTIFACT_CONTEXT,
        DEPLOY_CONTEXT,
        ENDPOINT_CONTEXT,
        VERIFY_CONTEXT,
    ] {
        let status = statuses.iter().find(|s| s.context == context).unwrap();
        assert_eq!(status.state, StatusState::Success, "{context}");
    }
    let endpoint = statuses
        .iter()
        .find(|s| s.context == ENDPOINT_CONTEXT)
        .and_then(|s| s.target_url.clone())
        .unwrap();
    assert_eq!(endpoint, "http://127.0.0.1:28000/acme/shop/master");

    let response = app.router.clone().oneshot(get("/deployments")).await.unwrap();
    let deployments = body_to_json(response).await;
    assert_eq!(deployments.as_array().unwrap().len(), 1);
    assert_eq!(deployments[0]["port"], 28_000);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/deployments/acme/shop/master")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(app.registry.list().is_empty());

    // Termination is keyed by deployment, not commit.
    let events = app.storage.list_events(None).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"DEPLOYMENT_STARTED"));
    assert!(types.contains(&"DEPLOYMENT_TERMINATED"));

    app.registry.terminate_all().await;
    drop(app.dir);
}

#[tokio::test]
async fn retry_reruns_failed_goal_over_http() {
    let attempts = Arc::new(AtomicUsize::new(0));
    struct FailsOnce(Arc<AtomicUsize>);

    #[async_trait]
    impl GoalExecutor for FailsOnce {
        fn name(&self) -> &'static str {
            "fails-once"
        }

        async fn execute(&self, _ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ExecuteGoalResult::failure(1, "flaky scanner"))
            } else {
                Ok(ExecuteGoalResult::success())
            }
        }
    }

    let counter = Arc::clone(&attempts);
    let app = create_test_app(Pipeline::library(), move |_, _, _| {
        vec![(SCAN_CONTEXT, Arc::new(FailsOnce(counter)) as Arc<dyn GoalExecutor>)]
    })
    .await;

    let response = app
        .router
        .clone()
        .oneshot(post("/pushes?wait=true", &json!({ "commit": commit() })))
        .await
        .unwrap();
    let summary = body_to_json(response).await;
    assert_eq!(summary["finished"][0]["reported"], "failure");

    let response = app
        .router
        .clone()
        .oneshot(post(
            "/goals/retry?wait=true",
            &json!({ "commit": commit(), "context": SCAN_CONTEXT }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_to_json(response).await;
    assert_eq!(summary["finished"][0]["reported"], "success");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Retrying a goal that has not failed is a conflict.
    let response = app
        .router
        .oneshot(post(
            "/goals/retry",
            &json!({ "commit": commit(), "context": SCAN_CONTEXT }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
