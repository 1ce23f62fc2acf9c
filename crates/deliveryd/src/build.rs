//! Build and link-artifact goals.
//!
//! Which tool builds a project is decided by an ordered list of
//! `(predicate, builder)` rules. The first rule whose predicate holds wins;
//! no match is an error, never a silent skip.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::command::{self, CommandLine};
use delivery_core::goals::BUILD_CONTEXT;
use delivery_core::interpret::{InterpreterChain, MavenErrors, ShortLog};
use delivery_core::pom;
use delivery_core::ExecuteGoalResult;
use thiserror::Error;
use tracing::info;

use crate::artifact::{self, ArtifactStore};
use crate::checkout::ProjectCheckout;
use crate::executor::{GoalContext, GoalError, GoalExecutor};
use crate::supervisor::{self, Outcome, ProcessSpec};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no builder matches project at {0}")]
    NoBuilder(PathBuf),
    #[error("build output not found: {0}")]
    MissingArtifact(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// One build tool.
pub trait Builder: Send + Sync {
    fn name(&self) -> &'static str;

    fn command(&self) -> CommandLine;

    /// Where the build output lands once `command` succeeded.
    fn locate_artifact(&self, project_dir: &Path) -> Result<PathBuf>;
}

/// `mvn package`; the jar is named from the POM coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct MavenBuilder;

impl Builder for MavenBuilder {
    fn name(&self) -> &'static str {
        "maven"
    }

    fn command(&self) -> CommandLine {
        command::maven_package()
    }

    fn locate_artifact(&self, project_dir: &Path) -> Result<PathBuf> {
        let pom_path = project_dir.join("pom.xml");
        let content = std::fs::read_to_string(&pom_path).map_err(|source| BuildError::Read {
            path: pom_path.clone(),
            source,
        })?;
        let identity = pom::identify(&content)
            .ok_or_else(|| BuildError::MissingArtifact(format!("{} has no coordinates", pom_path.display())))?;
        let jar = project_dir.join("target").join(identity.jar_name());
        if jar.is_file() {
            Ok(jar)
        } else {
            Err(BuildError::MissingArtifact(jar.display().to_string()))
        }
    }
}

/// `npm install && npm run build`; output is `dist/` or `build/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpmBuilder;

impl Builder for NpmBuilder {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn command(&self) -> CommandLine {
        command::npm_build()
    }

    fn locate_artifact(&self, project_dir: &Path) -> Result<PathBuf> {
        ["dist", "build"]
            .iter()
            .map(|d| project_dir.join(d))
            .find(|d| d.is_dir())
            .ok_or_else(|| BuildError::MissingArtifact(project_dir.join("dist").display().to_string()))
    }
}

type Predicate = Box<dyn Fn(&Path) -> bool + Send + Sync>;

struct BuilderRule {
    description: &'static str,
    predicate: Predicate,
    builder: Arc<dyn Builder>,
}

/// Ordered builder rules; first match wins.
#[derive(Default)]
pub struct BuilderSelector {
    rules: Vec<BuilderRule>,
}

impl std::fmt::Debug for BuilderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.description))
            .finish()
    }
}

impl BuilderSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maven when there is a `pom.xml`, then npm when there is a `package.json`.
    pub fn standard() -> Self {
        Self::new()
            .rule("pom.xml present", |dir| dir.join("pom.xml").is_file(), MavenBuilder)
            .rule(
                "package.json present",
                |dir| dir.join("package.json").is_file(),
                NpmBuilder,
            )
    }

    pub fn rule(
        mut self,
        description: &'static str,
        predicate: impl Fn(&Path) -> bool + Send + Sync + 'static,
        builder: impl Builder + 'static,
    ) -> Self {
        self.rules.push(BuilderRule {
            description,
            predicate: Box::new(predicate),
            builder: Arc::new(builder),
        });
        self
    }

    pub fn select(&self, project_dir: &Path) -> Result<Arc<dyn Builder>> {
        self.rules
            .iter()
            .find(|r| (r.predicate)(project_dir))
            .map(|r| Arc::clone(&r.builder))
            .ok_or_else(|| BuildError::NoBuilder(project_dir.to_path_buf()))
    }
}

/// Clone, build, and report the build output as target URL.
pub struct BuildGoalExecutor {
    checkout: Arc<dyn ProjectCheckout>,
    builders: BuilderSelector,
    timeout: Duration,
}

impl std::fmt::Debug for BuildGoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildGoalExecutor")
            .field("builders", &self.builders)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BuildGoalExecutor {
    pub fn new(checkout: Arc<dyn ProjectCheckout>, builders: BuilderSelector, timeout: Duration) -> Self {
        Self {
            checkout,
            builders,
            timeout,
        }
    }
}

#[async_trait]
impl GoalExecutor for BuildGoalExecutor {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn execute(&self, ctx: &GoalContext) -> std::result::Result<ExecuteGoalResult, GoalError> {
        let project = self.checkout.clone_commit(&ctx.commit).await?;
        let builder = self.builders.select(&project.base_dir)?;
        let command = builder.command();
        ctx.progress(format!("Building with {}: {}", builder.name(), command.display()));

        let spec = ProcessSpec::new(command, &project.base_dir);
        match supervisor::run(&spec, Arc::clone(&ctx.log), self.timeout).await? {
            Outcome::Success(_) => {
                let output = builder.locate_artifact(&project.base_dir)?;
                info!(commit = %ctx.commit, builder = builder.name(), output = %output.display(), "build finished");
                Ok(ExecuteGoalResult::success().with_target_url(artifact::file_url(&output)))
            }
            Outcome::Failure(reason) => Ok(ExecuteGoalResult::failure(1, reason.to_string())),
        }
    }

    fn interpreter(&self) -> InterpreterChain {
        InterpreterChain::new(vec![Box::new(MavenErrors), Box::new(ShortLog)])
    }
}

/// Publishes the build goal's output as this goal's target URL.
#[derive(Debug, Clone)]
pub struct LinkArtifactGoalExecutor {
    store: ArtifactStore,
}

impl LinkArtifactGoalExecutor {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GoalExecutor for LinkArtifactGoalExecutor {
    fn name(&self) -> &'static str {
        "link_artifact"
    }

    async fn execute(&self, ctx: &GoalContext) -> std::result::Result<ExecuteGoalResult, GoalError> {
        let Some(built) = ctx.sibling_target_url(BUILD_CONTEXT) else {
            return Ok(ExecuteGoalResult::failure(1, "build goal reported no artifact"));
        };

        // Remote artifacts are linked as they are.
        let Some(path) = artifact::local_path(&built) else {
            ctx.progress(format!("Linking remote artifact {built}"));
            return Ok(ExecuteGoalResult::success().with_target_url(built));
        };

        let url = self.store.store(&path, &ctx.commit).await?;
        ctx.progress(format!("Linked artifact {url}"));
        Ok(ExecuteGoalResult::success().with_target_url(url))
    }

    fn interpreter(&self) -> InterpreterChain {
        InterpreterChain::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::testing::FixedCheckout;
    use crate::executor::testing::{commit, fixture};
    use crate::executor::AttemptOutcome;
    use crate::reporter::{StatusReporter, StatusSource};
    use delivery_core::goals::{ARTIFACT_CONTEXT, SCAN_CONTEXT};
    use delivery_core::{Pipeline, StatusEntry, StatusState};
    use tempfile::TempDir;

    const POM: &str = "<project><groupId>com.acme</groupId><artifactId>shop</artifactId><version>1.0</version></project>";

    /// Builds by running a shell script instead of a real tool.
    struct ScriptBuilder(&'static str);

    impl Builder for ScriptBuilder {
        fn name(&self) -> &'static str {
            "script"
        }

        fn command(&self) -> CommandLine {
            CommandLine::shell(self.0)
        }

        fn locate_artifact(&self, project_dir: &Path) -> Result<PathBuf> {
            MavenBuilder.locate_artifact(project_dir)
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let selected = BuilderSelector::standard().select(dir.path()).unwrap();
        assert_eq!(selected.name(), "maven");

        std::fs::remove_file(dir.path().join("pom.xml")).unwrap();
        let selected = BuilderSelector::standard().select(dir.path()).unwrap();
        assert_eq!(selected.name(), "npm");
    }

    #[test]
    fn no_matching_rule_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = BuilderSelector::standard().select(dir.path()).err().unwrap();
        assert!(matches!(err, BuildError::NoBuilder(_)));
    }

    #[test]
    fn maven_jar_is_named_from_pom() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        assert!(matches!(
            MavenBuilder.locate_artifact(dir.path()),
            Err(BuildError::MissingArtifact(_))
        ));

        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/shop-1.0.jar"), b"jar").unwrap();
        assert_eq!(
            MavenBuilder.locate_artifact(dir.path()).unwrap(),
            dir.path().join("target/shop-1.0.jar")
        );
    }

    #[test]
    fn npm_output_prefers_dist() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        assert_eq!(NpmBuilder.locate_artifact(dir.path()).unwrap(), dir.path().join("build"));
        std::fs::create_dir_all(dir.path().join("dist")).unwrap();
        assert_eq!(NpmBuilder.locate_artifact(dir.path()).unwrap(), dir.path().join("dist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn build_goal_reports_jar_url() {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("pom.xml"), POM).unwrap();
        let fixture = fixture(Pipeline::library()).await;
        fixture
            .board
            .set_status(&commit(), &StatusEntry::new(SCAN_CONTEXT, StatusState::Success))
            .await
            .unwrap();
        fixture
            .board
            .set_status(&commit(), &StatusEntry::new(BUILD_CONTEXT, StatusState::Pending))
            .await
            .unwrap();

        let builders = BuilderSelector::new().rule(
            "always",
            |_| true,
            ScriptBuilder("mkdir -p target && echo built > target/shop-1.0.jar && echo '[INFO] BUILD SUCCESS'"),
        );
        let executor = Arc::new(BuildGoalExecutor::new(
            Arc::new(FixedCheckout(project.path().to_path_buf())),
            builders,
            Duration::from_secs(30),
        ));

        let outcome = fixture.runner.run(&commit(), BUILD_CONTEXT, executor).await;
        assert!(matches!(outcome, AttemptOutcome::Finished(_)));
        let status = fixture
            .board
            .snapshot(&commit(), BUILD_CONTEXT)
            .await
            .unwrap()
            .ours()
            .cloned()
            .unwrap();
        assert_eq!(status.state, StatusState::Success);
        assert_eq!(
            status.target_url.unwrap(),
            artifact::file_url(&project.path().join("target/shop-1.0.jar"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_build_is_diagnosed_from_maven_errors() {
        let project = TempDir::new().unwrap();
        let fixture = fixture(Pipeline::library()).await;
        fixture
            .board
            .set_status(&commit(), &StatusEntry::new(SCAN_CONTEXT, StatusState::Success))
            .await
            .unwrap();

        let builders = BuilderSelector::new().rule(
            "always",
            |_| true,
            ScriptBuilder("echo '[ERROR] compilation failure'; exit 1"),
        );
        let executor = Arc::new(BuildGoalExecutor::new(
            Arc::new(FixedCheckout(project.path().to_path_buf())),
            builders,
            Duration::from_secs(30),
        ));

        let AttemptOutcome::Finished(report) = fixture.runner.run(&commit(), BUILD_CONTEXT, executor).await
        else {
            panic!("expected finished attempt");
        };
        assert_eq!(report.reported.state, StatusState::Failure);
        assert_eq!(report.diagnosis.unwrap().relevant_part, "[ERROR] compilation failure");
    }

    #[tokio::test]
    async fn link_artifact_publishes_build_output() {
        let work = TempDir::new().unwrap();
        let jar = work.path().join("shop-1.0.jar");
        std::fs::write(&jar, b"jar").unwrap();

        let fixture = fixture(Pipeline::library()).await;
        for (context, state, url) in [
            (SCAN_CONTEXT, StatusState::Success, None),
            (BUILD_CONTEXT, StatusState::Success, Some(artifact::file_url(&jar))),
        ] {
            let mut entry = StatusEntry::new(context, state);
            entry.target_url = url;
            fixture.board.set_status(&commit(), &entry).await.unwrap();
        }

        let executor = Arc::new(LinkArtifactGoalExecutor::new(ArtifactStore::new(
            work.path().join("artifacts"),
        )));
        fixture.runner.run(&commit(), ARTIFACT_CONTEXT, executor).await;

        let status = fixture
            .board
            .snapshot(&commit(), ARTIFACT_CONTEXT)
            .await
            .unwrap()
            .ours()
            .cloned()
            .unwrap();
        assert_eq!(status.state, StatusState::Success);
        let stored = work
            .path()
            .join("artifacts/acme/shop/abc1234def/shop-1.0.jar");
        assert_eq!(status.target_url.unwrap(), artifact::file_url(&stored));
        assert!(stored.is_file());
    }
}
