//! Project checkouts for goals that need the source tree.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use delivery_core::CommitRef;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("git is not installed")]
    GitUnavailable,
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CheckoutError>;

/// A working copy of a commit on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProject {
    pub base_dir: PathBuf,
}

impl LocalProject {
    pub fn has_file(&self, name: &str) -> bool {
        self.base_dir.join(name).is_file()
    }
}

#[async_trait]
pub trait ProjectCheckout: Send + Sync {
    /// Materialize `commit` on disk and return where it lives.
    async fn clone_commit(&self, commit: &CommitRef) -> Result<LocalProject>;
}

/// Clones with the system `git` into `<base>/<owner>/<repo>/<sha>`.
///
/// A directory already holding the commit is reused.
#[derive(Debug, Clone)]
pub struct GitProjectCheckout {
    base_dir: PathBuf,
    url_template: String,
}

impl GitProjectCheckout {
    /// `url_template` may use `{owner}` and `{repo}`.
    pub fn new(base_dir: impl Into<PathBuf>, url_template: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            url_template: url_template.into(),
        }
    }

    fn clone_url(&self, commit: &CommitRef) -> String {
        self.url_template
            .replace("{owner}", &commit.owner)
            .replace("{repo}", &commit.repo)
    }

    fn target_dir(&self, commit: &CommitRef) -> PathBuf {
        self.base_dir
            .join(&commit.owner)
            .join(&commit.repo)
            .join(&commit.sha)
    }
}

#[async_trait]
impl ProjectCheckout for GitProjectCheckout {
    async fn clone_commit(&self, commit: &CommitRef) -> Result<LocalProject> {
        let dir = self.target_dir(commit);
        if dir.join(".git").is_dir() {
            debug!(commit = %commit, dir = %dir.display(), "reusing existing checkout");
            return Ok(LocalProject { base_dir: dir });
        }

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = self.clone_url(commit);
        let dir_arg = dir.to_string_lossy().to_string();
        info!(commit = %commit, url = %url, "cloning project");

        if let Err(e) = git(&self.base_dir, &["clone", "--quiet", &url, &dir_arg]).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
        if let Err(e) = git(&dir, &["checkout", "--quiet", "--detach", &commit.sha]).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        Ok(LocalProject { base_dir: dir })
    }
}

async fn git(cwd: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CheckoutError::GitUnavailable
            } else {
                CheckoutError::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CheckoutError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(output)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    /// Creates `<root>/acme/shop` with one commit; returns its sha.
    fn setup_origin(root: &Path) -> String {
        let repo = root.join("acme").join("shop");
        std::fs::create_dir_all(&repo).unwrap();
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(&repo).output().unwrap();
        }
        std::fs::write(repo.join("pom.xml"), "<project/>").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(&repo).output().unwrap();
        StdCommand::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(&repo)
            .output()
            .unwrap();
        let out = StdCommand::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&repo)
            .output()
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn clones_and_checks_out_commit() {
        let origin = TempDir::new().unwrap();
        let sha = setup_origin(origin.path());
        let work = TempDir::new().unwrap();
        let template = format!("{}/{{owner}}/{{repo}}", origin.path().display());
        let checkout = GitProjectCheckout::new(work.path(), template);
        let commit = CommitRef::new("acme", "shop", &sha, "master");

        let project = checkout.clone_commit(&commit).await.unwrap();
        assert_eq!(project.base_dir, work.path().join("acme/shop").join(&sha));
        assert!(project.has_file("pom.xml"));

        // Second call reuses the directory.
        let again = checkout.clone_commit(&commit).await.unwrap();
        assert_eq!(again, project);
    }

    #[tokio::test]
    async fn unknown_repository_fails_and_cleans_up() {
        let work = TempDir::new().unwrap();
        let checkout = GitProjectCheckout::new(work.path(), "/nonexistent/{owner}/{repo}");
        let commit = CommitRef::new("acme", "missing", "abc123", "master");

        let err = checkout.clone_commit(&commit).await.unwrap_err();
        assert!(matches!(err, CheckoutError::CommandFailed(_)));
        assert!(!work.path().join("acme/missing/abc123").exists());
    }
}
