//! Status reporting and notification collaborators.
//!
//! The runner talks to the outside world through [`StatusReporter`],
//! [`StatusSource`] and [`Notifier`]. Failures here are reported back to the
//! caller, which logs them; they never change a goal's own outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::{CommitRef, StatusEntry, StatusSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected notification with status {0}")]
    Rejected(u16),
}

pub type Result<T> = std::result::Result<T, ReporterError>;

/// Publishes a status for a commit.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn set_status(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<()>;
}

/// Reads the statuses currently known for a commit.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn snapshot(&self, commit: &CommitRef, context: &str) -> Result<StatusSnapshot>;
}

/// Offered alongside a failure so an operator can re-run the goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAction {
    pub commit: CommitRef,
    pub context: String,
}

/// A message about a goal, addressed to whoever follows the commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub commit: CommitRef,
    pub context: String,
    pub title: String,
    pub body: String,
    pub log_url: Option<String>,
    pub retry: Option<RetryAction>,
}

/// Best-effort delivery of notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Storage-backed status board. The daemon is its own status service.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    storage: Arc<Storage>,
}

impl StatusBoard {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StatusReporter for StatusBoard {
    async fn set_status(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<()> {
        self.storage.append_status(commit, entry).await?;
        info!(
            sha = %commit.sha,
            context = %entry.context,
            state = %entry.state,
            "status reported"
        );
        Ok(())
    }
}

#[async_trait]
impl StatusSource for StatusBoard {
    async fn snapshot(&self, commit: &CommitRef, context: &str) -> Result<StatusSnapshot> {
        let siblings = self.storage.list_statuses(commit).await?;
        Ok(StatusSnapshot::new(context, siblings))
    }
}

/// Bounds every status write with a timeout.
#[derive(Clone)]
pub struct TimeoutReporter {
    inner: Arc<dyn StatusReporter>,
    limit: Duration,
}

impl std::fmt::Debug for TimeoutReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutReporter")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl TimeoutReporter {
    pub fn new(inner: Arc<dyn StatusReporter>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl StatusReporter for TimeoutReporter {
    async fn set_status(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<()> {
        tokio::time::timeout(self.limit, self.inner.set_status(commit, entry))
            .await
            .map_err(|_| ReporterError::Timeout {
                operation: "set_status",
                after: self.limit,
            })?
    }
}

/// Writes notifications to the daemon log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            target: "notify",
            commit = %notification.commit,
            context = %notification.context,
            log_url = ?notification.log_url,
            retry = notification.retry.is_some(),
            "{}\n{}",
            notification.title,
            notification.body
        );
        Ok(())
    }
}

/// POSTs notifications as JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, limit: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(limit).build()?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let response = self.http.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "webhook rejected notification");
            return Err(ReporterError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Sends to every notifier; returns the first error after trying all.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for FanoutNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutNotifier")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.send(notification).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use delivery_core::StatusState;
    use tempfile::TempDir;

    struct SlowReporter;

    #[async_trait]
    impl StatusReporter for SlowReporter {
        async fn set_status(&self, _commit: &CommitRef, _entry: &StatusEntry) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn commit() -> CommitRef {
        CommitRef::new("acme", "shop", "abc123", "master")
    }

    #[tokio::test]
    async fn board_reports_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let board = StatusBoard::new(Arc::new(storage));

        board
            .set_status(&commit(), &StatusEntry::new("delivery/scan", StatusState::Success))
            .await
            .unwrap();
        let snapshot = board.snapshot(&commit(), "delivery/build").await.unwrap();
        assert_eq!(snapshot.context, "delivery/build");
        assert_eq!(snapshot.latest("delivery/scan").unwrap().state, StatusState::Success);
        assert!(snapshot.ours().is_none());
    }

    #[tokio::test]
    async fn timeout_reporter_gives_up() {
        let reporter = TimeoutReporter::new(Arc::new(SlowReporter), Duration::from_millis(50));
        let err = reporter
            .set_status(&commit(), &StatusEntry::new("delivery/scan", StatusState::Pending))
            .await
            .unwrap_err();
        assert!(matches!(err, ReporterError::Timeout { .. }));
    }

    #[tokio::test]
    async fn fanout_tries_every_notifier() {
        struct Failing;

        #[async_trait]
        impl Notifier for Failing {
            async fn send(&self, _notification: &Notification) -> Result<()> {
                Err(ReporterError::Rejected(500))
            }
        }

        let recording = Arc::new(testing::RecordingNotifier::default());
        let fanout = FanoutNotifier::new(vec![Arc::new(Failing), Arc::clone(&recording) as Arc<dyn Notifier>]);
        let notification = Notification {
            commit: commit(),
            context: "delivery/build".to_string(),
            title: "Build failed".to_string(),
            body: "see log".to_string(),
            log_url: None,
            retry: None,
        };

        assert!(fanout.send(&notification).await.is_err());
        assert_eq!(recording.sent.lock().unwrap().len(), 1);
    }
}
