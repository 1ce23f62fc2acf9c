//! SQLite storage for the delivery daemon.
//!
//! Persists reported statuses, execution attempts and the audit event log.

use chrono::{DateTime, Utc};
use delivery_core::{
    events::EventPayload, CommitRef, Event, Execution, ExecutionState, Id, StatusEntry,
    StatusState,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

const EXECUTION_COLUMNS: &str = "id, owner, repo, sha, branch, context, goal_name, state, \
    log_path, log_url, target_url, message, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the compiled-in schema. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Status operations ---

    /// Append a status entry for a commit.
    pub async fn append_status(&self, commit: &CommitRef, entry: &StatusEntry) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO statuses (owner, repo, sha, branch, context, state, target_url, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(&commit.owner)
        .bind(&commit.repo)
        .bind(&commit.sha)
        .bind(&commit.branch)
        .bind(&entry.context)
        .bind(entry.state.as_str())
        .bind(entry.target_url.as_deref())
        .bind(entry.description.as_deref())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All statuses for a commit in arrival order.
    pub async fn list_statuses(&self, commit: &CommitRef) -> Result<Vec<StatusEntry>> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r"
            SELECT context, state, target_url, description FROM statuses
            WHERE owner = ?1 AND repo = ?2 AND sha = ?3
            ORDER BY seq ASC
            ",
        )
        .bind(&commit.owner)
        .bind(&commit.repo)
        .bind(&commit.sha)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(StatusRow::into_entry).collect())
    }

    // --- Execution operations ---

    pub async fn insert_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO executions (id, owner, repo, sha, branch, context, goal_name, state,
                log_path, log_url, target_url, message, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
        )
        .bind(execution.id.as_ref())
        .bind(&execution.owner)
        .bind(&execution.repo)
        .bind(&execution.sha)
        .bind(&execution.branch)
        .bind(&execution.context)
        .bind(&execution.goal_name)
        .bind(execution.state.as_str())
        .bind(execution.log_path.as_deref())
        .bind(execution.log_url.as_deref())
        .bind(execution.target_url.as_deref())
        .bind(execution.message.as_deref())
        .bind(execution.created_at.timestamp_millis())
        .bind(execution.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the terminal state of an execution.
    pub async fn finish_execution(
        &self,
        id: &Id,
        state: ExecutionState,
        target_url: Option<&str>,
        message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET state = ?1, target_url = ?2, message = ?3, updated_at = ?4 WHERE id = ?5",
        )
        .bind(state.as_str())
        .bind(target_url)
        .bind(message)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get_execution(&self, id: &Id) -> Result<Execution> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
        let row = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ExecutionNotFound(id.to_string()))?;
        Ok(row.into_execution())
    }

    /// Executions, oldest first, optionally limited to one commit.
    pub async fn list_executions(&self, sha: Option<&str>) -> Result<Vec<Execution>> {
        let rows = if let Some(sha) = sha {
            let query = format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE sha = ?1 ORDER BY created_at ASC, id ASC"
            );
            sqlx::query_as::<_, ExecutionRow>(&query)
                .bind(sha)
                .fetch_all(&self.pool)
                .await?
        } else {
            let query =
                format!("SELECT {EXECUTION_COLUMNS} FROM executions ORDER BY created_at ASC, id ASC");
            sqlx::query_as::<_, ExecutionRow>(&query)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(rows.into_iter().map(ExecutionRow::into_execution).collect())
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(
        &self,
        sha: Option<&str>,
        execution_id: Option<&Id>,
        payload: &EventPayload,
    ) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, sha, execution_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(sha)
        .bind(execution_id.map(|id| id.as_ref()))
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            sha: sha.map(str::to_string),
            execution_id: execution_id.cloned(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// Events for one commit, or every event when `sha` is `None`.
    pub async fn list_events(&self, sha: Option<&str>) -> Result<Vec<Event>> {
        let rows = if let Some(sha) = sha {
            sqlx::query_as::<_, EventRow>(
                "SELECT * FROM events WHERE sha = ?1 ORDER BY ts ASC, id ASC",
            )
            .bind(sha)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, EventRow>("SELECT * FROM events ORDER BY ts ASC, id ASC")
                .fetch_all(&self.pool)
                .await?
        };

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

// --- Row types for sqlx ---

#[derive(sqlx::FromRow)]
struct StatusRow {
    context: String,
    state: String,
    target_url: Option<String>,
    description: Option<String>,
}

impl StatusRow {
    fn into_entry(self) -> Option<StatusEntry> {
        let Some(state) = StatusState::parse(&self.state) else {
            tracing::warn!(context = %self.context, state = %self.state, "skipping status with unknown state");
            return None;
        };
        Some(StatusEntry {
            context: self.context,
            state,
            target_url: self.target_url,
            description: self.description,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    owner: String,
    repo: String,
    sha: String,
    branch: String,
    context: String,
    goal_name: String,
    state: String,
    log_path: Option<String>,
    log_url: Option<String>,
    target_url: Option<String>,
    message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ExecutionRow {
    fn into_execution(self) -> Execution {
        Execution {
            id: Id::from_string(self.id),
            owner: self.owner,
            repo: self.repo,
            sha: self.sha,
            branch: self.branch,
            context: self.context,
            goal_name: self.goal_name,
            state: ExecutionState::parse(&self.state),
            log_path: self.log_path,
            log_url: self.log_url,
            target_url: self.target_url,
            message: self.message,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    sha: Option<String>,
    execution_id: Option<String>,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            sha: self.sha,
            execution_id: self.execution_id.map(Id::from_string),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}
