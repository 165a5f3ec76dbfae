//! Durable research-job records and per-job structured logging.
//!
//! A job row tracks one research run: its topic, lifecycle status
//! (`pending` → `running` → `completed` | `failed`), a configuration
//! snapshot, the latest orchestrator state snapshot, and the final report.
//! Log entries are append-only and owned by their job (cascade delete).
//!
//! The [`ResearchLog`] trait decouples the orchestrator from where its
//! logs land: the console implementation only emits tracing events, the
//! database implementation additionally inserts a `research_logs` row per
//! record. Insert failures never propagate: a broken log sink must not
//! take down a running research job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;
use uuid::Uuid;

/// A research job row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub topic: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: Option<Value>,
    pub state: Option<Value>,
}

/// One append-only log entry belonging to a job.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LogEntry {
    pub id: i32,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Severity of a research log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Sink for orchestrator log records.
#[async_trait]
pub trait ResearchLog: Send + Sync {
    async fn log(&self, level: LogLevel, message: &str, metadata: Value);
}

/// Log sink that only emits tracing events. Used by the terminal flow.
pub struct ConsoleLog;

#[async_trait]
impl ResearchLog for ConsoleLog {
    async fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        emit_tracing(level, message, &metadata);
    }
}

fn emit_tracing(level: LogLevel, message: &str, metadata: &Value) {
    match level {
        LogLevel::Debug => tracing::debug!(%metadata, "{message}"),
        LogLevel::Info => tracing::info!(%metadata, "{message}"),
        LogLevel::Warn => tracing::warn!(%metadata, "{message}"),
        LogLevel::Error => tracing::error!(%metadata, "{message}"),
    }
}

/// Store for job rows and their logs.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new job in `pending` with its configuration snapshot.
    pub async fn create_job(&self, topic: &str, config: Value) -> Result<Job, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO research_jobs (topic, status, config)
            VALUES ($1, 'pending', $2)
            RETURNING id, topic, status, report, created_at, updated_at, config, state
            "#,
        )
        .bind(topic)
        .bind(config)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, topic, status, report, created_at, updated_at, config, state
            FROM research_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
    }

    /// The 50 most recent jobs, newest first.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, sqlx::Error> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, topic, status, report, created_at, updated_at, config, state
            FROM research_jobs
            ORDER BY created_at DESC
            LIMIT 50
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// All log entries for a job, in insertion order.
    pub async fn job_logs(&self, job_id: Uuid) -> Result<Vec<LogEntry>, sqlx::Error> {
        sqlx::query_as::<_, LogEntry>(
            r#"
            SELECT id, timestamp, level, message, metadata
            FROM research_logs
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn set_status(&self, id: Uuid, status: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE research_jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the final report and mark the job completed.
    pub async fn complete_job(&self, id: Uuid, report: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE research_jobs SET status = 'completed', report = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(report)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist an orchestrator state snapshot onto the job row.
    pub async fn save_state(&self, id: Uuid, state: Value) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE research_jobs SET state = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
        metadata: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO research_logs (job_id, level, message, metadata) VALUES ($1, $2, $3, $4)",
        )
        .bind(job_id)
        .bind(level.as_str())
        .bind(message)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Log sink that mirrors every record into the job's `research_logs` rows.
pub struct DbLog {
    store: JobStore,
    job_id: Uuid,
}

impl DbLog {
    pub fn new(store: JobStore, job_id: Uuid) -> Self {
        Self { store, job_id }
    }
}

#[async_trait]
impl ResearchLog for DbLog {
    async fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        emit_tracing(level, message, &metadata);

        if let Err(e) = self
            .store
            .insert_log(self.job_id, level, message, &metadata)
            .await
        {
            tracing::error!(error = %e, "failed to persist log entry");
        }
    }
}
