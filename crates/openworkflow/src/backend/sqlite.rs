//! SQLite-backed [`Backend`].
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED` and no native JSON/timestamptz
//! type, so this backend diverges from the Postgres one in three ways:
//! JSON columns are stored as TEXT, timestamps are stored as RFC3339 TEXT,
//! and the claim query runs inside a `BEGIN IMMEDIATE` transaction against a
//! pool capped at one writer connection, turning the single-writer
//! constraint SQLite already has into the serialization point that replaces
//! row-level locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::backend::{migrations, Backend, CreateStepAttempt, CreateWorkflowRun};
use crate::error::{BackendError, SerializedError};
use crate::model::{StepAttempt, StepAttemptStatus, StepKind, WorkflowRun, WorkflowRunStatus};
use crate::pagination::{Cursor, Page, Pagination};

#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> BackendError {
    error!(error = %e, "sqlite backend error");
    BackendError::Database(e.to_string())
}

fn to_text(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_dt(raw: &str) -> Result<DateTime<Utc>, BackendError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackendError::Database(format!("invalid timestamp {raw:?}: {e}")))
}

fn to_json_text(value: &serde_json::Value) -> String {
    value.to_string()
}

fn row_to_workflow_run(row: &SqliteRow) -> Result<WorkflowRun, BackendError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = WorkflowRunStatus::from_db_str(&status_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown workflow run status: {status_raw}")))?;

    let id_raw: String = row.try_get("id").map_err(db_err)?;
    let parent_step_id_raw: Option<String> = row.try_get("parent_step_attempt_id").map_err(db_err)?;
    let config_raw: String = row.try_get("config").map_err(db_err)?;
    let context_raw: String = row.try_get("context").map_err(db_err)?;
    let input_raw: String = row.try_get("input").map_err(db_err)?;
    let output_raw: Option<String> = row.try_get("output").map_err(db_err)?;
    let error_raw: Option<String> = row.try_get("error").map_err(db_err)?;
    let available_at_raw: Option<String> = row.try_get("available_at").map_err(db_err)?;
    let deadline_at_raw: Option<String> = row.try_get("deadline_at").map_err(db_err)?;
    let started_at_raw: Option<String> = row.try_get("started_at").map_err(db_err)?;
    let finished_at_raw: Option<String> = row.try_get("finished_at").map_err(db_err)?;
    let created_at_raw: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at_raw: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(WorkflowRun {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: Uuid::parse_str(&id_raw).map_err(|e| BackendError::Database(e.to_string()))?,
        workflow_name: row.try_get("workflow_name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        status,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        config: serde_json::from_str(&config_raw)?,
        context: serde_json::from_str(&context_raw)?,
        input: serde_json::from_str(&input_raw)?,
        output: output_raw.map(|s| serde_json::from_str(&s)).transpose()?,
        error: error_raw
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        attempts: row.try_get("attempts").map_err(db_err)?,
        parent_step_attempt_namespace_id: row
            .try_get("parent_step_attempt_namespace_id")
            .map_err(db_err)?,
        parent_step_attempt_id: parent_step_id_raw
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| BackendError::Database(e.to_string()))?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        available_at: available_at_raw.map(|s| parse_dt(&s)).transpose()?,
        deadline_at: deadline_at_raw.map(|s| parse_dt(&s)).transpose()?,
        started_at: started_at_raw.map(|s| parse_dt(&s)).transpose()?,
        finished_at: finished_at_raw.map(|s| parse_dt(&s)).transpose()?,
        created_at: parse_dt(&created_at_raw)?,
        updated_at: parse_dt(&updated_at_raw)?,
    })
}

fn row_to_step_attempt(row: &SqliteRow) -> Result<StepAttempt, BackendError> {
    let kind_raw: String = row.try_get("kind").map_err(db_err)?;
    let kind = StepKind::from_db_str(&kind_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown step kind: {kind_raw}")))?;
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = StepAttemptStatus::from_db_str(&status_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown step attempt status: {status_raw}")))?;

    let id_raw: String = row.try_get("id").map_err(db_err)?;
    let run_id_raw: String = row.try_get("workflow_run_id").map_err(db_err)?;
    let config_raw: String = row.try_get("config").map_err(db_err)?;
    let context_raw: String = row.try_get("context").map_err(db_err)?;
    let output_raw: Option<String> = row.try_get("output").map_err(db_err)?;
    let error_raw: Option<String> = row.try_get("error").map_err(db_err)?;
    let child_id_raw: Option<String> = row.try_get("child_workflow_run_id").map_err(db_err)?;
    let started_at_raw: Option<String> = row.try_get("started_at").map_err(db_err)?;
    let finished_at_raw: Option<String> = row.try_get("finished_at").map_err(db_err)?;
    let created_at_raw: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at_raw: String = row.try_get("updated_at").map_err(db_err)?;

    Ok(StepAttempt {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: Uuid::parse_str(&id_raw).map_err(|e| BackendError::Database(e.to_string()))?,
        workflow_run_id: Uuid::parse_str(&run_id_raw).map_err(|e| BackendError::Database(e.to_string()))?,
        step_name: row.try_get("step_name").map_err(db_err)?,
        kind,
        status,
        config: serde_json::from_str(&config_raw)?,
        context: serde_json::from_str(&context_raw)?,
        output: output_raw.map(|s| serde_json::from_str(&s)).transpose()?,
        error: error_raw.map(|s| serde_json::from_str(&s)).transpose()?,
        child_workflow_run_namespace_id: row
            .try_get("child_workflow_run_namespace_id")
            .map_err(db_err)?,
        child_workflow_run_id: child_id_raw
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| BackendError::Database(e.to_string()))?,
        started_at: started_at_raw.map(|s| parse_dt(&s)).transpose()?,
        finished_at: finished_at_raw.map(|s| parse_dt(&s)).transpose()?,
        created_at: parse_dt(&created_at_raw)?,
        updated_at: parse_dt(&updated_at_raw)?,
    })
}

#[async_trait]
impl Backend for SqliteBackend {
    #[instrument(skip(self))]
    async fn migrate(&self) -> Result<(), BackendError> {
        migrations::run_sqlite(&self.pool).await
    }

    #[instrument(skip(self, params))]
    async fn create_workflow_run(
        &self,
        namespace_id: &str,
        params: CreateWorkflowRun,
    ) -> Result<WorkflowRun, BackendError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let available_at = params.available_at.unwrap_or(now);

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (namespace_id, id, workflow_name, version, status, idempotency_key,
                 config, context, input, attempts, available_at, deadline_at,
                 created_at, updated_at)
            VALUES
                (?, ?, ?, ?, 'pending', ?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(namespace_id)
        .bind(id.to_string())
        .bind(&params.workflow_name)
        .bind(&params.version)
        .bind(&params.idempotency_key)
        .bind(to_json_text(&params.config))
        .bind(to_json_text(&params.context))
        .bind(to_json_text(&params.input))
        .bind(to_text(available_at))
        .bind(params.deadline_at.map(to_text))
        .bind(to_text(now))
        .bind(to_text(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_workflow_run(namespace_id, id)
            .await?
            .ok_or(BackendError::NotFound)
    }

    #[instrument(skip(self))]
    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: Uuid,
    ) -> Result<Option<WorkflowRun>, BackendError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = ? AND id = ?")
            .bind(namespace_id)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_workflow_run).transpose()
    }

    #[instrument(skip(self, pagination))]
    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRun>, BackendError> {
        let backward = pagination.is_backward();
        let cursor: Option<Cursor> = if backward {
            pagination.before.clone()
        } else {
            pagination.after.clone()
        };
        let limit = pagination.limit.max(1);
        let order = if backward { "DESC" } else { "ASC" };
        let cmp = if backward { "<" } else { ">" };

        let rows = if let Some(c) = &cursor {
            let sql = format!(
                "SELECT * FROM workflow_runs WHERE namespace_id = ? AND (created_at, id) {cmp} (?, ?) ORDER BY created_at {order}, id {order} LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(namespace_id)
                .bind(to_text(c.created_at))
                .bind(c.id.to_string())
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
        } else {
            let sql = format!(
                "SELECT * FROM workflow_runs WHERE namespace_id = ? ORDER BY created_at {order}, id {order} LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(namespace_id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
        };

        let items = rows
            .iter()
            .map(row_to_workflow_run)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_rows(items, limit, backward, cursor.is_some()))
    }

    #[instrument(skip(self))]
    async fn claim_workflow_run(
        &self,
        namespace_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<Option<WorkflowRun>, BackendError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'failed',
                   error = '{"message":"Workflow run deadline exceeded"}',
                   worker_id = NULL,
                   available_at = NULL,
                   finished_at = ?,
                   updated_at = ?
             WHERE namespace_id = ?
               AND status IN ('pending', 'running', 'sleeping')
               AND deadline_at IS NOT NULL
               AND deadline_at <= ?
            "#,
        )
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(to_text(now))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let candidate: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM workflow_runs
             WHERE namespace_id = ?
               AND status IN ('pending', 'running', 'sleeping')
               AND available_at <= ?
               AND (deadline_at IS NULL OR deadline_at > ?)
             ORDER BY (status != 'pending'), available_at ASC, created_at ASC, id ASC
             LIMIT 1
            "#,
        )
        .bind(namespace_id)
        .bind(to_text(now))
        .bind(to_text(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(candidate_id) = candidate else {
            tx.commit().await.map_err(db_err)?;
            return Ok(None);
        };

        let new_available_at = now + chrono::Duration::milliseconds(lease_duration_ms);
        sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'running',
                   worker_id = ?,
                   available_at = ?,
                   started_at = COALESCE(started_at, ?),
                   attempts = attempts + 1,
                   updated_at = ?
             WHERE namespace_id = ? AND id = ?
            "#,
        )
        .bind(worker_id)
        .bind(to_text(new_available_at))
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(&candidate_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM workflow_runs WHERE namespace_id = ? AND id = ?")
            .bind(namespace_id)
            .bind(&candidate_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(row_to_workflow_run(&row)?))
    }

    #[instrument(skip(self))]
    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, BackendError> {
        let new_available_at = Utc::now() + chrono::Duration::milliseconds(lease_duration_ms);
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET available_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'
            "#,
        )
        .bind(to_text(new_available_at))
        .bind(to_text(Utc::now()))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self))]
    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
    ) -> Result<WorkflowRun, BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'sleeping', available_at = ?, worker_id = NULL, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ?
               AND status NOT IN ('completed', 'failed', 'canceled')
            "#,
        )
        .bind(to_text(available_at))
        .bind(to_text(Utc::now()))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self, output))]
    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'completed', output = ?, worker_id = NULL,
                   available_at = NULL, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'
            "#,
        )
        .bind(to_json_text(&output))
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self, error))]
    async fn fail_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let error_json = serde_json::to_string(&error)?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'failed', error = ?, worker_id = NULL,
                   available_at = NULL, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'
            "#,
        )
        .bind(error_json)
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self, error))]
    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError> {
        let error_json = serde_json::to_string(&error)?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'pending', available_at = ?, worker_id = NULL,
                   started_at = NULL, error = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'
            "#,
        )
        .bind(to_text(available_at))
        .bind(error_json)
        .bind(to_text(Utc::now()))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self))]
    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowRun, BackendError> {
        let existing = self
            .get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::NotFound)?;

        if existing.status == WorkflowRunStatus::Canceled {
            return Ok(existing);
        }
        if existing.status.is_terminal() {
            return Err(BackendError::AlreadyTerminal);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
               SET status = 'canceled', worker_id = NULL, available_at = NULL,
                   finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND id = ? AND status IN ('pending', 'running', 'sleeping')
            "#,
        )
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_workflow_run(namespace_id, run_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self, params))]
    async fn create_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        params: CreateStepAttempt,
    ) -> Result<StepAttempt, BackendError> {
        let owned: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM workflow_runs WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        if owned == 0 {
            return Err(BackendError::GuardMismatch);
        }

        let id = Uuid::now_v7();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO step_attempts
                (namespace_id, id, workflow_run_id, step_name, kind, status,
                 config, context, started_at, created_at, updated_at)
            VALUES
                (?, ?, ?, ?, ?, 'running', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(namespace_id)
        .bind(id.to_string())
        .bind(run_id.to_string())
        .bind(&params.step_name)
        .bind(params.kind.as_db_str())
        .bind(to_json_text(&params.config))
        .bind(to_json_text(&params.context))
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(to_text(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_step_attempt(namespace_id, run_id, id)
            .await?
            .ok_or(BackendError::NotFound)
    }

    #[instrument(skip(self))]
    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        id: Uuid,
    ) -> Result<Option<StepAttempt>, BackendError> {
        let row = sqlx::query(
            "SELECT * FROM step_attempts WHERE namespace_id = ? AND workflow_run_id = ? AND id = ?",
        )
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_step_attempt).transpose()
    }

    #[instrument(skip(self, pagination))]
    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<StepAttempt>, BackendError> {
        let backward = pagination.is_backward();
        let cursor: Option<Cursor> = if backward {
            pagination.before.clone()
        } else {
            pagination.after.clone()
        };
        let limit = pagination.limit.max(1);
        let order = if backward { "DESC" } else { "ASC" };
        let cmp = if backward { "<" } else { ">" };

        let rows = if let Some(c) = &cursor {
            let sql = format!(
                "SELECT * FROM step_attempts WHERE namespace_id = ? AND workflow_run_id = ? AND (created_at, id) {cmp} (?, ?) ORDER BY created_at {order}, id {order} LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(namespace_id)
                .bind(run_id.to_string())
                .bind(to_text(c.created_at))
                .bind(c.id.to_string())
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
        } else {
            let sql = format!(
                "SELECT * FROM step_attempts WHERE namespace_id = ? AND workflow_run_id = ? ORDER BY created_at {order}, id {order} LIMIT ?"
            );
            sqlx::query(&sql)
                .bind(namespace_id)
                .bind(run_id.to_string())
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
        };

        let items = rows
            .iter()
            .map(row_to_step_attempt)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_rows(items, limit, backward, cursor.is_some()))
    }

    #[instrument(skip(self, output))]
    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        output: Option<serde_json::Value>,
    ) -> Result<StepAttempt, BackendError> {
        let owned: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM workflow_runs WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        if owned == 0 {
            return Err(BackendError::GuardMismatch);
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE step_attempts SET status = 'completed', output = ?, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND workflow_run_id = ? AND id = ?
            "#,
        )
        .bind(output.as_ref().map(to_json_text))
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(step_attempt_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_step_attempt(namespace_id, run_id, step_attempt_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }

    #[instrument(skip(self, error))]
    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<StepAttempt, BackendError> {
        let owned: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM workflow_runs WHERE namespace_id = ? AND id = ? AND worker_id = ? AND status = 'running'",
        )
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        if owned == 0 {
            return Err(BackendError::GuardMismatch);
        }

        let now = Utc::now();
        let error_json = serde_json::to_string(&error)?;
        let result = sqlx::query(
            r#"
            UPDATE step_attempts SET status = 'failed', error = ?, finished_at = ?, updated_at = ?
             WHERE namespace_id = ? AND workflow_run_id = ? AND id = ?
            "#,
        )
        .bind(error_json)
        .bind(to_text(now))
        .bind(to_text(now))
        .bind(namespace_id)
        .bind(run_id.to_string())
        .bind(step_attempt_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(BackendError::GuardMismatch);
        }
        self.get_step_attempt(namespace_id, run_id, step_attempt_id)
            .await?
            .ok_or(BackendError::GuardMismatch)
    }
}

/// Open a SQLite pool suitable for this backend: WAL journal mode, a
/// single-writer connection cap, and a busy timeout to absorb brief
/// contention instead of surfacing `SQLITE_BUSY`.
pub async fn open_sqlite_pool(path: &str) -> Result<SqlitePool, BackendError> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
    use std::str::FromStr;
    use std::time::Duration;

    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| BackendError::Database(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| BackendError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CreateWorkflowRun;

    async fn test_backend() -> SqliteBackend {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        let backend = SqliteBackend::new(pool);
        backend.migrate().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn open_and_migrate_in_memory_sqlite() {
        let backend = test_backend().await;
        backend.migrate().await.unwrap(); // idempotent
    }

    #[tokio::test]
    async fn complete_clears_available_at() {
        let backend = test_backend().await;
        let created = backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "wf".into(),
                    version: None,
                    idempotency_key: None,
                    config: serde_json::json!({}),
                    context: serde_json::json!({}),
                    input: serde_json::json!({}),
                    available_at: None,
                    deadline_at: None,
                },
            )
            .await
            .unwrap();
        assert!(created.available_at.is_some());

        let claimed = backend
            .claim_workflow_run("ns", "worker-1", 30_000)
            .await
            .unwrap()
            .expect("a pending run is claimable");
        assert_eq!(claimed.id, created.id);

        let completed = backend
            .complete_workflow_run("ns", created.id, "worker-1", serde_json::json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(completed.status, WorkflowRunStatus::Completed);
        assert_eq!(completed.available_at, None);
    }

    #[tokio::test]
    async fn fail_and_cancel_also_clear_available_at() {
        let backend = test_backend().await;

        let failed_run = backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "wf".into(),
                    version: None,
                    idempotency_key: None,
                    config: serde_json::json!({}),
                    context: serde_json::json!({}),
                    input: serde_json::json!({}),
                    available_at: None,
                    deadline_at: None,
                },
            )
            .await
            .unwrap();
        backend
            .claim_workflow_run("ns", "worker-1", 30_000)
            .await
            .unwrap();
        let failed = backend
            .fail_workflow_run(
                "ns",
                failed_run.id,
                "worker-1",
                SerializedError::new("boom"),
            )
            .await
            .unwrap();
        assert_eq!(failed.status, WorkflowRunStatus::Failed);
        assert_eq!(failed.available_at, None);

        let canceled_run = backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "wf".into(),
                    version: None,
                    idempotency_key: None,
                    config: serde_json::json!({}),
                    context: serde_json::json!({}),
                    input: serde_json::json!({}),
                    available_at: None,
                    deadline_at: None,
                },
            )
            .await
            .unwrap();
        let canceled = backend
            .cancel_workflow_run("ns", canceled_run.id)
            .await
            .unwrap();
        assert_eq!(canceled.status, WorkflowRunStatus::Canceled);
        assert_eq!(canceled.available_at, None);
    }
}
