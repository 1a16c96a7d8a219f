//! PostgreSQL-backed [`Backend`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use crate::backend::{migrations, Backend, CreateStepAttempt, CreateWorkflowRun};
use crate::error::{BackendError, SerializedError};
use crate::model::{StepAttempt, StepAttemptStatus, StepKind, WorkflowRun, WorkflowRunStatus};
use crate::pagination::{Cursor, Page, Pagination};

/// A `PgPool`-backed implementation of the engine's relational backend.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_workflow_run(row: &PgRow) -> Result<WorkflowRun, BackendError> {
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = WorkflowRunStatus::from_db_str(&status_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown workflow run status: {status_raw}")))?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(db_err)?;
    let output: Option<serde_json::Value> = row.try_get("output").map_err(db_err)?;

    Ok(WorkflowRun {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: row.try_get("id").map_err(db_err)?,
        workflow_name: row.try_get("workflow_name").map_err(db_err)?,
        version: row.try_get("version").map_err(db_err)?,
        status,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
        config: row.try_get("config").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        input: row.try_get("input").map_err(db_err)?,
        output,
        error: error.map(serde_json::from_value).transpose()?,
        attempts: row.try_get("attempts").map_err(db_err)?,
        parent_step_attempt_namespace_id: row
            .try_get("parent_step_attempt_namespace_id")
            .map_err(db_err)?,
        parent_step_attempt_id: row.try_get("parent_step_attempt_id").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        available_at: row.try_get("available_at").map_err(db_err)?,
        deadline_at: row.try_get("deadline_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_step_attempt(row: &PgRow) -> Result<StepAttempt, BackendError> {
    let kind_raw: String = row.try_get("kind").map_err(db_err)?;
    let kind = StepKind::from_db_str(&kind_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown step kind: {kind_raw}")))?;
    let status_raw: String = row.try_get("status").map_err(db_err)?;
    let status = StepAttemptStatus::from_db_str(&status_raw)
        .ok_or_else(|| BackendError::Database(format!("unknown step attempt status: {status_raw}")))?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(db_err)?;

    Ok(StepAttempt {
        namespace_id: row.try_get("namespace_id").map_err(db_err)?,
        id: row.try_get("id").map_err(db_err)?,
        workflow_run_id: row.try_get("workflow_run_id").map_err(db_err)?,
        step_name: row.try_get("step_name").map_err(db_err)?,
        kind,
        status,
        config: row.try_get("config").map_err(db_err)?,
        context: row.try_get("context").map_err(db_err)?,
        output: row.try_get("output").map_err(db_err)?,
        error: error.map(serde_json::from_value).transpose()?,
        child_workflow_run_namespace_id: row
            .try_get("child_workflow_run_namespace_id")
            .map_err(db_err)?,
        child_workflow_run_id: row.try_get("child_workflow_run_id").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        finished_at: row.try_get("finished_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> BackendError {
    error!(error = %e, "postgres backend error");
    BackendError::Database(e.to_string())
}

#[async_trait]
impl Backend for PostgresBackend {
    #[instrument(skip(self))]
    async fn migrate(&self) -> Result<(), BackendError> {
        migrations::run_postgres(&self.pool).await
    }

    #[instrument(skip(self, params))]
    async fn create_workflow_run(
        &self,
        namespace_id: &str,
        params: CreateWorkflowRun,
    ) -> Result<WorkflowRun, BackendError> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO openworkflow.workflow_runs
                (namespace_id, id, workflow_name, version, status, idempotency_key,
                 config, context, input, attempts, available_at, deadline_at,
                 created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, 0,
                 COALESCE($9, now()), $10, now(), now())
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(id)
        .bind(&params.workflow_name)
        .bind(&params.version)
        .bind(&params.idempotency_key)
        .bind(&params.config)
        .bind(&params.context)
        .bind(&params.input)
        .bind(params.available_at)
        .bind(params.deadline_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_workflow_run(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: Uuid,
    ) -> Result<Option<WorkflowRun>, BackendError> {
        let row = sqlx::query(
            "SELECT * FROM openworkflow.workflow_runs WHERE namespace_id = $1 AND id = $2",
        )
        .bind(namespace_id)
        .bind(id)
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
        let cursor = if backward {
            pagination.before.clone()
        } else {
            pagination.after.clone()
        };
        let limit = pagination.limit.max(1);

        let rows = if backward {
            match &cursor {
                Some(c) => sqlx::query(
                    r#"SELECT * FROM openworkflow.workflow_runs
                       WHERE namespace_id = $1 AND (created_at, id) < ($2, $3)
                       ORDER BY created_at DESC, id DESC LIMIT $4"#,
                )
                .bind(namespace_id)
                .bind(c.created_at)
                .bind(c.id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
                None => sqlx::query(
                    r#"SELECT * FROM openworkflow.workflow_runs
                       WHERE namespace_id = $1
                       ORDER BY created_at DESC, id DESC LIMIT $2"#,
                )
                .bind(namespace_id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
            }
        } else {
            match &cursor {
                Some(c) => sqlx::query(
                    r#"SELECT * FROM openworkflow.workflow_runs
                       WHERE namespace_id = $1 AND (created_at, id) > ($2, $3)
                       ORDER BY created_at ASC, id ASC LIMIT $4"#,
                )
                .bind(namespace_id)
                .bind(c.created_at)
                .bind(c.id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
                None => sqlx::query(
                    r#"SELECT * FROM openworkflow.workflow_runs
                       WHERE namespace_id = $1
                       ORDER BY created_at ASC, id ASC LIMIT $2"#,
                )
                .bind(namespace_id)
                .bind((limit + 1) as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
            }
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
        sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'failed',
                   error = jsonb_build_object('message', 'Workflow run deadline exceeded'),
                   worker_id = NULL,
                   available_at = NULL,
                   finished_at = now(),
                   updated_at = now()
             WHERE namespace_id = $1
               AND status IN ('pending', 'running', 'sleeping')
               AND deadline_at IS NOT NULL
               AND deadline_at <= now()
            "#,
        )
        .bind(namespace_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT namespace_id, id
                  FROM openworkflow.workflow_runs
                 WHERE namespace_id = $1
                   AND status IN ('pending', 'running', 'sleeping')
                   AND available_at <= now()
                   AND (deadline_at IS NULL OR deadline_at > now())
                 ORDER BY (status != 'pending'), available_at ASC, created_at ASC, id ASC
                 LIMIT 1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE openworkflow.workflow_runs w
               SET status = 'running',
                   worker_id = $2,
                   available_at = now() + make_interval(secs => $3 / 1000.0),
                   started_at = COALESCE(w.started_at, now()),
                   attempts = w.attempts + 1,
                   updated_at = now()
              FROM candidate c
             WHERE w.namespace_id = c.namespace_id AND w.id = c.id
            RETURNING w.*
            "#,
        )
        .bind(namespace_id)
        .bind(worker_id)
        .bind(lease_duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_workflow_run).transpose()
    }

    #[instrument(skip(self))]
    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, BackendError> {
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET available_at = now() + make_interval(secs => $4 / 1000.0),
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'sleeping',
                   available_at = $4,
                   worker_id = NULL,
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3
               AND status NOT IN ('completed', 'failed', 'canceled')
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .bind(available_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'completed',
                   output = $4,
                   worker_id = NULL,
                   available_at = NULL,
                   finished_at = now(),
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .bind(output)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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
        let error_json = serde_json::to_value(&error)?;
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'failed',
                   error = $4,
                   worker_id = NULL,
                   available_at = NULL,
                   finished_at = now(),
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .bind(error_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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
        let error_json = serde_json::to_value(&error)?;
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'pending',
                   available_at = $4,
                   worker_id = NULL,
                   started_at = NULL,
                   error = $5,
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .bind(available_at)
        .bind(error_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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

        let row = sqlx::query(
            r#"
            UPDATE openworkflow.workflow_runs
               SET status = 'canceled',
                   worker_id = NULL,
                   available_at = NULL,
                   finished_at = now(),
                   updated_at = now()
             WHERE namespace_id = $1 AND id = $2
               AND status IN ('pending', 'running', 'sleeping')
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_workflow_run)
            .transpose()?
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
        // The lease is re-asserted here so a worker that already lost
        // ownership cannot fabricate step history for a run it no longer
        // owns.
        let owned = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM openworkflow.workflow_runs
              WHERE namespace_id = $1 AND id = $2 AND worker_id = $3 AND status = 'running'",
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        if owned == 0 {
            return Err(BackendError::GuardMismatch);
        }

        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO openworkflow.step_attempts
                (namespace_id, id, workflow_run_id, step_name, kind, status,
                 config, context, started_at, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, 'running', $6, $7, now(), now(), now())
            RETURNING *
            "#,
        )
        .bind(namespace_id)
        .bind(id)
        .bind(run_id)
        .bind(&params.step_name)
        .bind(params.kind.as_db_str())
        .bind(&params.config)
        .bind(&params.context)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_step_attempt(&row)
    }

    #[instrument(skip(self))]
    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        id: Uuid,
    ) -> Result<Option<StepAttempt>, BackendError> {
        let row = sqlx::query(
            "SELECT * FROM openworkflow.step_attempts
              WHERE namespace_id = $1 AND workflow_run_id = $2 AND id = $3",
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(id)
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

        let rows = if backward {
            match &cursor {
                Some(c) => sqlx::query(
                    r#"SELECT * FROM openworkflow.step_attempts
                       WHERE namespace_id = $1 AND workflow_run_id = $2 AND (created_at, id) < ($3, $4)
                       ORDER BY created_at DESC, id DESC LIMIT $5"#,
                )
                .bind(namespace_id).bind(run_id).bind(c.created_at).bind(c.id).bind((limit + 1) as i64)
                .fetch_all(&self.pool).await.map_err(db_err)?,
                None => sqlx::query(
                    r#"SELECT * FROM openworkflow.step_attempts
                       WHERE namespace_id = $1 AND workflow_run_id = $2
                       ORDER BY created_at DESC, id DESC LIMIT $3"#,
                )
                .bind(namespace_id).bind(run_id).bind((limit + 1) as i64)
                .fetch_all(&self.pool).await.map_err(db_err)?,
            }
        } else {
            match &cursor {
                Some(c) => sqlx::query(
                    r#"SELECT * FROM openworkflow.step_attempts
                       WHERE namespace_id = $1 AND workflow_run_id = $2 AND (created_at, id) > ($3, $4)
                       ORDER BY created_at ASC, id ASC LIMIT $5"#,
                )
                .bind(namespace_id).bind(run_id).bind(c.created_at).bind(c.id).bind((limit + 1) as i64)
                .fetch_all(&self.pool).await.map_err(db_err)?,
                None => sqlx::query(
                    r#"SELECT * FROM openworkflow.step_attempts
                       WHERE namespace_id = $1 AND workflow_run_id = $2
                       ORDER BY created_at ASC, id ASC LIMIT $3"#,
                )
                .bind(namespace_id).bind(run_id).bind((limit + 1) as i64)
                .fetch_all(&self.pool).await.map_err(db_err)?,
            }
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
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.step_attempts s
               SET status = 'completed',
                   output = $5,
                   finished_at = now(),
                   updated_at = now()
              FROM openworkflow.workflow_runs w
             WHERE s.namespace_id = $1 AND s.workflow_run_id = $2 AND s.id = $3
               AND w.namespace_id = s.namespace_id AND w.id = s.workflow_run_id
               AND w.worker_id = $4 AND w.status = 'running'
            RETURNING s.*
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(step_attempt_id)
        .bind(worker_id)
        .bind(output)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_step_attempt)
            .transpose()?
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
        let error_json = serde_json::to_value(&error)?;
        let row = sqlx::query(
            r#"
            UPDATE openworkflow.step_attempts s
               SET status = 'failed',
                   error = $5,
                   finished_at = now(),
                   updated_at = now()
              FROM openworkflow.workflow_runs w
             WHERE s.namespace_id = $1 AND s.workflow_run_id = $2 AND s.id = $3
               AND w.namespace_id = s.namespace_id AND w.id = s.workflow_run_id
               AND w.worker_id = $4 AND w.status = 'running'
            RETURNING s.*
            "#,
        )
        .bind(namespace_id)
        .bind(run_id)
        .bind(step_attempt_id)
        .bind(worker_id)
        .bind(error_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref()
            .map(row_to_step_attempt)
            .transpose()?
            .ok_or(BackendError::GuardMismatch)
    }
}

#[cfg(test)]
mod tests {
    // Exercising PostgresBackend requires a live Postgres instance; the
    // shared scenario suite in `tests/scenarios.rs` instead runs against
    // `InMemoryBackend`. These tests would be gated behind a
    // `DATABASE_URL` env var in CI.
}
