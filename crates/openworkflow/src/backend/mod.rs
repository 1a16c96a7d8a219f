//! The backend port: an abstract contract over a transactional store.
//!
//! This module provides:
//! - [`Backend`] - the trait every store implementation satisfies
//! - [`InMemoryBackend`] - for tests, no database required
//! - [`PostgresBackend`] / [`SqliteBackend`] - reference relational backends
//!
//! Every state-changing operation is a single atomic write whose `WHERE`
//! clause doubles as its precondition; a precondition miss surfaces as
//! [`BackendError::GuardMismatch`], never as a partial write.

mod memory;
pub mod migrations;
mod postgres;
mod sqlite;

pub use memory::InMemoryBackend;
pub use postgres::PostgresBackend;
pub use sqlite::{open_sqlite_pool, SqliteBackend};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BackendError, SerializedError};
use crate::model::{StepAttempt, StepKind, WorkflowRun};
use crate::pagination::{Page, Pagination};

/// Parameters for [`Backend::create_workflow_run`].
#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowRun {
    pub workflow_name: String,
    pub version: Option<String>,
    pub idempotency_key: Option<String>,
    pub config: serde_json::Value,
    pub context: serde_json::Value,
    pub input: serde_json::Value,
    pub available_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

/// Parameters for [`Backend::create_step_attempt`].
#[derive(Debug, Clone)]
pub struct CreateStepAttempt {
    pub step_name: String,
    pub kind: StepKind,
    pub config: serde_json::Value,
    pub context: serde_json::Value,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Apply every migration block with an index greater than the store's
    /// recorded `_migrations` version. Idempotent: safe to call on every
    /// process start.
    async fn migrate(&self) -> Result<(), BackendError>;

    // === Workflow run operations =======================================

    async fn create_workflow_run(
        &self,
        namespace_id: &str,
        params: CreateWorkflowRun,
    ) -> Result<WorkflowRun, BackendError>;

    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: Uuid,
    ) -> Result<Option<WorkflowRun>, BackendError>;

    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRun>, BackendError>;

    /// Atomically expire deadline-passed rows, then claim at most one
    /// eligible row under `worker_id` with a fresh lease.
    async fn claim_workflow_run(
        &self,
        namespace_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<Option<WorkflowRun>, BackendError>;

    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, BackendError>;

    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
    ) -> Result<WorkflowRun, BackendError>;

    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
    ) -> Result<WorkflowRun, BackendError>;

    /// Terminal-failure intent: the engine has already decided not to retry.
    async fn fail_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError>;

    /// Retry-failure intent: reschedule to `pending` after a step failure.
    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError>;

    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowRun, BackendError>;

    // === Step attempt operations ========================================

    async fn create_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        params: CreateStepAttempt,
    ) -> Result<StepAttempt, BackendError>;

    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        id: Uuid,
    ) -> Result<Option<StepAttempt>, BackendError>;

    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<StepAttempt>, BackendError>;

    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        output: Option<serde_json::Value>,
    ) -> Result<StepAttempt, BackendError>;

    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<StepAttempt, BackendError>;
}
