//! An in-process [`Backend`] backed by `parking_lot`-guarded maps. No
//! database, no migrations beyond clearing state; exists for the scenario
//! test suite and for callers who want to try a workflow definition before
//! wiring up Postgres or SQLite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::backend::{Backend, CreateStepAttempt, CreateWorkflowRun};
use crate::error::{BackendError, SerializedError};
use crate::model::{StepAttempt, StepAttemptStatus, StepKind, WorkflowRun, WorkflowRunStatus};
use crate::pagination::{Page, Pagination};

#[derive(Default)]
struct Namespace {
    runs: HashMap<Uuid, WorkflowRun>,
    steps: HashMap<Uuid, StepAttempt>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_forward(mut items: Vec<WorkflowRun>) -> Vec<WorkflowRun> {
    items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    items
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn migrate(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_workflow_run(
        &self,
        namespace_id: &str,
        params: CreateWorkflowRun,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let run = WorkflowRun {
            namespace_id: namespace_id.to_string(),
            id: Uuid::now_v7(),
            workflow_name: params.workflow_name,
            version: params.version,
            status: WorkflowRunStatus::Pending,
            idempotency_key: params.idempotency_key,
            config: params.config,
            context: params.context,
            input: params.input,
            output: None,
            error: None,
            attempts: 0,
            parent_step_attempt_namespace_id: None,
            parent_step_attempt_id: None,
            worker_id: None,
            available_at: Some(params.available_at.unwrap_or(now)),
            deadline_at: params.deadline_at,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };

        let mut namespaces = self.namespaces.write();
        let ns = namespaces.entry(namespace_id.to_string()).or_default();
        ns.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_workflow_run(
        &self,
        namespace_id: &str,
        id: Uuid,
    ) -> Result<Option<WorkflowRun>, BackendError> {
        let namespaces = self.namespaces.read();
        Ok(namespaces
            .get(namespace_id)
            .and_then(|ns| ns.runs.get(&id))
            .cloned())
    }

    async fn list_workflow_runs(
        &self,
        namespace_id: &str,
        pagination: Pagination,
    ) -> Result<Page<WorkflowRun>, BackendError> {
        let namespaces = self.namespaces.read();
        let mut items: Vec<WorkflowRun> = namespaces
            .get(namespace_id)
            .map(|ns| ns.runs.values().cloned().collect())
            .unwrap_or_default();
        items = sorted_forward(items);

        let backward = pagination.is_backward();
        if backward {
            items.reverse();
        }

        let cursor = if backward {
            pagination.before.clone()
        } else {
            pagination.after.clone()
        };

        if let Some(c) = &cursor {
            items.retain(|r| {
                if backward {
                    (r.created_at, r.id) < (c.created_at, c.id)
                } else {
                    (r.created_at, r.id) > (c.created_at, c.id)
                }
            });
        }

        let limit = pagination.limit.max(1) as usize;
        items.truncate(limit + 1);
        Ok(Page::from_rows(items, pagination.limit.max(1), backward, cursor.is_some()))
    }

    async fn claim_workflow_run(
        &self,
        namespace_id: &str,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<Option<WorkflowRun>, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let ns = namespaces.entry(namespace_id.to_string()).or_default();

        for run in ns.runs.values_mut() {
            if matches!(
                run.status,
                WorkflowRunStatus::Pending | WorkflowRunStatus::Running | WorkflowRunStatus::Sleeping
            ) {
                if let Some(deadline) = run.deadline_at {
                    if deadline <= now {
                        run.status = WorkflowRunStatus::Failed;
                        run.error = Some(SerializedError::deadline_exceeded());
                        run.worker_id = None;
                        run.available_at = None;
                        run.finished_at = Some(now);
                        run.updated_at = now;
                    }
                }
            }
        }

        let mut candidates: Vec<&mut WorkflowRun> = ns
            .runs
            .values_mut()
            .filter(|r| {
                matches!(
                    r.status,
                    WorkflowRunStatus::Pending | WorkflowRunStatus::Running | WorkflowRunStatus::Sleeping
                ) && r.available_at.map(|a| a <= now).unwrap_or(false)
                    && r.deadline_at.map(|d| d > now).unwrap_or(true)
            })
            .collect();

        candidates.sort_by(|a, b| {
            let a_key = (a.status != WorkflowRunStatus::Pending, a.available_at, a.created_at, a.id);
            let b_key = (b.status != WorkflowRunStatus::Pending, b.available_at, b.created_at, b.id);
            a_key.cmp(&b_key)
        });

        let Some(run) = candidates.into_iter().next() else {
            return Ok(None);
        };

        run.status = WorkflowRunStatus::Running;
        run.worker_id = Some(worker_id.to_string());
        run.available_at = Some(now + chrono::Duration::milliseconds(lease_duration_ms));
        run.started_at = run.started_at.or(Some(now));
        run.attempts += 1;
        run.updated_at = now;

        Ok(Some(run.clone()))
    }

    async fn extend_workflow_run_lease(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        lease_duration_ms: i64,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::GuardMismatch)?;

        if run.status != WorkflowRunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(BackendError::GuardMismatch);
        }
        run.available_at = Some(now + chrono::Duration::milliseconds(lease_duration_ms));
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn sleep_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
    ) -> Result<WorkflowRun, BackendError> {
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::GuardMismatch)?;

        if run.worker_id.as_deref() != Some(worker_id) || run.status.is_terminal() {
            return Err(BackendError::GuardMismatch);
        }
        run.status = WorkflowRunStatus::Sleeping;
        run.available_at = Some(available_at);
        run.worker_id = None;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn complete_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        output: serde_json::Value,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::GuardMismatch)?;

        if run.status != WorkflowRunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(BackendError::GuardMismatch);
        }
        run.status = WorkflowRunStatus::Completed;
        run.output = Some(output);
        run.worker_id = None;
        run.available_at = None;
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn fail_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::GuardMismatch)?;

        if run.status != WorkflowRunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(BackendError::GuardMismatch);
        }
        run.status = WorkflowRunStatus::Failed;
        run.error = Some(error);
        run.worker_id = None;
        run.available_at = None;
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn reschedule_workflow_run_after_failed_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        available_at: DateTime<Utc>,
        error: SerializedError,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::GuardMismatch)?;

        if run.status != WorkflowRunStatus::Running || run.worker_id.as_deref() != Some(worker_id) {
            return Err(BackendError::GuardMismatch);
        }
        run.status = WorkflowRunStatus::Pending;
        run.available_at = Some(available_at);
        run.worker_id = None;
        run.started_at = None;
        run.error = Some(error);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn cancel_workflow_run(
        &self,
        namespace_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowRun, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let run = namespaces
            .get_mut(namespace_id)
            .and_then(|ns| ns.runs.get_mut(&run_id))
            .ok_or(BackendError::NotFound)?;

        if run.status == WorkflowRunStatus::Canceled {
            return Ok(run.clone());
        }
        if run.status.is_terminal() {
            return Err(BackendError::AlreadyTerminal);
        }
        run.status = WorkflowRunStatus::Canceled;
        run.worker_id = None;
        run.available_at = None;
        run.finished_at = Some(now);
        run.updated_at = now;
        Ok(run.clone())
    }

    async fn create_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        worker_id: &str,
        params: CreateStepAttempt,
    ) -> Result<StepAttempt, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let ns = namespaces.entry(namespace_id.to_string()).or_default();

        let owned = ns
            .runs
            .get(&run_id)
            .map(|r| r.status == WorkflowRunStatus::Running && r.worker_id.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !owned {
            return Err(BackendError::GuardMismatch);
        }

        let step = StepAttempt {
            namespace_id: namespace_id.to_string(),
            id: Uuid::now_v7(),
            workflow_run_id: run_id,
            step_name: params.step_name,
            kind: params.kind,
            status: StepAttemptStatus::Running,
            config: params.config,
            context: params.context,
            output: None,
            error: None,
            child_workflow_run_namespace_id: None,
            child_workflow_run_id: None,
            started_at: Some(now),
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        ns.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        id: Uuid,
    ) -> Result<Option<StepAttempt>, BackendError> {
        let namespaces = self.namespaces.read();
        Ok(namespaces
            .get(namespace_id)
            .and_then(|ns| ns.steps.get(&id))
            .filter(|s| s.workflow_run_id == run_id)
            .cloned())
    }

    async fn list_step_attempts(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<StepAttempt>, BackendError> {
        let namespaces = self.namespaces.read();
        let mut items: Vec<StepAttempt> = namespaces
            .get(namespace_id)
            .map(|ns| {
                ns.steps
                    .values()
                    .filter(|s| s.workflow_run_id == run_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        let backward = pagination.is_backward();
        if backward {
            items.reverse();
        }
        let cursor = if backward {
            pagination.before.clone()
        } else {
            pagination.after.clone()
        };
        if let Some(c) = &cursor {
            items.retain(|s| {
                if backward {
                    (s.created_at, s.id) < (c.created_at, c.id)
                } else {
                    (s.created_at, s.id) > (c.created_at, c.id)
                }
            });
        }
        let limit = pagination.limit.max(1) as usize;
        items.truncate(limit + 1);
        Ok(Page::from_rows(items, pagination.limit.max(1), backward, cursor.is_some()))
    }

    async fn complete_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        output: Option<serde_json::Value>,
    ) -> Result<StepAttempt, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let ns = namespaces
            .get_mut(namespace_id)
            .ok_or(BackendError::GuardMismatch)?;

        let owned = ns
            .runs
            .get(&run_id)
            .map(|r| r.status == WorkflowRunStatus::Running && r.worker_id.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !owned {
            return Err(BackendError::GuardMismatch);
        }

        let step = ns
            .steps
            .get_mut(&step_attempt_id)
            .filter(|s| s.workflow_run_id == run_id)
            .ok_or(BackendError::GuardMismatch)?;
        step.status = StepAttemptStatus::Completed;
        step.output = output;
        step.finished_at = Some(now);
        step.updated_at = now;
        Ok(step.clone())
    }

    async fn fail_step_attempt(
        &self,
        namespace_id: &str,
        run_id: Uuid,
        step_attempt_id: Uuid,
        worker_id: &str,
        error: SerializedError,
    ) -> Result<StepAttempt, BackendError> {
        let now = Utc::now();
        let mut namespaces = self.namespaces.write();
        let ns = namespaces
            .get_mut(namespace_id)
            .ok_or(BackendError::GuardMismatch)?;

        let owned = ns
            .runs
            .get(&run_id)
            .map(|r| r.status == WorkflowRunStatus::Running && r.worker_id.as_deref() == Some(worker_id))
            .unwrap_or(false);
        if !owned {
            return Err(BackendError::GuardMismatch);
        }

        let step = ns
            .steps
            .get_mut(&step_attempt_id)
            .filter(|s| s.workflow_run_id == run_id)
            .ok_or(BackendError::GuardMismatch)?;
        step.status = StepAttemptStatus::Failed;
        step.error = Some(error);
        step.finished_at = Some(now);
        step.updated_at = now;
        Ok(step.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CreateWorkflowRun;

    #[tokio::test]
    async fn claim_is_exclusive_across_concurrent_callers() {
        let backend = InMemoryBackend::new();
        backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "test".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let a = backend.claim_workflow_run("ns", "worker-a", 30_000).await.unwrap();
        let b = backend.claim_workflow_run("ns", "worker-b", 30_000).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_once_canceled() {
        let backend = InMemoryBackend::new();
        let run = backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "test".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = backend.cancel_workflow_run("ns", run.id).await.unwrap();
        let second = backend.cancel_workflow_run("ns", run.id).await.unwrap();
        assert_eq!(first.status, WorkflowRunStatus::Canceled);
        assert_eq!(second.status, WorkflowRunStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_rejects_already_completed_run() {
        let backend = InMemoryBackend::new();
        let run = backend
            .create_workflow_run(
                "ns",
                CreateWorkflowRun {
                    workflow_name: "test".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let claimed = backend.claim_workflow_run("ns", "worker-a", 30_000).await.unwrap().unwrap();
        backend
            .complete_workflow_run("ns", claimed.id, "worker-a", serde_json::json!({}))
            .await
            .unwrap();

        let err = backend.cancel_workflow_run("ns", run.id).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyTerminal));
    }
}
