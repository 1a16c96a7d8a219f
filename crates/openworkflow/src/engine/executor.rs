//! Given a claimed run and its registered function, replays step history,
//! advances due sleeps, invokes the function, and persists exactly one
//! terminal or suspending transition.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::engine::step::{Step, WorkflowControl};
use crate::error::BackendError;
use crate::model::{StepAttemptStatus, StepKind, WorkflowRun};
use crate::pagination::{Cursor, Pagination};

/// The object passed to a registered workflow function: its raw JSON input,
/// the run's optional version selector, and the step API.
pub struct WorkflowContext {
    pub input: serde_json::Value,
    pub version: Option<String>,
    pub step: Step,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A type-erased, registry-held workflow function: JSON in, JSON out.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<serde_json::Value, WorkflowControl>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("workflow {0} is not registered")]
    NotRegistered(String),

    /// The run's lease was lost mid-pass; the caller releases the slot and
    /// writes nothing further.
    #[error("execution pass aborted: lease lost")]
    Aborted,
}

const STEP_HISTORY_PAGE_SIZE: u32 = 1000;

/// Run one execution pass of `run` under `worker_id`, returning the run's
/// state after exactly one terminal or suspending backend write (or
/// [`EngineError::Aborted`] if the lease was lost before any write landed).
#[instrument(skip(backend, run, workflow_fn), fields(run_id = %run.id, workflow = %run.workflow_name))]
pub async fn execute_pass(
    backend: &Arc<dyn Backend>,
    namespace_id: &str,
    run: WorkflowRun,
    worker_id: &str,
    workflow_fn: &WorkflowFn,
) -> Result<WorkflowRun, EngineError> {
    let mut attempts = load_step_history(backend, namespace_id, run.id).await?;
    advance_due_sleeps(backend, namespace_id, &run, worker_id, &mut attempts).await?;

    if let Some(resume_at) = pending_sleep(&attempts) {
        info!(%resume_at, "run still sleeping, re-asserting suspension");
        return backend
            .sleep_workflow_run(namespace_id, run.id, worker_id, resume_at)
            .await
            .map_err(Into::into);
    }

    let (cache, failed_counts) = build_step_cache(&attempts);
    let step = Step::new(
        backend.clone(),
        namespace_id.to_string(),
        run.id,
        worker_id.to_string(),
        cache,
        failed_counts,
    );
    let context = WorkflowContext {
        input: run.input.clone(),
        version: run.version.clone(),
        step,
    };

    let outcome = (workflow_fn)(context).await;
    resolve_outcome(backend, namespace_id, &run, worker_id, outcome).await
}

async fn load_step_history(
    backend: &Arc<dyn Backend>,
    namespace_id: &str,
    run_id: Uuid,
) -> Result<Vec<crate::model::StepAttempt>, EngineError> {
    let mut attempts = Vec::new();
    let mut pagination = Pagination::new(STEP_HISTORY_PAGE_SIZE);

    loop {
        let page = backend
            .list_step_attempts(namespace_id, run_id, pagination)
            .await?;
        let last = page.items.last().map(|a| Cursor::new(a.created_at, a.id));
        attempts.extend(page.items);

        if !page.has_next {
            break;
        }
        pagination = Pagination::new(STEP_HISTORY_PAGE_SIZE).after(last.expect("has_next implies a last item"));
    }

    Ok(attempts)
}

/// For every `running` sleep attempt whose `resumeAt` has passed, mark it
/// completed in place. Leaves attempts whose `resumeAt` is still in the
/// future untouched; [`pending_sleep`] reports those back to the caller.
async fn advance_due_sleeps(
    backend: &Arc<dyn Backend>,
    namespace_id: &str,
    run: &WorkflowRun,
    worker_id: &str,
    attempts: &mut [crate::model::StepAttempt],
) -> Result<(), EngineError> {
    let now = Utc::now();
    for attempt in attempts.iter_mut() {
        if attempt.kind != StepKind::Sleep || attempt.status != StepAttemptStatus::Running {
            continue;
        }
        let Some(resume_at) = attempt.resume_at() else {
            warn!(step_name = %attempt.step_name, "sleep attempt missing resumeAt, leaving as-is");
            continue;
        };
        if now < resume_at {
            continue;
        }
        let completed = backend
            .complete_step_attempt(namespace_id, run.id, attempt.id, worker_id, None)
            .await?;
        *attempt = completed;
    }
    Ok(())
}

fn pending_sleep(attempts: &[crate::model::StepAttempt]) -> Option<chrono::DateTime<Utc>> {
    attempts
        .iter()
        .find(|a| a.kind == StepKind::Sleep && a.status == StepAttemptStatus::Running)
        .and_then(|a| a.resume_at())
}

fn build_step_cache(
    attempts: &[crate::model::StepAttempt],
) -> (
    HashMap<String, crate::model::StepAttempt>,
    HashMap<String, u32>,
) {
    let mut cache = HashMap::new();
    let mut failed_counts = HashMap::new();

    for attempt in attempts {
        match attempt.status {
            StepAttemptStatus::Completed => {
                cache.insert(attempt.step_name.clone(), attempt.clone());
            }
            StepAttemptStatus::Failed => {
                *failed_counts.entry(attempt.step_name.clone()).or_insert(0) += 1;
            }
            StepAttemptStatus::Running => {}
        }
    }

    (cache, failed_counts)
}

async fn resolve_outcome(
    backend: &Arc<dyn Backend>,
    namespace_id: &str,
    run: &WorkflowRun,
    worker_id: &str,
    outcome: Result<serde_json::Value, WorkflowControl>,
) -> Result<WorkflowRun, EngineError> {
    match outcome {
        Ok(output) => backend
            .complete_workflow_run(namespace_id, run.id, worker_id, output)
            .await
            .map_err(Into::into),

        Err(WorkflowControl::Sleeping { resume_at }) => backend
            .sleep_workflow_run(namespace_id, run.id, worker_id, resume_at)
            .await
            .map_err(Into::into),

        Err(WorkflowControl::StepFailed {
            attempt_error,
            failed_attempts,
            retry_policy,
            ..
        }) => {
            if !retry_policy.has_attempts_remaining(failed_attempts) {
                return backend
                    .fail_workflow_run(namespace_id, run.id, worker_id, attempt_error)
                    .await
                    .map_err(Into::into);
            }

            let delay = retry_policy.delay_for_attempt(failed_attempts);
            let available_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            if let Some(deadline) = run.deadline_at {
                if available_at >= deadline {
                    return backend
                        .fail_workflow_run(namespace_id, run.id, worker_id, attempt_error)
                        .await
                        .map_err(Into::into);
                }
            }

            backend
                .reschedule_workflow_run_after_failed_step_attempt(
                    namespace_id,
                    run.id,
                    worker_id,
                    available_at,
                    attempt_error,
                )
                .await
                .map_err(Into::into)
        }

        Err(WorkflowControl::Aborted) => Err(EngineError::Aborted),
    }
}
