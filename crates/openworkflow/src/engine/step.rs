//! The Step API: the object handed to a running workflow function.
//!
//! `Step::run` and `Step::sleep` replace the source implementation's
//! exception-as-control-flow for suspension with ordinary `Result`
//! propagation. Both return `Result<T, WorkflowControl>`; the calling
//! workflow function threads them through with `?` exactly like any other
//! fallible call, and the executor interprets the resulting `Err` to decide
//! the run's next persisted state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::backend::{Backend, CreateStepAttempt};
use crate::duration::parse_duration_ms;
use crate::error::SerializedError;
use crate::model::{RetryPolicy, StepAttempt, StepKind};

/// Per-call step configuration: the logical name and an optional override of
/// the default retry policy.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    pub name: String,
    pub retry_policy: Option<RetryPolicy>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// The non-local exit carried by a suspended or failed step, propagated as
/// the `Err` arm of every `Step` call.
#[derive(Debug, Clone)]
pub enum WorkflowControl {
    /// The workflow function requested (directly or via a new `sleep` step)
    /// that the run suspend until `resume_at`.
    Sleeping { resume_at: DateTime<Utc> },
    /// A step body failed; the executor consults `retry_policy` against
    /// `failed_attempts` to decide between reschedule and terminal failure.
    StepFailed {
        step_name: String,
        attempt_error: SerializedError,
        failed_attempts: u32,
        retry_policy: RetryPolicy,
    },
    /// The step call could not be persisted because the run's lease is gone
    /// (a guarded write came back empty). Never constructed by workflow
    /// code; the executor turns this into a silent abort of the current
    /// pass, writing nothing.
    Aborted,
}

/// Memoizing handle to a run's step history, offering `run` and `sleep`.
pub struct Step {
    backend: Arc<dyn Backend>,
    namespace_id: String,
    run_id: Uuid,
    worker_id: String,
    cache: HashMap<String, StepAttempt>,
    failed_counts: HashMap<String, u32>,
}

impl Step {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        namespace_id: String,
        run_id: Uuid,
        worker_id: String,
        cache: HashMap<String, StepAttempt>,
        failed_counts: HashMap<String, u32>,
    ) -> Self {
        Self {
            backend,
            namespace_id,
            run_id,
            worker_id,
            cache,
            failed_counts,
        }
    }

    /// Run a named step once and memoize its output. `fn` is invoked only
    /// when no completed attempt for `config.name` exists yet.
    #[instrument(skip(self, body), fields(step_name = %config.name))]
    pub async fn run<T, Fut>(
        &mut self,
        config: StepConfig,
        body: impl FnOnce() -> Fut,
    ) -> Result<T, WorkflowControl>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        if let Some(attempt) = self.cache.get(&config.name) {
            let output = attempt.output.clone().unwrap_or(serde_json::Value::Null);
            return serde_json::from_value(output).map_err(|_| WorkflowControl::Aborted);
        }

        let created = self
            .backend
            .create_step_attempt(
                &self.namespace_id,
                self.run_id,
                &self.worker_id,
                CreateStepAttempt {
                    step_name: config.name.clone(),
                    kind: StepKind::Function,
                    config: serde_json::json!({ "name": config.name }),
                    context: serde_json::json!({}),
                },
            )
            .await
            .map_err(|_| WorkflowControl::Aborted)?;

        match body().await {
            Ok(value) => {
                let output = serde_json::to_value(&value).map_err(|e| {
                    WorkflowControl::StepFailed {
                        step_name: config.name.clone(),
                        attempt_error: SerializedError::from_display(e),
                        failed_attempts: *self.failed_counts.get(&config.name).unwrap_or(&0),
                        retry_policy: config.retry_policy.clone().unwrap_or_default(),
                    }
                })?;

                self.backend
                    .complete_step_attempt(
                        &self.namespace_id,
                        self.run_id,
                        created.id,
                        &self.worker_id,
                        Some(output),
                    )
                    .await
                    .map_err(|_| WorkflowControl::Aborted)?;

                Ok(value)
            }
            Err(error) => {
                let serialized = SerializedError::from_anyhow(&error);
                self.backend
                    .fail_step_attempt(
                        &self.namespace_id,
                        self.run_id,
                        created.id,
                        &self.worker_id,
                        serialized.clone(),
                    )
                    .await
                    .map_err(|_| WorkflowControl::Aborted)?;

                let failed_attempts = self.failed_counts.entry(config.name.clone()).or_insert(0);
                *failed_attempts += 1;

                Err(WorkflowControl::StepFailed {
                    step_name: config.name,
                    attempt_error: serialized,
                    failed_attempts: *failed_attempts,
                    retry_policy: config.retry_policy.unwrap_or_default(),
                })
            }
        }
    }

    /// Suspend the run until `now() + duration`. Memoized like `run`: once
    /// the sleep step has a completed attempt, this returns immediately.
    #[instrument(skip(self))]
    pub async fn sleep(&mut self, name: &str, duration: &str) -> Result<(), WorkflowControl> {
        if self.cache.contains_key(name) {
            return Ok(());
        }

        let millis = parse_duration_ms(duration).map_err(|e| WorkflowControl::StepFailed {
            step_name: name.to_string(),
            attempt_error: SerializedError::from_display(e),
            failed_attempts: 0,
            retry_policy: RetryPolicy::default(),
        })?;
        let resume_at = Utc::now() + chrono::Duration::milliseconds(millis);

        self.backend
            .create_step_attempt(
                &self.namespace_id,
                self.run_id,
                &self.worker_id,
                CreateStepAttempt {
                    step_name: name.to_string(),
                    kind: StepKind::Sleep,
                    config: serde_json::json!({ "name": name }),
                    context: serde_json::json!({
                        "kind": "sleep",
                        "resumeAt": resume_at.to_rfc3339(),
                    }),
                },
            )
            .await
            .map_err(|_| WorkflowControl::Aborted)?;

        Err(WorkflowControl::Sleeping { resume_at })
    }
}
