//! The client facade: `declareWorkflow`/`implementWorkflow`/`defineWorkflow`,
//! `runWorkflow`, and the `WorkflowRunHandle` returned by it.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::backend::{Backend, CreateWorkflowRun};
use crate::duration::DurationParseError;
use crate::engine::{Step, WorkflowContext, WorkflowControl, WorkflowFn};
use crate::error::{BackendError, SerializedError};
use crate::model::WorkflowRunStatus;
use crate::registry::{RegistryError, WorkflowRegistry};
use crate::schema::{InputSchema, SchemaIssues};

const RESULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(1);
const RESULT_POLL_TIMEOUT: StdDuration = StdDuration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Schema(#[from] SchemaIssues),

    #[error(transparent)]
    Duration(#[from] DurationParseError),

    #[error("workflow {0} is already registered")]
    DuplicateRegistration(String),

    #[error("output deserialization failed: {0}")]
    OutputDeserialization(String),

    #[error("workflow {workflow_name} run {run_id} failed: {error}")]
    WorkflowFailed {
        workflow_name: String,
        run_id: Uuid,
        error: SerializedError,
    },

    #[error("workflow {workflow_name} run {run_id} was canceled")]
    WorkflowCanceled { workflow_name: String, run_id: Uuid },

    #[error("timed out waiting for workflow {workflow_name} run {run_id} to finish")]
    Timeout { workflow_name: String, run_id: Uuid },
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateRegistration(key) => ClientError::DuplicateRegistration(key),
            RegistryError::UnknownWorkflowType(key) => ClientError::DuplicateRegistration(key),
        }
    }
}

/// A declared workflow: name, optional version, optional input schema, and
/// phantom input/output types. No side effects until `implement_workflow`.
pub struct WorkflowSpec<Input, Output> {
    pub name: String,
    pub version: Option<String>,
    pub schema: Option<Arc<dyn InputSchema>>,
    _marker: PhantomData<fn() -> (Input, Output)>,
}

impl<Input, Output> Clone for WorkflowSpec<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            schema: self.schema.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Input, Output> WorkflowSpec<Input, Output> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            schema: None,
            _marker: PhantomData,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn InputSchema>) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// The typed context handed to a registered workflow function: `Input` has
/// already been parsed out of the run's raw JSON.
pub struct TypedWorkflowContext<Input> {
    pub input: Input,
    pub version: Option<String>,
    pub step: Step,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub deadline_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    namespace_id: String,
    registry: Arc<RwLock<WorkflowRegistry>>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            namespace_id: "default".to_string(),
            registry: Arc::new(RwLock::new(WorkflowRegistry::new())),
        }
    }

    pub fn with_namespace(mut self, namespace_id: impl Into<String>) -> Self {
        self.namespace_id = namespace_id.into();
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    /// The registry backing this client's `declare_workflow`/`implement_workflow`
    /// calls, shared so a [`crate::worker::WorkerPool`] can be built from the
    /// same set of registered workflows.
    pub fn registry(&self) -> Arc<RwLock<WorkflowRegistry>> {
        self.registry.clone()
    }

    pub fn declare_workflow<Input, Output>(&self, name: impl Into<String>) -> WorkflowSpec<Input, Output> {
        WorkflowSpec::new(name)
    }

    /// Registers `f` under `spec.name`/`spec.version`. Fails if the key is
    /// already registered.
    pub fn implement_workflow<Input, Output, F, Fut>(
        &self,
        spec: &WorkflowSpec<Input, Output>,
        f: F,
    ) -> Result<(), ClientError>
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        F: Fn(TypedWorkflowContext<Input>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, WorkflowControl>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapped: WorkflowFn = Arc::new(move |ctx: WorkflowContext| {
            let f = f.clone();
            Box::pin(async move {
                let input: Input =
                    serde_json::from_value(ctx.input).map_err(|_| WorkflowControl::Aborted)?;
                let typed_ctx = TypedWorkflowContext {
                    input,
                    version: ctx.version,
                    step: ctx.step,
                };
                let output = (f)(typed_ctx).await?;
                serde_json::to_value(output).map_err(|_| WorkflowControl::Aborted)
            })
        });

        self.registry
            .write()
            .register(&spec.name, spec.version.as_deref(), wrapped)
            .map_err(Into::into)
    }

    /// `declare_workflow` + `implement_workflow`, returning a handle whose
    /// `.run(...)` delegates to `run_workflow`.
    pub fn define_workflow<Input, Output, F, Fut>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> Result<WorkflowDefinition<Input, Output>, ClientError>
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        F: Fn(TypedWorkflowContext<Input>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, WorkflowControl>> + Send + 'static,
    {
        let spec = self.declare_workflow(name);
        self.implement_workflow(&spec, f)?;
        Ok(WorkflowDefinition {
            client: self.clone(),
            spec,
        })
    }

    /// Validates `input` through the spec's schema (if any), then inserts a
    /// `pending` run and returns a handle to await its outcome.
    #[instrument(skip(self, spec, input), fields(workflow = %spec.name))]
    pub async fn run_workflow<Input, Output>(
        &self,
        spec: &WorkflowSpec<Input, Output>,
        input: Input,
        opts: RunOptions,
    ) -> Result<WorkflowRunHandle<Output>, ClientError>
    where
        Input: Serialize,
        Output: DeserializeOwned,
    {
        let raw_input = serde_json::to_value(&input)
            .map_err(|e| ClientError::OutputDeserialization(e.to_string()))?;

        let validated = if let Some(schema) = &spec.schema {
            schema.validate(raw_input).await?
        } else {
            raw_input
        };

        let run = self
            .backend
            .create_workflow_run(
                &self.namespace_id,
                CreateWorkflowRun {
                    workflow_name: spec.name.clone(),
                    version: spec.version.clone(),
                    idempotency_key: None,
                    config: serde_json::json!({}),
                    context: serde_json::json!({}),
                    input: validated,
                    available_at: None,
                    deadline_at: opts.deadline_at,
                },
            )
            .await?;

        Ok(WorkflowRunHandle {
            backend: self.backend.clone(),
            namespace_id: self.namespace_id.clone(),
            workflow_name: spec.name.clone(),
            run_id: run.id,
            _marker: PhantomData,
        })
    }
}

pub struct WorkflowDefinition<Input, Output> {
    client: Client,
    spec: WorkflowSpec<Input, Output>,
}

impl<Input, Output> WorkflowDefinition<Input, Output>
where
    Input: Serialize,
    Output: DeserializeOwned,
{
    pub async fn run(&self, input: Input, opts: RunOptions) -> Result<WorkflowRunHandle<Output>, ClientError> {
        self.client.run_workflow(&self.spec, input, opts).await
    }

    pub fn spec(&self) -> &WorkflowSpec<Input, Output> {
        &self.spec
    }
}

/// A handle to a single enqueued run. `result()` polls until a terminal
/// status or a 5-minute timeout; `cancel()` requests cancellation.
pub struct WorkflowRunHandle<Output> {
    backend: Arc<dyn Backend>,
    namespace_id: String,
    workflow_name: String,
    run_id: Uuid,
    _marker: PhantomData<Output>,
}

impl<Output> WorkflowRunHandle<Output>
where
    Output: DeserializeOwned,
{
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn result(&self) -> Result<Output, ClientError> {
        let deadline = tokio::time::Instant::now() + RESULT_POLL_TIMEOUT;

        loop {
            let run = self
                .backend
                .get_workflow_run(&self.namespace_id, self.run_id)
                .await?
                .ok_or(BackendError::NotFound)?;

            match run.status {
                WorkflowRunStatus::Completed => {
                    let output = run.output.unwrap_or(serde_json::Value::Null);
                    return serde_json::from_value(output)
                        .map_err(|e| ClientError::OutputDeserialization(e.to_string()));
                }
                WorkflowRunStatus::Failed => {
                    return Err(ClientError::WorkflowFailed {
                        workflow_name: self.workflow_name.clone(),
                        run_id: self.run_id,
                        error: run.error.unwrap_or_else(SerializedError::deadline_exceeded),
                    });
                }
                WorkflowRunStatus::Canceled => {
                    return Err(ClientError::WorkflowCanceled {
                        workflow_name: self.workflow_name.clone(),
                        run_id: self.run_id,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    workflow_name: self.workflow_name.clone(),
                    run_id: self.run_id,
                });
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    pub async fn cancel(&self) -> Result<(), ClientError> {
        self.backend
            .cancel_workflow_run(&self.namespace_id, self.run_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[tokio::test]
    async fn happy_path_greeting_workflow_completes() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let client = Client::new(backend.clone());

        #[derive(serde::Serialize)]
        struct Input {
            name: String,
        }
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct Output {
            message: String,
        }

        let definition = client
            .define_workflow::<Input, Output, _, _>("greeting", |mut ctx: TypedWorkflowContext<Input>| async move {
                let message = ctx
                    .step
                    .run(crate::engine::StepConfig::new("generate-greeting"), || async move {
                        Ok::<_, anyhow::Error>(format!("Hello, {}!", ctx.input.name))
                    })
                    .await?;
                Ok(Output { message })
            })
            .unwrap();

        let handle = definition
            .run(
                Input {
                    name: "Alice".to_string(),
                },
                RunOptions::default(),
            )
            .await
            .unwrap();

        let claimed = backend
            .claim_workflow_run("default", "worker-1", 30_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, handle.run_id());

        let registry = client.registry();
        let workflow_fn = registry.read().lookup("greeting", None).unwrap();
        let result = crate::engine::execute_pass(&backend, "default", claimed, "worker-1", &workflow_fn)
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Completed);

        let output = handle.result().await.unwrap();
        assert_eq!(
            output,
            Output {
                message: "Hello, Alice!".to_string()
            }
        );
    }
}
