//! The worker pool: a fixed set of worker-id slots that poll for claimable
//! runs, execute them through the engine, and heartbeat their lease while
//! they run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::engine::{execute_pass, EngineError};
use crate::error::SerializedError;
use crate::registry::WorkflowRegistry;
use crate::worker::poller::{Poller, PollerConfig};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub lease_duration_ms: i64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            lease_duration_ms: 30_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("timed out waiting for in-flight executions to drain")]
    ShutdownTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    backend: Arc<dyn Backend>,
    registry: Arc<RwLock<WorkflowRegistry>>,
    namespace_id: String,
    config: WorkerPoolConfig,
    slot_ids: Vec<String>,
    busy_slots: Mutex<HashSet<usize>>,
    poller: Poller,
}

/// `{stopped -> starting -> running -> stopping -> stopped}`. Only one
/// `start`/`stop` is active at a time; both are enforced by `status`.
pub struct WorkerPool {
    inner: Arc<Inner>,
    status: Arc<Mutex<WorkerPoolStatus>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    in_flight: Arc<Mutex<JoinSet<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<RwLock<WorkflowRegistry>>,
        namespace_id: impl Into<String>,
        config: WorkerPoolConfig,
    ) -> Self {
        let slot_ids = (0..config.concurrency)
            .map(|_| Uuid::now_v7().to_string())
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                namespace_id: namespace_id.into(),
                config,
                slot_ids,
                busy_slots: Mutex::new(HashSet::new()),
                poller: Poller::new(PollerConfig::default()),
            }),
            status: Arc::new(Mutex::new(WorkerPoolStatus::Stopped)),
            poll_handle: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(JoinSet::new())),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.lock()
    }

    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }
        self.shutdown_tx.send_replace(false);

        let inner = self.inner.clone();
        let in_flight = self.in_flight.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let status = self.status.clone();

        let handle = tokio::spawn(async move {
            *status.lock() = WorkerPoolStatus::Running;
            poll_loop(inner, in_flight, &mut shutdown_rx).await;
        });
        *self.poll_handle.lock() = Some(handle);

        info!(concurrency = self.inner.config.concurrency, "worker pool started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.lock();
            if *status != WorkerPoolStatus::Running {
                return Err(WorkerPoolError::NotRunning);
            }
            *status = WorkerPoolStatus::Stopping;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut in_flight = self.in_flight.lock();
        while in_flight.join_next().await.is_some() {}

        *self.status.lock() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }
}

async fn poll_loop(inner: Arc<Inner>, in_flight: Arc<Mutex<JoinSet<()>>>, shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let free_slots: Vec<usize> = {
            let busy = inner.busy_slots.lock();
            (0..inner.slot_ids.len()).filter(|i| !busy.contains(i)).collect()
        };

        if free_slots.is_empty() {
            inner.poller.idle_backoff().await;
            continue;
        }

        let claims = join_all(free_slots.into_iter().map(|idx| {
            let inner = inner.clone();
            async move {
                let worker_id = inner.slot_ids[idx].clone();
                match inner
                    .backend
                    .claim_workflow_run(&inner.namespace_id, &worker_id, inner.config.lease_duration_ms)
                    .await
                {
                    Ok(Some(run)) => Some((idx, run)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(error = %e, "transient error claiming a workflow run");
                        None
                    }
                }
            }
        }))
        .await;

        let mut claimed_any = false;
        for (idx, run) in claims.into_iter().flatten() {
            claimed_any = true;
            inner.busy_slots.lock().insert(idx);

            let inner = inner.clone();
            in_flight.lock().spawn(async move {
                execute_claimed_run(&inner, idx, run).await;
                inner.busy_slots.lock().remove(&idx);
            });
        }

        if !claimed_any {
            inner.poller.idle_backoff().await;
        }
    }
}

#[instrument(skip(inner, run), fields(run_id = %run.id, workflow = %run.workflow_name, slot = idx))]
async fn execute_claimed_run(inner: &Inner, idx: usize, run: crate::model::WorkflowRun) {
    let worker_id = inner.slot_ids[idx].clone();

    let workflow_fn = {
        let registry = inner.registry.read();
        registry.lookup(&run.workflow_name, run.version.as_deref())
    };

    let workflow_fn = match workflow_fn {
        Ok(f) => f,
        Err(_) => {
            let message = format!(
                "Workflow {}(version:{}) is not registered",
                run.workflow_name,
                run.version.as_deref().unwrap_or("none")
            );
            if let Err(e) = inner
                .backend
                .fail_workflow_run(&inner.namespace_id, run.id, &worker_id, SerializedError::new(message))
                .await
            {
                error!(error = %e, "failed to fail an unregistered run");
            }
            return;
        }
    };

    let heartbeat = spawn_heartbeat(inner, run.id, worker_id.clone());

    match execute_pass(&inner.backend, &inner.namespace_id, run, &worker_id, &workflow_fn).await {
        Ok(_) => {}
        Err(EngineError::Aborted) => {
            info!("execution pass aborted, lease already lost");
        }
        Err(e) => {
            error!(error = %e, "execution pass failed");
        }
    }

    heartbeat.abort();
}

fn spawn_heartbeat(inner: &Inner, run_id: Uuid, worker_id: String) -> JoinHandle<()> {
    let backend = inner.backend.clone();
    let namespace_id = inner.namespace_id.clone();
    let lease_duration_ms = inner.config.lease_duration_ms;
    let interval = std::time::Duration::from_millis((lease_duration_ms / 2).max(1) as u64);

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = backend
                .extend_workflow_run_lease(&namespace_id, run_id, &worker_id, lease_duration_ms)
                .await
            {
                warn!(error = %e, "heartbeat failed to extend lease");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CreateWorkflowRun, InMemoryBackend};
    use crate::engine::{StepConfig, WorkflowContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn start_stop_is_idempotent_against_misuse() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(RwLock::new(WorkflowRegistry::new()));
        let pool = WorkerPool::new(backend, registry, "default", WorkerPoolConfig {
            concurrency: 2,
            lease_duration_ms: 30_000,
        });

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));
        pool.stop().await.unwrap();
        assert!(matches!(pool.stop().await, Err(WorkerPoolError::NotRunning)));
    }

    #[tokio::test]
    async fn runs_drain_through_a_registered_workflow() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(RwLock::new(WorkflowRegistry::new()));
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_clone = executed.clone();

        registry
            .write()
            .register(
                "count",
                None,
                Arc::new(move |mut ctx: WorkflowContext| {
                    let executed = executed_clone.clone();
                    Box::pin(async move {
                        ctx.step
                            .run(StepConfig::new("bump"), || async move {
                                executed.fetch_add(1, Ordering::SeqCst);
                                Ok::<_, anyhow::Error>(())
                            })
                            .await?;
                        Ok(serde_json::json!({}))
                    })
                }),
            )
            .unwrap();

        backend
            .create_workflow_run(
                "default",
                CreateWorkflowRun {
                    workflow_name: "count".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let pool = WorkerPool::new(backend.clone(), registry, "default", WorkerPoolConfig {
            concurrency: 1,
            lease_duration_ms: 30_000,
        });
        pool.start().unwrap();

        for _ in 0..50 {
            if executed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        pool.stop().await.unwrap();

        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }
}
