//! A durable workflow execution engine: a library plus worker runtime that
//! runs user-defined multi-step functions such that each step completes at
//! most once and an entire run survives process crashes by resuming from its
//! last persisted step.
//!
//! The store (Postgres or SQLite) is the sole source of truth and
//! coordination medium between workers; see [`backend`] for the port and its
//! concrete implementations, [`engine`] for the replay/execution pass, and
//! [`client`] for the facade most callers start from.

pub mod backend;
pub mod client;
pub mod duration;
pub mod engine;
pub mod error;
pub mod model;
pub mod pagination;
pub mod registry;
pub mod schema;
pub mod worker;

pub mod prelude {
    pub use crate::backend::{Backend, InMemoryBackend, PostgresBackend, SqliteBackend};
    pub use crate::client::{Client, RunOptions, TypedWorkflowContext, WorkflowDefinition, WorkflowRunHandle, WorkflowSpec};
    pub use crate::duration::parse_duration_ms;
    pub use crate::engine::{StepConfig, WorkflowControl};
    pub use crate::error::SerializedError;
    pub use crate::model::{RetryPolicy, WorkflowRun, WorkflowRunStatus};
    pub use crate::registry::WorkflowRegistry;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
}
