//! PostgreSQL migration blocks. Dense array: block `N` (1-based) is applied
//! only if the `_migrations` table's recorded version is `< N`.

pub const SCHEMA_NAME: &str = "openworkflow";

pub const BLOCKS: &[&str] = &[
    // 1: schema + workflow_runs
    r#"
    CREATE SCHEMA IF NOT EXISTS openworkflow;

    CREATE TABLE IF NOT EXISTS openworkflow.workflow_runs (
        namespace_id TEXT NOT NULL,
        id UUID NOT NULL,
        workflow_name TEXT NOT NULL,
        version TEXT,
        status TEXT NOT NULL,
        idempotency_key TEXT,
        config JSONB NOT NULL DEFAULT '{}'::jsonb,
        context JSONB NOT NULL DEFAULT '{}'::jsonb,
        input JSONB NOT NULL DEFAULT '{}'::jsonb,
        output JSONB,
        error JSONB,
        attempts INTEGER NOT NULL DEFAULT 0,
        parent_step_attempt_namespace_id TEXT,
        parent_step_attempt_id UUID,
        worker_id TEXT,
        available_at TIMESTAMPTZ,
        deadline_at TIMESTAMPTZ,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (namespace_id, id)
    );
    "#,
    // 2: step_attempts
    r#"
    CREATE TABLE IF NOT EXISTS openworkflow.step_attempts (
        namespace_id TEXT NOT NULL,
        id UUID NOT NULL,
        workflow_run_id UUID NOT NULL,
        step_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        config JSONB NOT NULL DEFAULT '{}'::jsonb,
        context JSONB NOT NULL DEFAULT '{}'::jsonb,
        output JSONB,
        error JSONB,
        child_workflow_run_namespace_id TEXT,
        child_workflow_run_id UUID,
        started_at TIMESTAMPTZ,
        finished_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (namespace_id, id),
        FOREIGN KEY (namespace_id, workflow_run_id)
            REFERENCES openworkflow.workflow_runs (namespace_id, id)
            ON DELETE CASCADE
    );
    "#,
    // 3: indexes
    r#"
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_scheduler
        ON openworkflow.workflow_runs (namespace_id, status, available_at, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_idempotency
        ON openworkflow.workflow_runs (namespace_id, workflow_name, idempotency_key, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_created
        ON openworkflow.workflow_runs (namespace_id, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_status_created
        ON openworkflow.workflow_runs (namespace_id, status, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_name_status_created
        ON openworkflow.workflow_runs (namespace_id, workflow_name, status, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_step_attempts_run_created
        ON openworkflow.step_attempts (namespace_id, workflow_run_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_step_attempts_name_created
        ON openworkflow.step_attempts (namespace_id, workflow_run_id, step_name, created_at);
    "#,
];
