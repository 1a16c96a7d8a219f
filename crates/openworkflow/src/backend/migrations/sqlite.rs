//! SQLite migration blocks: `?`-bound, TEXT-encoded JSON and timestamps
//! (SQLite has no native JSON or timezone-aware timestamp type), no schema
//! namespacing (SQLite has one schema per file).

pub const BLOCKS: &[&str] = &[
    // 1: workflow_runs
    r#"
    CREATE TABLE IF NOT EXISTS workflow_runs (
        namespace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        workflow_name TEXT NOT NULL,
        version TEXT,
        status TEXT NOT NULL,
        idempotency_key TEXT,
        config TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        input TEXT NOT NULL DEFAULT '{}',
        output TEXT,
        error TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        parent_step_attempt_namespace_id TEXT,
        parent_step_attempt_id TEXT,
        worker_id TEXT,
        available_at TEXT,
        deadline_at TEXT,
        started_at TEXT,
        finished_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace_id, id)
    );
    "#,
    // 2: step_attempts
    r#"
    CREATE TABLE IF NOT EXISTS step_attempts (
        namespace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        workflow_run_id TEXT NOT NULL,
        step_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        output TEXT,
        error TEXT,
        child_workflow_run_namespace_id TEXT,
        child_workflow_run_id TEXT,
        started_at TEXT,
        finished_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (namespace_id, id),
        FOREIGN KEY (namespace_id, workflow_run_id)
            REFERENCES workflow_runs (namespace_id, id)
            ON DELETE CASCADE
    );
    "#,
    // 3: indexes
    r#"
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_scheduler
        ON workflow_runs (namespace_id, status, available_at, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_idempotency
        ON workflow_runs (namespace_id, workflow_name, idempotency_key, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_created
        ON workflow_runs (namespace_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_status_created
        ON workflow_runs (namespace_id, status, created_at);
    CREATE INDEX IF NOT EXISTS idx_workflow_runs_name_status_created
        ON workflow_runs (namespace_id, workflow_name, status, created_at);
    CREATE INDEX IF NOT EXISTS idx_step_attempts_run_created
        ON step_attempts (namespace_id, workflow_run_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_step_attempts_name_created
        ON step_attempts (namespace_id, workflow_run_id, step_name, created_at);
    "#,
];
