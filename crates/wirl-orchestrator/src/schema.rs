//! Embedded DDL for the four tables this crate owns (spec.md §6):
//! `workflow_runs`, `workflow_checkpoints`, `workflow_triggers`, and the
//! supplemental `workflow_workers` table (operational visibility, not named
//! by any invariant in spec.md §8). The teacher provisions its schema
//! externally and ships no migrations directory in this pack, so rather than
//! invent a migrations/ convention it never uses, the schema is a single
//! idempotent script applied by `run_migrations`.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id UUID PRIMARY KEY,
    template_name TEXT NOT NULL,
    workflow_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    inputs JSONB NOT NULL,
    result JSONB,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    claimed_at TIMESTAMPTZ,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    resume_payload JSONB,
    trigger_id UUID,
    trace_id TEXT,
    span_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS workflow_runs_claim_idx
    ON workflow_runs (status, claimed_at)
    WHERE status = 'queued' OR status = 'running';

CREATE INDEX IF NOT EXISTS workflow_runs_created_at_idx ON workflow_runs (created_at);

CREATE TABLE IF NOT EXISTS workflow_checkpoints (
    run_id UUID NOT NULL,
    superstep BIGINT NOT NULL,
    snapshot JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (run_id, superstep)
);

CREATE TABLE IF NOT EXISTS workflow_triggers (
    trigger_id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    template_name TEXT NOT NULL,
    inputs_template JSONB NOT NULL,
    cron_expression TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    next_run_at TIMESTAMPTZ NOT NULL,
    last_run_at TIMESTAMPTZ,
    last_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS workflow_triggers_due_idx
    ON workflow_triggers (next_run_at)
    WHERE is_active;

CREATE TABLE IF NOT EXISTS workflow_workers (
    worker_id TEXT PRIMARY KEY,
    started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_heartbeat_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    current_load INTEGER NOT NULL DEFAULT 0
);
"#;

/// Applies the schema. Idempotent: safe to call on every process start.
///
/// Uses `raw_sql` rather than `query` because the script is several
/// statements long; `query` prepares exactly one statement per call under
/// Postgres's extended protocol.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
