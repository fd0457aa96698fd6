//! Relational persistence: the `workflow_checkpoints` table behind
//! `wirl_engine::CheckpointStore`, and the `workflow_runs` job queue behind
//! `RunStore` (spec.md §4.5's claim transaction, heartbeat, and stale-claim
//! reclaim).
//!
//! Grounded on `durable::persistence::postgres::PostgresWorkflowEventStore`:
//! runtime `sqlx::query` (not the compile-time `query!` macro, since this
//! crate can never connect to a live database during this exercise), the
//! `FOR UPDATE SKIP LOCKED` claim CTE, and the stale-reclaim `UPDATE ...
//! RETURNING` shape.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use wirl_engine::checkpoint::{CheckpointStore, Snapshot, StoreError as EngineStoreError};

use crate::error::StoreError;

/// Checkpoint persistence backed by `workflow_checkpoints`: one row per
/// `(run_id, superstep)`, matching spec.md §4.4's relational backend.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self, snapshot), fields(run_id = %snapshot.run_id, superstep = snapshot.superstep))]
    async fn save(&self, snapshot: Snapshot) -> Result<(), EngineStoreError> {
        let encoded =
            serde_json::to_value(&snapshot).map_err(|e| EngineStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (run_id, superstep, snapshot)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id, superstep) DO UPDATE SET snapshot = EXCLUDED.snapshot
            "#,
        )
        .bind(snapshot.run_id)
        .bind(snapshot.superstep as i64)
        .bind(&encoded)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to save checkpoint: {}", e);
            EngineStoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, EngineStoreError> {
        let row = sqlx::query(
            r#"
            SELECT snapshot FROM workflow_checkpoints
            WHERE run_id = $1
            ORDER BY superstep DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        row.map(|r| {
            let snapshot: Value = r.get("snapshot");
            serde_json::from_value(snapshot).map_err(|e| EngineStoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, run_id: Uuid) -> Result<Vec<Snapshot>, EngineStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot FROM workflow_checkpoints
            WHERE run_id = $1
            ORDER BY superstep ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                let snapshot: Value = r.get("snapshot");
                serde_json::from_value(snapshot).map_err(|e| EngineStoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

impl PostgresCheckpointStore {
    /// Same as `list`, paired with each row's `created_at` — not part of the
    /// `CheckpointStore` trait (the engine's `Snapshot` is storage-agnostic
    /// and carries no timestamp of its own), but needed by the control-plane
    /// API to render `GET /workflows/{id}/run-details` (spec.md §6).
    pub async fn list_with_created_at(&self, run_id: Uuid) -> Result<Vec<(Snapshot, DateTime<Utc>)>, EngineStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot, created_at FROM workflow_checkpoints
            WHERE run_id = $1
            ORDER BY superstep ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineStoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                let snapshot: Value = r.get("snapshot");
                let created_at: DateTime<Utc> = r.get("created_at");
                serde_json::from_value(snapshot)
                    .map(|s| (s, created_at))
                    .map_err(|e| EngineStoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}

/// Wire status values (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    Running,
    NeedsInput,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::NeedsInput => "needs_input",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "queued" => RunStatus::Queued,
            "running" => RunStatus::Running,
            "needs_input" => RunStatus::NeedsInput,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            "canceled" => RunStatus::Canceled,
            other => panic!("unknown run status in database: {other}"),
        }
    }
}

/// A `workflow_runs` row (spec.md §3).
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: Uuid,
    pub template_name: String,
    pub workflow_hash: String,
    pub status: RunStatus,
    pub inputs: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub resume_payload: Option<Value>,
    pub trigger_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_run(row: sqlx::postgres::PgRow) -> Run {
    let status: String = row.get("status");
    Run {
        run_id: row.get("run_id"),
        template_name: row.get("template_name"),
        workflow_hash: row.get("workflow_hash"),
        status: RunStatus::parse(&status),
        inputs: row.get("inputs"),
        result: row.get("result"),
        error: row.get("error"),
        retry_count: row.get("retry_count"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        cancel_requested: row.get("cancel_requested"),
        resume_payload: row.get("resume_payload"),
        trigger_id: row.get("trigger_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// The `workflow_runs` job queue: enqueue, at-most-once claim, heartbeat,
/// terminal-state writes, and stale-claim reclaim.
#[derive(Clone)]
pub struct RunStore {
    pool: PgPool,
}

impl RunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self, inputs))]
    pub async fn enqueue(
        &self,
        template_name: &str,
        workflow_hash: &str,
        inputs: Value,
        trigger_id: Option<Uuid>,
    ) -> Result<Uuid, StoreError> {
        let run_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (run_id, template_name, workflow_hash, status, inputs, trigger_id)
            VALUES ($1, $2, $3, 'queued', $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(template_name)
        .bind(workflow_hash)
        .bind(&inputs)
        .bind(trigger_id)
        .execute(&self.pool)
        .await?;

        debug!(%run_id, template_name, "enqueued run");
        Ok(run_id)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM workflow_runs WHERE run_id = $1"#)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_run))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Run>, i64), StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_runs ORDER BY created_at DESC LIMIT $1 OFFSET $2"#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query(r#"SELECT COUNT(*) AS n FROM workflow_runs"#)
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok((rows.into_iter().map(row_to_run).collect(), total))
    }

    /// The claim transaction from spec.md §4.5, verbatim in shape: a
    /// `SELECT ... FOR UPDATE SKIP LOCKED` CTE feeding an `UPDATE ...
    /// RETURNING`, so concurrent claimers never observe (or take) the same
    /// row — this is the mechanism behind invariant 6 in spec.md §8.
    #[instrument(skip(self))]
    pub async fn claim_one(
        &self,
        worker_id: &str,
        stale_timeout: chrono::Duration,
    ) -> Result<Option<Run>, StoreError> {
        let stale_before = Utc::now() - stale_timeout;

        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT run_id
                FROM workflow_runs
                WHERE status = 'queued'
                   OR (status = 'running' AND claimed_at < $1)
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_runs r
            SET status = 'running', claimed_by = $2, claimed_at = now(), updated_at = now()
            FROM claimable c
            WHERE r.run_id = c.run_id
            RETURNING r.*
            "#,
        )
        .bind(stale_before)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim run: {}", e);
            StoreError::from(e)
        })?;

        if let Some(row) = &row {
            let run_id: Uuid = row.get("run_id");
            debug!(%run_id, worker_id, "claimed run");
        }
        Ok(row.map(row_to_run))
    }

    /// Confirms this worker still owns `run_id`; used before writing a
    /// checkpoint or terminal state so a reclaimed run's original claimant
    /// does not clobber the new claimant's progress (`ClaimLost`, spec.md
    /// §7).
    pub async fn still_claimed_by(&self, run_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"SELECT 1 AS present FROM workflow_runs WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'"#,
        )
        .bind(run_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn heartbeat(&self, run_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET claimed_at = now() WHERE run_id = $1 AND claimed_by = $2 AND status = 'running'"#,
        )
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_succeeded(&self, run_id: Uuid, result: BTreeMap<String, Value>) -> Result<(), StoreError> {
        let result_json = serde_json::to_value(result)?;
        sqlx::query(
            r#"UPDATE workflow_runs SET status = 'succeeded', result = $2, error = NULL, claimed_by = NULL, updated_at = now() WHERE run_id = $1"#,
        )
        .bind(run_id)
        .bind(&result_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, run_id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE workflow_runs SET status = 'failed', error = $2, claimed_by = NULL, updated_at = now() WHERE run_id = $1"#,
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_needs_input(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE workflow_runs SET status = 'needs_input', claimed_by = NULL, updated_at = now() WHERE run_id = $1"#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_canceled(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE workflow_runs SET status = 'canceled', claimed_by = NULL, updated_at = now() WHERE run_id = $1"#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `POST /workflows/{id}/cancel` (spec.md §4.5): sets the cooperative
    /// flag a running worker observes between supersteps, or cancels
    /// directly if no worker currently owns the run.
    pub async fn request_cancel(&self, run_id: Uuid) -> Result<(), StoreError> {
        let run = self.get(run_id).await?.ok_or(StoreError::RunNotFound(run_id))?;
        match run.status {
            RunStatus::Queued | RunStatus::NeedsInput => self.mark_canceled(run_id).await,
            _ => {
                sqlx::query(r#"UPDATE workflow_runs SET cancel_requested = TRUE, updated_at = now() WHERE run_id = $1"#)
                    .bind(run_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn continue_run(&self, run_id: Uuid, inputs: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'queued', resume_payload = $2, retry_count = retry_count + 1, updated_at = now()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(&inputs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claims older than `stale_threshold` are eligible for another worker
    /// (spec.md §4.5); this resets them back to `queued` so the next
    /// `claim_one` can pick them up.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(&self, stale_threshold: chrono::Duration) -> Result<Vec<Uuid>, StoreError> {
        let threshold = Utc::now() - stale_threshold;
        let rows = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'queued', claimed_by = NULL, claimed_at = NULL, updated_at = now()
            WHERE status = 'running' AND claimed_at < $1
            RETURNING run_id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("run_id")).collect();
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale runs");
        }
        Ok(reclaimed)
    }
}

/// A `workflow_triggers` row (spec.md §3).
#[derive(Debug, Clone)]
pub struct Trigger {
    pub trigger_id: Uuid,
    pub name: String,
    pub template_name: String,
    pub inputs_template: Value,
    pub cron_expression: String,
    pub timezone: String,
    pub is_active: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

fn row_to_trigger(row: sqlx::postgres::PgRow) -> Trigger {
    Trigger {
        trigger_id: row.get("trigger_id"),
        name: row.get("name"),
        template_name: row.get("template_name"),
        inputs_template: row.get("inputs_template"),
        cron_expression: row.get("cron_expression"),
        timezone: row.get("timezone"),
        is_active: row.get("is_active"),
        next_run_at: row.get("next_run_at"),
        last_run_at: row.get("last_run_at"),
        last_error: row.get("last_error"),
    }
}

/// CRUD plus the due-trigger claim loop for `workflow_triggers`.
#[derive(Clone)]
pub struct TriggerStore {
    pool: PgPool,
}

impl TriggerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        template_name: &str,
        inputs_template: Value,
        cron_expression: &str,
        timezone: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let trigger_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO workflow_triggers
                (trigger_id, name, template_name, inputs_template, cron_expression, timezone, next_run_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(trigger_id)
        .bind(name)
        .bind(template_name)
        .bind(&inputs_template)
        .bind(cron_expression)
        .bind(timezone)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(trigger_id)
    }

    pub async fn list(&self) -> Result<Vec<Trigger>, StoreError> {
        let rows = sqlx::query(r#"SELECT * FROM workflow_triggers ORDER BY name"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_trigger).collect())
    }

    pub async fn get(&self, trigger_id: Uuid) -> Result<Option<Trigger>, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM workflow_triggers WHERE trigger_id = $1"#)
            .bind(trigger_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_trigger))
    }

    pub async fn set_active(&self, trigger_id: Uuid, is_active: bool) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE workflow_triggers SET is_active = $2, updated_at = now() WHERE trigger_id = $1"#)
            .bind(trigger_id)
            .bind(is_active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, trigger_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM workflow_triggers WHERE trigger_id = $1"#)
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Due triggers, locked and advanced in one transaction (spec.md §4.6).
    /// `compute_next` (pure, synchronous — cron evaluation) runs per claimed
    /// row *before* the transaction commits, and its result is written back
    /// as the new `next_run_at` in that same transaction. This is what
    /// makes invariant 7 (spec.md §8, "a trigger firing at minute M enqueues
    /// exactly one row") hold under overlapping pollers: a concurrent
    /// `claim_due` either blocks behind the row lock and then sees
    /// `next_run_at` already advanced past `now`, or `SKIP LOCKED`s past the
    /// row entirely — either way it cannot observe the trigger as still due.
    /// Earlier revisions committed the `SELECT ... FOR UPDATE` on its own
    /// and wrote `next_run_at` in a later, separate statement; that left a
    /// window between the two where a second poller's `SELECT` would see
    /// the still-unadvanced row as due and re-fire it.
    /// A `compute_next` error (malformed cron) deactivates the trigger
    /// in-transaction instead of advancing it.
    #[instrument(skip(self, compute_next))]
    pub async fn claim_due<F>(&self, now: DateTime<Utc>, limit: i64, mut compute_next: F) -> Result<Vec<Trigger>, StoreError>
    where
        F: FnMut(&Trigger) -> Result<DateTime<Utc>, String>,
    {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_triggers
            WHERE is_active AND next_run_at <= $1
            ORDER BY next_run_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let trigger = row_to_trigger(row);
            match compute_next(&trigger) {
                Ok(next_run_at) => {
                    sqlx::query(
                        r#"
                        UPDATE workflow_triggers
                        SET last_run_at = $2, next_run_at = $3, last_error = NULL, updated_at = now()
                        WHERE trigger_id = $1
                        "#,
                    )
                    .bind(trigger.trigger_id)
                    .bind(now)
                    .bind(next_run_at)
                    .execute(&mut *tx)
                    .await?;
                    claimed.push(trigger);
                }
                Err(message) => {
                    sqlx::query(
                        r#"
                        UPDATE workflow_triggers
                        SET is_active = FALSE, last_error = $2, updated_at = now()
                        WHERE trigger_id = $1
                        "#,
                    )
                    .bind(trigger.trigger_id)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(claimed)
    }

    pub async fn record_error(&self, trigger_id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE workflow_triggers SET is_active = FALSE, last_error = $2, updated_at = now() WHERE trigger_id = $1"#,
        )
        .bind(trigger_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Operational visibility table (supplemental to spec.md, not required by
/// any invariant): one row per live worker process.
#[derive(Clone)]
pub struct WorkerRegistry {
    pool: PgPool,
}

impl WorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_workers (worker_id)
            VALUES ($1)
            ON CONFLICT (worker_id) DO UPDATE SET started_at = now(), last_heartbeat_at = now(), current_load = 0
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &str, current_load: i32) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE workflow_workers SET last_heartbeat_at = now(), current_load = $2 WHERE worker_id = $1"#)
            .bind(worker_id)
            .bind(current_load)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(r#"DELETE FROM workflow_workers WHERE worker_id = $1"#)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
