//! Cron trigger scheduler (spec.md §4.6): every tick, claims due triggers
//! under `FOR UPDATE SKIP LOCKED` and enqueues one `workflow_runs` row per
//! firing, advancing `next_run_at` strictly after the *previous*
//! `next_run_at` so overlapping pollers cannot double-enqueue within the
//! same tick (invariant 7, spec.md §8).
//!
//! Grounded on the same claim-transaction pattern as `RunStore::claim_one`
//! (`store.rs`); cron parsing itself has no teacher precedent (the teacher
//! has no scheduled-workflow concept) and is enriched from the pack's
//! `cron`-crate usage.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::registry::TemplateRegistry;
use crate::store::{RunStore, Trigger, TriggerStore};

#[derive(Debug, Clone)]
pub struct TriggerSchedulerConfig {
    /// Tick period; defaults to 15s per spec.md §4.6.
    pub tick_interval: Duration,
    /// Maximum due triggers claimed per tick.
    pub batch_limit: i64,
}

impl Default for TriggerSchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            batch_limit: 100,
        }
    }
}

/// Parses `cron_expression` against `timezone` and returns the next fire
/// time strictly after `after`. Five-field classic cron (`min hour dom mon
/// dow`); the `cron` crate expects six fields with a leading seconds
/// position, so a literal `"0 "` is prefixed (every fire happens at second
/// zero, matching the spec's five-field grammar).
fn next_fire_after(cron_expression: &str, timezone: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| SchedulerError::CronInvalid(cron_expression.to_string(), format!("unknown timezone '{timezone}'")))?;

    let six_field = format!("0 {cron_expression}");
    let schedule = Schedule::from_str(&six_field)
        .map_err(|e| SchedulerError::CronInvalid(cron_expression.to_string(), e.to_string()))?;

    let after_in_tz = after.with_timezone(&tz);
    schedule
        .after(&after_in_tz)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SchedulerError::CronInvalid(cron_expression.to_string(), "schedule never fires again".to_string()))
}

/// Validates a cron expression at trigger create/update time without
/// needing a `TriggerScheduler` instance (spec.md §4.6: "invalid expressions
/// fail validation at create/update time").
pub fn validate_cron(cron_expression: &str, timezone: &str) -> Result<DateTime<Utc>, SchedulerError> {
    next_fire_after(cron_expression, timezone, Utc::now())
}

/// Drives the due-trigger claim loop on a fixed tick.
pub struct TriggerScheduler {
    triggers: TriggerStore,
    runs: RunStore,
    registry: Arc<TemplateRegistry>,
    config: TriggerSchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TriggerScheduler {
    pub fn new(
        triggers: TriggerStore,
        runs: RunStore,
        registry: Arc<TemplateRegistry>,
        config: TriggerSchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            triggers,
            runs,
            registry,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the tick loop as a background task; call the returned
    /// `JoinHandle`'s `.abort()` or drop the scheduler after `stop()` to end
    /// it.
    pub fn spawn(self: std::sync::Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let tick_interval = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("trigger scheduler tick failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("trigger scheduler stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One poll: claims every trigger due as of `now` — atomically
    /// advancing each one's `next_run_at` as part of the claim itself, see
    /// `TriggerStore::claim_due` — and enqueues a run for each.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        // Computed strictly after the *previous* next_run_at, never `now`,
        // per spec.md §4.6 and invariant 7 (spec.md §8).
        let due = self
            .triggers
            .claim_due(now, self.config.batch_limit, |trigger| {
                next_fire_after(&trigger.cron_expression, &trigger.timezone, trigger.next_run_at).map_err(|e| e.to_string())
            })
            .await?;
        let mut fired = 0;
        for trigger in due {
            if let Err(e) = self.fire(&trigger).await {
                warn!(trigger_id = %trigger.trigger_id, "trigger fire failed: {}", e);
            } else {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(&self, trigger: &Trigger) -> Result<Uuid, SchedulerError> {
        let inputs = match &trigger.inputs_template {
            Value::Object(_) => trigger.inputs_template.clone(),
            other => {
                let msg = format!("inputs_template is not a JSON object: {other}");
                self.triggers.record_error(trigger.trigger_id, &msg).await?;
                return Err(SchedulerError::InputsTemplateInvalid(msg));
            }
        };

        let workflow = match self.registry.resolve(&trigger.template_name).await {
            Ok(w) => w,
            Err(e) => {
                let msg = format!("template resolution failed: {e}");
                self.triggers.record_error(trigger.trigger_id, &msg).await?;
                return Err(SchedulerError::Store(crate::error::StoreError::TemplateNotFound(
                    trigger.template_name.clone(),
                )));
            }
        };

        let run_id = self
            .runs
            .enqueue(&trigger.template_name, &workflow.source_hash, inputs, Some(trigger.trigger_id))
            .await?;

        info!(trigger_id = %trigger.trigger_id, %run_id, template = %trigger.template_name, "trigger fired");
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_cron() {
        let err = validate_cron("not a cron", "UTC").unwrap_err();
        assert!(matches!(err, SchedulerError::CronInvalid(_, _)));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let err = validate_cron("*/15 * * * *", "Mars/Olympus_Mons").unwrap_err();
        assert!(matches!(err, SchedulerError::CronInvalid(_, _)));
    }

    #[test]
    fn computes_next_fire_strictly_after_reference() {
        let reference = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = next_fire_after("0 * * * *", "UTC", reference).unwrap();
        assert!(next > reference);
        assert_eq!(next.format("%M").to_string(), "00");
    }

    #[test]
    fn steps_and_ranges_are_supported() {
        let reference = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = next_fire_after("*/15 * * * *", "UTC", reference).unwrap();
        assert_eq!(next.format("%M").to_string(), "15");
    }
}
