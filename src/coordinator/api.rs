// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Administrative surface: phase changes, validation and backfill control.
//!
//! These are the operations an external CLI or HTTP layer calls. Every one
//! takes an explicit record class or run id; nothing here runs implicitly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::backfill::{BackfillCheckpoint, BackfillOptions, RunId, RunResult};
use crate::error::MigrationError;
use crate::phase::{MigrationPhase, PhaseOverrides, PhaseState};
use crate::record::RecordClass;
use crate::validator::ValidationReport;

use super::MigrationEngine;

impl MigrationEngine {
    // --- Phase control ---

    #[instrument(skip(self))]
    pub async fn advance_to_dual_write(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.phase.advance_to_dual_write(operator).await
    }

    #[instrument(skip(self))]
    pub async fn advance_to_read_from_target(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.phase.advance_to_read_from_target(operator).await
    }

    #[instrument(skip(self))]
    pub async fn advance_to_target_only(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.phase.advance_to_target_only(operator).await
    }

    #[instrument(skip(self))]
    pub async fn rollback(&self, to: MigrationPhase, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.phase.rollback(to, operator).await
    }

    #[instrument(skip(self))]
    pub async fn set_overrides(
        &self,
        overrides: PhaseOverrides,
        operator: &str,
    ) -> Result<Arc<PhaseState>, MigrationError> {
        self.phase.set_overrides(overrides, operator).await
    }

    // --- Validation ---

    /// Count comparison for `start <= timestamp <= end`.
    #[instrument(skip(self))]
    pub async fn validate(
        &self,
        class: RecordClass,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ValidationReport, MigrationError> {
        match class {
            RecordClass::Logs => self.logs.validator.validate_window(start, end).await,
            RecordClass::Payments => self.payments.validator.validate_window(start, end).await,
        }
    }

    /// Count comparison plus a field-level check of up to `sample_size` records.
    #[instrument(skip(self))]
    pub async fn validate_sample(
        &self,
        class: RecordClass,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_size: usize,
    ) -> Result<ValidationReport, MigrationError> {
        match class {
            RecordClass::Logs => self.logs.validator.validate_sample(start, end, sample_size).await,
            RecordClass::Payments => self.payments.validator.validate_sample(start, end, sample_size).await,
        }
    }

    // --- Backfill ---

    /// Register a run and drive it in the background.
    #[instrument(skip(self, options))]
    pub async fn backfill_start(&self, class: RecordClass, options: BackfillOptions) -> Result<RunId, MigrationError> {
        let run_id = match class {
            RecordClass::Logs => self.logs.backfill.start(options).await?,
            RecordClass::Payments => self.payments.backfill.start(options).await?,
        };
        self.spawn_run(class, run_id.clone());
        Ok(run_id)
    }

    /// Continue a paused or failed run in the background.
    #[instrument(skip(self))]
    pub async fn backfill_resume(&self, run_id: &RunId) -> Result<(), MigrationError> {
        let class = self.run_class(run_id).await?;
        match class {
            RecordClass::Logs => self.logs.backfill.reopen(run_id).await?,
            RecordClass::Payments => self.payments.backfill.reopen(run_id).await?,
        };
        self.spawn_run(class, run_id.clone());
        Ok(())
    }

    /// Request a cooperative stop after the run's current window.
    #[instrument(skip(self))]
    pub async fn backfill_pause(&self, run_id: &RunId) -> Result<(), MigrationError> {
        let status = match self.run_class(run_id).await? {
            RecordClass::Logs => self.logs.backfill.pause(run_id).await?,
            RecordClass::Payments => self.payments.backfill.pause(run_id).await?,
        };
        info!(run_id = %run_id, status = %status, "Backfill pause handled");
        Ok(())
    }

    pub async fn backfill_checkpoint(&self, run_id: &RunId) -> Result<BackfillCheckpoint, MigrationError> {
        self.state
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| MigrationError::RunNotFound(run_id.clone()))
    }

    /// Wait for a run started or resumed through this engine to stop.
    ///
    /// Runs not driven by this engine, or finished and already pruned,
    /// report their persisted progress.
    pub async fn wait_for_run(&self, run_id: &RunId) -> Result<RunResult, MigrationError> {
        if let Some((_, handle)) = self.run_handles.remove(run_id) {
            return handle
                .await
                .map_err(|e| MigrationError::BackgroundTask(format!("backfill {}: {}", run_id, e)))?;
        }
        let checkpoint = self.backfill_checkpoint(run_id).await?;
        Ok(RunResult::from(&checkpoint))
    }

    fn spawn_run(&self, class: RecordClass, run_id: RunId) {
        // Runs nobody waited for; their checkpoint still has the outcome
        self.run_handles.retain(|_, handle| !handle.is_finished());
        let handle = match class {
            RecordClass::Logs => self.logs.backfill.spawn(run_id.clone()),
            RecordClass::Payments => self.payments.backfill.spawn(run_id.clone()),
        };
        self.run_handles.insert(run_id, handle);
    }

    async fn run_class(&self, run_id: &RunId) -> Result<RecordClass, MigrationError> {
        Ok(self.backfill_checkpoint(run_id).await?.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::RunStatus;
    use crate::config::MigrationConfig;
    use crate::record::{LogRecord, PaymentRecord};
    use chrono::Duration;

    async fn engine() -> MigrationEngine {
        MigrationEngine::in_memory(MigrationConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_phase_walk_and_rollback() {
        let engine = engine().await;
        assert!(matches!(
            engine.advance_to_target_only("ops").await,
            Err(MigrationError::InvalidPhaseTransition { .. })
        ));

        engine.advance_to_dual_write("ops").await.unwrap();
        engine.advance_to_read_from_target("ops").await.unwrap();
        assert!(engine.routing_policy().reads_from_target);

        engine.rollback(MigrationPhase::DualWrite, "ops").await.unwrap();
        assert_eq!(engine.phase(), MigrationPhase::DualWrite);
        assert!(!engine.routing_policy().reads_from_target);
    }

    #[tokio::test]
    async fn test_backfill_through_engine() {
        let engine = engine().await;
        let now = Utc::now();
        for i in 0..6 {
            let record = LogRecord::new(i, "Bureau", "REQUEST", now - Duration::hours(30 + i));
            engine.logs().router.write_record(&record).await.unwrap();
        }

        let options = BackfillOptions::new(now - Duration::days(3), now);
        let run_id = engine.backfill_start(RecordClass::Logs, options).await.unwrap();
        let result = engine.wait_for_run(&run_id).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.migrated, 6);
        let report = engine
            .validate(RecordClass::Logs, now - Duration::days(3), now)
            .await
            .unwrap();
        assert!(report.is_consistent);
    }

    #[tokio::test]
    async fn test_backfill_pause_idle_and_resume() {
        let engine = engine().await;
        let now = Utc::now();
        engine
            .payments()
            .router
            .write_record(&PaymentRecord::new(1, 2, 3, 100, now - Duration::hours(2), "Card"))
            .await
            .unwrap();

        let run_id = engine
            .payments
            .backfill
            .start(BackfillOptions::new(now - Duration::days(1), now))
            .await
            .unwrap();
        engine.backfill_pause(&run_id).await.unwrap();
        assert_eq!(engine.backfill_checkpoint(&run_id).await.unwrap().status, RunStatus::Paused);

        engine.backfill_resume(&run_id).await.unwrap();
        let result = engine.wait_for_run(&run_id).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.migrated, 1);

        let status = engine.status().await.unwrap();
        assert_eq!(status.latest_runs[&RecordClass::Payments].run_id, run_id);
    }

    #[tokio::test]
    async fn test_finished_run_handles_are_pruned() {
        let engine = engine().await;
        let now = Utc::now();
        engine
            .logs()
            .router
            .write_record(&LogRecord::new(1, "Bureau", "REQUEST", now - Duration::hours(1)))
            .await
            .unwrap();

        let first = engine
            .backfill_start(RecordClass::Logs, BackfillOptions::new(now - Duration::days(1), now))
            .await
            .unwrap();
        while !engine.run_handles.iter().all(|h| h.value().is_finished()) {
            tokio::task::yield_now().await;
        }

        let second = engine
            .backfill_start(RecordClass::Payments, BackfillOptions::new(now - Duration::days(1), now))
            .await
            .unwrap();
        assert_eq!(engine.run_handles.len(), 1);
        assert!(engine.run_handles.contains_key(&second));

        // The pruned run still answers from its checkpoint
        let result = engine.wait_for_run(&first).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.migrated, 1);
        assert_eq!(engine.wait_for_run(&second).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_run_rejected() {
        let engine = engine().await;
        let missing = RunId::from("logs-missing");
        assert!(matches!(engine.backfill_resume(&missing).await, Err(MigrationError::RunNotFound(_))));
        assert!(matches!(engine.backfill_pause(&missing).await, Err(MigrationError::RunNotFound(_))));
    }
}
