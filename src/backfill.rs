// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch backfill migrator.
//!
//! Moves historical records of one class from the source store into the
//! target store, window by window:
//!
//! ```text
//! start(options) ──→ lock class ──→ checkpoint {Running}
//!                                        │
//! run(run_id):                           ▼
//!   ┌─→ pause requested? ───────────→ Paused (lock released)
//!   │   window start >= end? ───────→ Completed (lock released)
//!   │   fetch pages ─→ encode ─→ write chunks
//!   │   failures > max_errors? ─────→ Failed (lock released)
//!   └── commit window ─→ persist checkpoint
//! ```
//!
//! The checkpoint only moves after a window is fully written, so a crash
//! re-processes at most one window. Target keys are derived from the
//! natural key, making the re-write an idempotent overwrite.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::RecordCodec;
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::metrics;
use crate::record::{MigrationRecord, NaturalKey, RecordClass};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::router::write_chunked;
use crate::storage::state::{LockOutcome, StateStore};
use crate::storage::traits::{SourceStore, StorageError, TargetStore};

/// Identifier of one backfill run: `{class}-{yyyymmdd-hhmmss}-{8 hex}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn generate(class: RecordClass, at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}-{}", class.as_str(), at.format("%Y%m%d-%H%M%S"), &suffix[..8]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_max_errors() -> u64 {
    100
}

/// What a run migrates: records with `start <= timestamp < end`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillOptions {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Per-record failures tolerated before the run fails.
    #[serde(default = "default_max_errors")]
    pub max_errors: u64,
    /// Convert and count without writing to the target.
    #[serde(default)]
    pub dry_run: bool,
}

impl BackfillOptions {
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            max_errors: default_max_errors(),
            dry_run: false,
        }
    }

    #[must_use]
    pub fn with_max_errors(mut self, max_errors: u64) -> Self {
        self.max_errors = max_errors;
        self
    }

    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.start >= self.end {
            return Err(MigrationError::InvalidOptions(format!(
                "backfill start {} must be before end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// One failure kept on the run's error list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillError {
    /// Natural key of the row, or the window for batch failures.
    pub locator: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Persisted progress of a run.
///
/// Counters and cursor reflect committed windows only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillCheckpoint {
    pub run_id: RunId,
    pub class: RecordClass,
    pub options: BackfillOptions,
    /// Last record of the last committed window.
    pub cursor: Option<NaturalKey>,
    /// First window not yet committed.
    pub next_window_start: DateTime<Utc>,
    pub windows_completed: u32,
    pub seen: u64,
    /// Records written to the target (converted, for dry runs).
    pub processed: u64,
    pub failed: u64,
    /// Records past their retention, not written.
    pub skipped: u64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: Vec<BackfillError>,
    pub last_error: Option<String>,
}

impl BackfillCheckpoint {
    #[must_use]
    pub fn new(run_id: RunId, class: RecordClass, options: BackfillOptions, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            class,
            next_window_start: options.start,
            options,
            cursor: None,
            windows_completed: 0,
            seen: 0,
            processed: 0,
            failed: 0,
            skipped: 0,
            status: RunStatus::Running,
            started_at,
            updated_at: started_at,
            ended_at: None,
            errors: Vec::new(),
            last_error: None,
        }
    }

    /// Append errors, keeping only the newest `limit`.
    fn push_errors(&mut self, errors: Vec<BackfillError>, limit: usize) {
        self.errors.extend(errors);
        if self.errors.len() > limit {
            let excess = self.errors.len() - limit;
            self.errors.drain(..excess);
        }
    }

    fn commit(&mut self, tally: WindowTally, window_end: DateTime<Utc>, error_limit: usize) {
        self.seen += tally.seen;
        self.processed += tally.migrated;
        self.failed += tally.failed;
        self.skipped += tally.skipped;
        if tally.last_key.is_some() {
            self.cursor = tally.last_key;
        }
        self.next_window_start = window_end;
        self.windows_completed += 1;
        self.updated_at = Utc::now();
        self.push_errors(tally.errors, error_limit);
    }
}

/// Summary handed back when a run stops.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub class: RecordClass,
    pub status: RunStatus,
    pub seen: u64,
    pub migrated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub windows_completed: u32,
    pub duration_ms: u64,
    pub last_error: Option<String>,
}

impl From<&BackfillCheckpoint> for RunResult {
    fn from(cp: &BackfillCheckpoint) -> Self {
        let end = cp.ended_at.unwrap_or(cp.updated_at);
        Self {
            run_id: cp.run_id.clone(),
            class: cp.class,
            status: cp.status,
            seen: cp.seen,
            migrated: cp.processed,
            failed: cp.failed,
            skipped: cp.skipped,
            windows_completed: cp.windows_completed,
            duration_ms: (end - cp.started_at).num_milliseconds().max(0) as u64,
            last_error: cp.last_error.clone(),
        }
    }
}

/// Tuning shared by every run of a migrator.
#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub window: Duration,
    pub page_size: usize,
    pub max_error_entries: usize,
    pub retry: RetryConfig,
}

impl BackfillSettings {
    #[must_use]
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            window: Duration::hours(i64::from(config.backfill_window_hours)),
            page_size: config.backfill_page_size,
            max_error_entries: config.backfill_max_error_entries,
            retry: config.store_retry(),
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

#[derive(Debug, Default)]
struct WindowTally {
    seen: u64,
    migrated: u64,
    failed: u64,
    skipped: u64,
    last_key: Option<NaturalKey>,
    errors: Vec<BackfillError>,
}

impl WindowTally {
    fn fail(&mut self, count: u64, locator: String, reason: String) {
        self.failed += count;
        self.errors.push(BackfillError {
            locator,
            reason,
            at: Utc::now(),
        });
    }
}

enum Halt {
    ErrorBudget,
    Source(StorageError),
}

/// Clears in-process run markers when a run stops, however it stops.
struct ActiveRun<'a> {
    active: &'a DashMap<RunId, ()>,
    stop_requests: &'a DashMap<RunId, ()>,
    run_id: RunId,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
        self.stop_requests.remove(&self.run_id);
    }
}

/// Backfill runs for one record class.
pub struct BackfillMigrator<R: MigrationRecord> {
    source: Arc<dyn SourceStore<R>>,
    target: Arc<dyn TargetStore>,
    state: Arc<dyn StateStore>,
    codec: RecordCodec,
    settings: BackfillSettings,
    active: DashMap<RunId, ()>,
    stop_requests: DashMap<RunId, ()>,
}

impl<R: MigrationRecord> BackfillMigrator<R> {
    pub fn new(
        source: Arc<dyn SourceStore<R>>,
        target: Arc<dyn TargetStore>,
        state: Arc<dyn StateStore>,
        codec: RecordCodec,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            source,
            target,
            state,
            codec,
            settings,
            active: DashMap::new(),
            stop_requests: DashMap::new(),
        }
    }

    pub fn class(&self) -> RecordClass {
        R::CLASS
    }

    /// Register a new run and take the class lock. Nothing is migrated
    /// until [`run`](Self::run) or [`spawn`](Self::spawn).
    #[instrument(skip(self, options), fields(class = %R::CLASS))]
    pub async fn start(&self, options: BackfillOptions) -> Result<RunId, MigrationError> {
        options.validate()?;
        let now = Utc::now();
        let run_id = RunId::generate(R::CLASS, now);
        self.acquire_lock(&run_id).await?;

        let checkpoint = BackfillCheckpoint::new(run_id.clone(), R::CLASS, options, now);
        if let Err(e) = self.save(&checkpoint).await {
            self.release_lock(&run_id).await;
            return Err(e.into());
        }
        info!(
            run_id = %run_id,
            start = %checkpoint.options.start,
            end = %checkpoint.options.end,
            max_errors = checkpoint.options.max_errors,
            dry_run = checkpoint.options.dry_run,
            "Backfill run registered"
        );
        Ok(run_id)
    }

    /// Drive a `Running` run until it completes, fails or is paused.
    #[instrument(skip(self), fields(class = %R::CLASS))]
    pub async fn run(&self, run_id: &RunId) -> Result<RunResult, MigrationError> {
        // Claimed before the checkpoint load so a concurrent pause sees it
        let _guard = self.claim(run_id)?;
        let mut checkpoint = self
            .state
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| MigrationError::RunNotFound(run_id.clone()))?;
        if checkpoint.status != RunStatus::Running {
            return Err(MigrationError::RunNotResumable {
                run_id: run_id.clone(),
                status: checkpoint.status,
            });
        }

        metrics::set_backfill_active(R::CLASS.as_str(), true);
        let result = self.drive(&mut checkpoint).await;
        metrics::set_backfill_active(R::CLASS.as_str(), false);
        result
    }

    /// Run in a background task.
    pub fn spawn(self: &Arc<Self>, run_id: RunId) -> JoinHandle<Result<RunResult, MigrationError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.run(&run_id).await;
            if let Err(e) = &result {
                error!(run_id = %run_id, error = %e, "Backfill run aborted");
            }
            result
        })
    }

    /// Put a `Paused` or `Failed` run (or a `Running` run whose worker died)
    /// back into `Running` and retake the class lock.
    pub async fn reopen(&self, run_id: &RunId) -> Result<BackfillCheckpoint, MigrationError> {
        let mut checkpoint = self
            .state
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| MigrationError::RunNotFound(run_id.clone()))?;
        if checkpoint.status == RunStatus::Completed || checkpoint.class != R::CLASS {
            return Err(MigrationError::RunNotResumable {
                run_id: run_id.clone(),
                status: checkpoint.status,
            });
        }
        if self.active.contains_key(run_id) {
            return Err(MigrationError::MigrationAlreadyInProgress {
                class: R::CLASS,
                run_id: run_id.clone(),
            });
        }
        self.acquire_lock(run_id).await?;

        let previous = checkpoint.status;
        checkpoint.status = RunStatus::Running;
        checkpoint.ended_at = None;
        checkpoint.updated_at = Utc::now();
        self.save(&checkpoint).await?;
        info!(
            run_id = %run_id,
            from = %previous,
            next_window = %checkpoint.next_window_start,
            processed = checkpoint.processed,
            "Backfill run resumed"
        );
        Ok(checkpoint)
    }

    /// Continue a run from its last committed window.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunResult, MigrationError> {
        self.reopen(run_id).await?;
        self.run(run_id).await
    }

    /// Ask a run to stop after its current window.
    ///
    /// Returns `Running` when the stop was queued for an active run,
    /// otherwise the status the run now has.
    pub async fn pause(&self, run_id: &RunId) -> Result<RunStatus, MigrationError> {
        let _guard = match self.claim(run_id) {
            Ok(guard) => guard,
            Err(_) => {
                self.stop_requests.insert(run_id.clone(), ());
                info!(run_id = %run_id, "Backfill pause requested");
                return Ok(RunStatus::Running);
            }
        };

        // Holding the slot keeps a worker from starting while we settle
        let mut checkpoint = self
            .state
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| MigrationError::RunNotFound(run_id.clone()))?;
        if checkpoint.status != RunStatus::Running {
            return Ok(checkpoint.status);
        }
        checkpoint.status = RunStatus::Paused;
        checkpoint.updated_at = Utc::now();
        self.save(&checkpoint).await?;
        self.release_lock(run_id).await;
        info!(run_id = %run_id, "Idle backfill run paused");
        Ok(RunStatus::Paused)
    }

    pub async fn checkpoint(&self, run_id: &RunId) -> Result<Option<BackfillCheckpoint>, MigrationError> {
        Ok(self.state.load_checkpoint(run_id).await?)
    }

    /// Every run of this class, newest first.
    pub async fn runs(&self) -> Result<Vec<BackfillCheckpoint>, MigrationError> {
        Ok(self.state.list_checkpoints(R::CLASS).await?)
    }

    /// Runs being driven by this process.
    #[must_use]
    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.contains_key(run_id)
    }

    async fn drive(&self, checkpoint: &mut BackfillCheckpoint) -> Result<RunResult, MigrationError> {
        loop {
            if self.stop_requests.contains_key(&checkpoint.run_id) {
                return self.finish(checkpoint, RunStatus::Paused).await;
            }
            if checkpoint.next_window_start >= checkpoint.options.end {
                return self.finish(checkpoint, RunStatus::Completed).await;
            }

            let window_start = checkpoint.next_window_start;
            let window_end = (window_start + self.settings.window).min(checkpoint.options.end);
            let timer = Instant::now();
            let (tally, halt) = self.process_window(checkpoint, window_start, window_end).await;

            match halt {
                None => {
                    let (migrated, failed, skipped) = (tally.migrated, tally.failed, tally.skipped);
                    checkpoint.commit(tally, window_end, self.settings.max_error_entries);
                    self.save(checkpoint).await?;

                    let class = R::CLASS.as_str();
                    metrics::record_backfill_records(class, "migrated", migrated);
                    metrics::record_backfill_records(class, "failed", failed);
                    metrics::record_backfill_records(class, "skipped", skipped);
                    metrics::record_backfill_window(class, timer.elapsed());
                    info!(
                        run_id = %checkpoint.run_id,
                        window_start = %window_start,
                        window_end = %window_end,
                        migrated,
                        failed,
                        skipped,
                        total_processed = checkpoint.processed,
                        "Backfill window committed"
                    );
                }
                Some(halt) => {
                    let reason = match halt {
                        Halt::ErrorBudget => format!(
                            "{} failures exceed max_errors {}",
                            checkpoint.failed + tally.failed,
                            checkpoint.options.max_errors
                        ),
                        Halt::Source(e) => format!("source read failed: {}", e),
                    };
                    warn!(
                        run_id = %checkpoint.run_id,
                        window_start = %window_start,
                        reason = %reason,
                        "Backfill halted; checkpoint kept at last committed window"
                    );
                    checkpoint.push_errors(tally.errors, self.settings.max_error_entries);
                    checkpoint.last_error = Some(reason);
                    return self.finish(checkpoint, RunStatus::Failed).await;
                }
            }
        }
    }

    /// Migrate one window. On a halt the tally is not committed.
    async fn process_window(
        &self,
        checkpoint: &BackfillCheckpoint,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> (WindowTally, Option<Halt>) {
        let budget = checkpoint.options.max_errors;
        let mut tally = WindowTally::default();
        let mut after: Option<NaturalKey> = None;

        loop {
            let page = retry_when("source_fetch_page", &self.settings.retry, StorageError::is_transient, || {
                self.source
                    .fetch_page(window_start, window_end, after.as_ref(), self.settings.page_size)
            })
            .await
            .result;
            let page = match page {
                Ok(page) => page,
                Err(e) => return (tally, Some(Halt::Source(e))),
            };
            let full_page = page.len() >= self.settings.page_size;
            let Some(last) = page.last().map(|row| row.key.clone()) else {
                break;
            };

            let mut items = Vec::with_capacity(page.len());
            for row in page {
                tally.seen += 1;
                let record = match row.record {
                    Ok(record) => record,
                    Err(e) => {
                        tally.fail(1, row.key.to_string(), e.reason);
                        if checkpoint.failed + tally.failed > budget {
                            return (tally, Some(Halt::ErrorBudget));
                        }
                        continue;
                    }
                };
                if self.codec.is_past_retention(&record) {
                    tally.skipped += 1;
                    continue;
                }
                match self.codec.encode(&record) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        metrics::record_conversion_failure(R::CLASS.as_str());
                        tally.fail(1, row.key.to_string(), e.reason);
                        if checkpoint.failed + tally.failed > budget {
                            return (tally, Some(Halt::ErrorBudget));
                        }
                    }
                }
            }

            if checkpoint.options.dry_run {
                tally.migrated += items.len() as u64;
            } else if !items.is_empty() {
                let write = write_chunked(self.target.as_ref(), &items, &self.settings.retry).await;
                tally.migrated += write.written as u64;
                if write.superseded > 0 {
                    // Live writes got there first with a newer revision
                    debug!(run_id = %checkpoint.run_id, superseded = write.superseded, "Kept newer target items");
                }
                if write.is_failure() {
                    tally.fail(
                        write.failed as u64,
                        format!("window {}..{} page ending {}", window_start, window_end, last),
                        write.error.unwrap_or_else(|| "target write failed".to_string()),
                    );
                    if checkpoint.failed + tally.failed > budget {
                        return (tally, Some(Halt::ErrorBudget));
                    }
                }
            }

            debug!(run_id = %checkpoint.run_id, seen = tally.seen, cursor = %last, "Backfill page done");
            tally.last_key = Some(last.clone());
            after = Some(last);
            if !full_page {
                break;
            }
        }
        (tally, None)
    }

    async fn finish(&self, checkpoint: &mut BackfillCheckpoint, status: RunStatus) -> Result<RunResult, MigrationError> {
        let now = Utc::now();
        checkpoint.status = status;
        checkpoint.updated_at = now;
        if status != RunStatus::Paused {
            checkpoint.ended_at = Some(now);
        }
        self.save(checkpoint).await?;
        self.release_lock(&checkpoint.run_id).await;

        let result = RunResult::from(&*checkpoint);
        info!(
            run_id = %result.run_id,
            status = %result.status,
            seen = result.seen,
            migrated = result.migrated,
            failed = result.failed,
            skipped = result.skipped,
            duration_ms = result.duration_ms,
            "Backfill run stopped"
        );
        Ok(result)
    }

    async fn save(&self, checkpoint: &BackfillCheckpoint) -> Result<(), StorageError> {
        retry_when("save_checkpoint", &self.settings.retry, StorageError::is_transient, || {
            self.state.save_checkpoint(checkpoint)
        })
        .await
        .result
    }

    /// Take the class lock, clearing it first if its holder is no longer running.
    async fn acquire_lock(&self, run_id: &RunId) -> Result<(), MigrationError> {
        let holder = match self.state.acquire_run_lock(R::CLASS, run_id).await? {
            LockOutcome::Acquired => return Ok(()),
            LockOutcome::HeldBy(holder) => holder,
        };

        let holder_running = self.active.contains_key(&holder)
            || matches!(
                self.state.load_checkpoint(&holder).await?,
                Some(cp) if cp.status == RunStatus::Running
            );
        if holder_running {
            return Err(MigrationError::MigrationAlreadyInProgress {
                class: R::CLASS,
                run_id: holder,
            });
        }

        warn!(class = %R::CLASS, stale = %holder, "Clearing stale backfill lock");
        self.state.release_run_lock(R::CLASS, &holder).await?;
        match self.state.acquire_run_lock(R::CLASS, run_id).await? {
            LockOutcome::Acquired => Ok(()),
            LockOutcome::HeldBy(holder) => Err(MigrationError::MigrationAlreadyInProgress {
                class: R::CLASS,
                run_id: holder,
            }),
        }
    }

    /// Mark the run as owned by this process until the guard drops.
    fn claim(&self, run_id: &RunId) -> Result<ActiveRun<'_>, MigrationError> {
        match self.active.entry(run_id.clone()) {
            Entry::Occupied(_) => Err(MigrationError::MigrationAlreadyInProgress {
                class: R::CLASS,
                run_id: run_id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ActiveRun {
                    active: &self.active,
                    stop_requests: &self.stop_requests,
                    run_id: run_id.clone(),
                })
            }
        }
    }

    async fn release_lock(&self, run_id: &RunId) {
        if let Err(e) = self.state.release_run_lock(R::CLASS, run_id).await {
            warn!(run_id = %run_id, error = %e, "Failed to release backfill lock");
        }
    }
}
