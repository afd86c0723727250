// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid router: dual-write / single-source read service.
//!
//! Every record operation reads the current [`RoutingPolicy`] snapshot and
//! issues the matching writes. Source and target writes run concurrently
//! and are joined into one [`WriteOutcome`] that says which store failed,
//! why, and whether a retry is worth it. Reads are always answered by
//! exactly one store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::codec::{DistributedItem, RecordCodec};
use crate::error::MigrationError;
use crate::metrics;
use crate::phase::{PhaseController, RoutingPolicy};
use crate::record::{MigrationRecord, RecordClass};
use crate::resilience::retry::{retry_when, Attempted, RetryConfig};
use crate::storage::traits::{SortRange, SourceStore, StorageError, TargetStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSide {
    Source,
    Target,
}

impl StoreSide {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Target => "target",
        }
    }
}

impl std::fmt::Display for StoreSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened on one store during a routed write.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoreWrite {
    /// False when the policy did not route to this store.
    pub attempted: bool,
    pub written: usize,
    pub failed: usize,
    /// Store calls made, retries included.
    pub attempts: usize,
    /// Last error seen, if any.
    pub error: Option<String>,
    /// Whether the failure looked transient.
    pub retryable: bool,
    /// Written records the store already held at a newer revision.
    pub superseded: usize,
}

impl StoreWrite {
    #[must_use]
    pub fn skipped() -> Self {
        Self::default()
    }

    fn from_attempt<T>(count: usize, attempted: Attempted<T, StorageError>) -> Self {
        match attempted.result {
            Ok(_) => Self {
                attempted: true,
                written: count,
                attempts: attempted.attempts,
                ..Self::default()
            },
            Err(e) => Self {
                attempted: true,
                failed: count,
                attempts: attempted.attempts,
                retryable: e.is_transient(),
                error: Some(e.to_string()),
                ..Self::default()
            },
        }
    }

    /// Records rejected before any store call (conversion failures).
    fn rejected(count: usize, reason: String) -> Self {
        Self {
            attempted: true,
            failed: count,
            error: Some(reason),
            ..Self::default()
        }
    }

    fn merge(&mut self, other: StoreWrite) {
        self.attempted |= other.attempted;
        self.written += other.written;
        self.failed += other.failed;
        self.attempts += other.attempts;
        self.superseded += other.superseded;
        if other.error.is_some() {
            self.retryable = other.retryable;
            self.error = other.error;
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.failed > 0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.attempted && self.failed == 0
    }

    fn status_label(&self) -> &'static str {
        match (self.attempted, self.is_failure()) {
            (false, _) => "skipped",
            (true, false) => "success",
            (true, true) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Every routed store accepted every record.
    Success,
    /// At least one store failed but the policy accepts the rest.
    Degraded,
    Failed,
}

impl WriteStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

/// Joined result of a routed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    pub source: StoreWrite,
    pub target: StoreWrite,
}

impl WriteOutcome {
    /// Apply the success rule: with `require_both_writes` every routed store
    /// must succeed, otherwise one clean store is enough.
    #[must_use]
    pub fn resolve(policy: &RoutingPolicy, source: StoreWrite, target: StoreWrite) -> Self {
        let any_failure = source.is_failure() || target.is_failure();
        let any_clean = source.is_clean() || target.is_clean();

        let status = if !any_failure {
            WriteStatus::Success
        } else if policy.require_both_writes || !any_clean {
            WriteStatus::Failed
        } else {
            WriteStatus::Degraded
        };
        Self { status, source, target }
    }

    /// Success or degraded-success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status != WriteStatus::Failed
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.status == WriteStatus::Degraded
    }

    #[must_use]
    pub fn store(&self, side: StoreSide) -> &StoreWrite {
        match side {
            StoreSide::Source => &self.source,
            StoreSide::Target => &self.target,
        }
    }

    #[must_use]
    pub fn failed_stores(&self) -> Vec<StoreSide> {
        [StoreSide::Source, StoreSide::Target]
            .into_iter()
            .filter(|side| self.store(*side).is_failure())
            .collect()
    }
}

impl std::fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.status.as_str())?;
        for side in self.failed_stores() {
            let w = self.store(side);
            write!(
                f,
                "; {} failed {} record(s): {}",
                side,
                w.failed,
                w.error.as_deref().unwrap_or("unknown error")
            )?;
        }
        Ok(())
    }
}

/// Write `items` to the target in chunks of the store's max batch size.
///
/// Each chunk is retried on its own; failed chunks are counted and the
/// remaining chunks still go out.
pub(crate) async fn write_chunked(
    target: &dyn TargetStore,
    items: &[DistributedItem],
    retry: &RetryConfig,
) -> StoreWrite {
    let mut total = StoreWrite {
        attempted: true,
        ..StoreWrite::default()
    };
    let chunk_size = target.max_batch_size().max(1);

    for chunk in items.chunks(chunk_size) {
        let attempted = retry_when("target_put_items", retry, StorageError::is_transient, || async {
            target.put_items(chunk).await.map(|batch| batch.superseded)
        })
        .await;
        metrics::record_retries(StoreSide::Target.as_str(), attempted.attempts.saturating_sub(1));
        let superseded = *attempted.result.as_ref().unwrap_or(&0);
        let write = StoreWrite {
            superseded,
            ..StoreWrite::from_attempt(chunk.len(), attempted)
        };
        if let Some(e) = &write.error {
            warn!(chunk = chunk.len(), error = %e, "Target batch chunk failed");
        }
        total.merge(write);
    }
    total
}

/// Routes writes and reads for one record class.
pub struct HybridRouter<R: MigrationRecord> {
    phase: Arc<PhaseController>,
    source: Arc<dyn SourceStore<R>>,
    target: Arc<dyn TargetStore>,
    codec: RecordCodec,
    retry: RetryConfig,
}

impl<R: MigrationRecord> HybridRouter<R> {
    pub fn new(
        phase: Arc<PhaseController>,
        source: Arc<dyn SourceStore<R>>,
        target: Arc<dyn TargetStore>,
        codec: RecordCodec,
        retry: RetryConfig,
    ) -> Self {
        Self {
            phase,
            source,
            target,
            codec,
            retry,
        }
    }

    #[must_use]
    pub fn class(&self) -> RecordClass {
        R::CLASS
    }

    #[must_use]
    pub fn policy(&self) -> RoutingPolicy {
        self.phase.routing_policy()
    }

    /// Write one record to the stores the current phase designates.
    pub async fn write_record(&self, record: &R) -> Result<WriteOutcome, MigrationError> {
        let policy = self.phase.routing_policy();
        let _timer = crate::time_operation!("router", "write");

        let source_write = async {
            if policy.writes_to_source {
                self.write_source(std::slice::from_ref(record)).await
            } else {
                StoreWrite::skipped()
            }
        };
        let target_write = async {
            if policy.writes_to_target {
                self.write_target(std::slice::from_ref(record)).await
            } else {
                StoreWrite::skipped()
            }
        };
        let (source, target) = tokio::join!(source_write, target_write);

        self.finish(&policy, source, target, &record.natural_key().to_string())
    }

    /// Batch variant of [`write_record`](Self::write_record). Target writes
    /// are chunked to the store's batch limit and aggregated.
    pub async fn write_batch(&self, records: &[R]) -> Result<WriteOutcome, MigrationError> {
        let policy = self.phase.routing_policy();
        let _timer = crate::time_operation!("router", "write_batch");

        let source_write = async {
            if policy.writes_to_source && !records.is_empty() {
                self.write_source(records).await
            } else {
                StoreWrite {
                    attempted: policy.writes_to_source,
                    ..StoreWrite::default()
                }
            }
        };
        let target_write = async {
            if policy.writes_to_target && !records.is_empty() {
                self.write_target(records).await
            } else {
                StoreWrite {
                    attempted: policy.writes_to_target,
                    ..StoreWrite::default()
                }
            }
        };
        let (source, target) = tokio::join!(source_write, target_write);

        self.finish(&policy, source, target, &format!("batch of {}", records.len()))
    }

    async fn write_source(&self, records: &[R]) -> StoreWrite {
        let attempted = if let [record] = records {
            retry_when("source_insert", &self.retry, StorageError::is_transient, || {
                self.source.insert(record)
            })
            .await
        } else {
            let batch = retry_when("source_insert_batch", &self.retry, StorageError::is_transient, || {
                self.source.insert_batch(records)
            })
            .await;
            Attempted {
                result: batch.result.map(|_| ()),
                attempts: batch.attempts,
            }
        };
        metrics::record_retries(StoreSide::Source.as_str(), attempted.attempts.saturating_sub(1));
        let write = StoreWrite::from_attempt(records.len(), attempted);
        metrics::record_store_operation(StoreSide::Source.as_str(), "write", write.status_label());
        write
    }

    async fn write_target(&self, records: &[R]) -> StoreWrite {
        let mut items = Vec::with_capacity(records.len());
        let mut rejected = 0usize;
        let mut last_reason = None;

        for record in records {
            match self.codec.encode(record) {
                Ok(item) => items.push(item),
                Err(e) => {
                    metrics::record_conversion_failure(R::CLASS.as_str());
                    warn!(class = %R::CLASS, locator = %e.locator, reason = %e.reason, "Record cannot be converted for target");
                    rejected += 1;
                    last_reason = Some(e.to_string());
                }
            }
        }

        let mut write = if let [item] = items.as_slice() {
            let attempted = retry_when("target_put_item", &self.retry, StorageError::is_transient, || {
                self.target.put_item(item)
            })
            .await;
            metrics::record_retries(StoreSide::Target.as_str(), attempted.attempts.saturating_sub(1));
            let superseded = usize::from(matches!(attempted.result, Ok(false)));
            StoreWrite {
                superseded,
                ..StoreWrite::from_attempt(1, attempted)
            }
        } else {
            write_chunked(self.target.as_ref(), &items, &self.retry).await
        };
        if let Some(reason) = last_reason {
            write.merge(StoreWrite::rejected(rejected, reason));
        }
        metrics::record_store_operation(StoreSide::Target.as_str(), "write", write.status_label());
        write
    }

    fn finish(
        &self,
        policy: &RoutingPolicy,
        source: StoreWrite,
        target: StoreWrite,
        what: &str,
    ) -> Result<WriteOutcome, MigrationError> {
        let outcome = WriteOutcome::resolve(policy, source, target);
        metrics::record_write_outcome(R::CLASS.as_str(), outcome.status.as_str());

        match outcome.status {
            WriteStatus::Success => {
                debug!(class = %R::CLASS, what, "Write routed");
            }
            _ => {
                warn!(
                    class = %R::CLASS,
                    what,
                    status = outcome.status.as_str(),
                    source_error = outcome.source.error.as_deref().unwrap_or(""),
                    target_error = outcome.target.error.as_deref().unwrap_or(""),
                    source_retryable = outcome.source.retryable,
                    target_retryable = outcome.target.retryable,
                    "Write did not reach every routed store"
                );
                if !policy.continue_on_write_failure {
                    metrics::record_write_escalation(R::CLASS.as_str());
                    error!(class = %R::CLASS, what, outcome = %outcome, "Escalating write failure");
                    return Err(MigrationError::DualWriteFailure(Box::new(outcome)));
                }
            }
        }
        Ok(outcome)
    }

    /// Records owned by `owner`, newest first, from the store the phase reads from.
    pub async fn read_by_application(&self, owner: i64) -> Result<Vec<R>, MigrationError> {
        let policy = self.phase.routing_policy();
        let _timer = crate::time_operation!("router", "read");

        let mut records = if policy.reads_from_target {
            let index_key = R::owner_index_key(owner);
            let items = retry_when("target_query_index", &self.retry, StorageError::is_transient, || {
                self.target.query_index(R::OWNER_INDEX, &index_key)
            })
            .await
            .result?;
            self.decode_all(&items)?
        } else {
            retry_when("source_query_by_application", &self.retry, StorageError::is_transient, || {
                self.source.query_by_application(owner)
            })
            .await
            .result?
        };
        newest_first(&mut records);
        Ok(records)
    }

    /// Records of `scope` with `start <= timestamp <= end`, newest first.
    pub async fn read_by_time_range(
        &self,
        scope: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<R>, MigrationError> {
        if start > end {
            return Err(MigrationError::InvalidOptions(format!(
                "time range start {} is after end {}",
                start, end
            )));
        }
        let policy = self.phase.routing_policy();
        let _timer = crate::time_operation!("router", "read");

        let mut records = if policy.reads_from_target {
            let (from, to) = R::sort_range(start, end);
            let range = SortRange::new(from, to);
            let mut records = Vec::new();
            for partition in R::partitions_for_range(scope, start, end) {
                let items = retry_when("target_query_partition", &self.retry, StorageError::is_transient, || {
                    self.target.query_partition(&partition, Some(&range))
                })
                .await
                .result?;
                records.extend(self.decode_all(&items)?);
            }
            records.retain(|r: &R| r.scope() == scope && r.timestamp() >= start && r.timestamp() <= end);
            records
        } else {
            retry_when("source_query_by_time_range", &self.retry, StorageError::is_transient, || {
                self.source.query_by_time_range(scope, start, end)
            })
            .await
            .result?
        };
        newest_first(&mut records);
        Ok(records)
    }

    fn decode_all(&self, items: &[DistributedItem]) -> Result<Vec<R>, MigrationError> {
        items
            .iter()
            .map(|item| self.codec.decode::<R>(item).map_err(MigrationError::from))
            .collect()
    }
}

fn newest_first<R: MigrationRecord>(records: &mut [R]) {
    records.sort_by(|a, b| b.natural_key().cmp(&a.natural_key()));
}
