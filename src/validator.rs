// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistency validator.
//!
//! Compares the source and target stores over a time window. Counts from
//! both sides are fetched concurrently and compared with a tolerance
//! proportional to the source count (never below one record). Optional
//! sampling re-encodes source records and checks the stored target item
//! field by field.
//!
//! Validation is read-only and runs alongside live traffic, so counts are
//! a point-in-time approximation. Store failures become [`Discrepancy`]
//! entries; a partial report is still a report.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{DistributedItem, RecordCodec};
use crate::error::MigrationError;
use crate::metrics;
use crate::record::{MigrationRecord, NaturalKey, RecordClass};
use crate::resilience::retry::{retry_when, RetryConfig};
use crate::storage::traits::{SourceStore, StorageError, TargetStore};

/// Rows fetched per source page while sampling.
const SAMPLE_PAGE: usize = 200;

/// One finding of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// Count gap beyond tolerance.
    CountMismatch { source: u64, target: u64, tolerance: f64 },
    SourceQueryFailed { error: String },
    TargetQueryFailed { error: String },
    MissingInTarget { key: String },
    FieldMismatch { key: String, fields: Vec<String> },
    UnreadableSourceRow { key: String, reason: String },
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CountMismatch { source, target, tolerance } => {
                write!(f, "count mismatch: source {} vs target {} (tolerance {:.0})", source, target, tolerance)
            }
            Self::SourceQueryFailed { error } => write!(f, "source query failed: {}", error),
            Self::TargetQueryFailed { error } => write!(f, "target query failed: {}", error),
            Self::MissingInTarget { key } => write!(f, "{} missing in target", key),
            Self::FieldMismatch { key, fields } => write!(f, "{} differs in {}", key, fields.join(", ")),
            Self::UnreadableSourceRow { key, reason } => write!(f, "{} unreadable: {}", key, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub class: RecordClass,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// None when the count query failed.
    pub source_count: Option<u64>,
    pub target_count: Option<u64>,
    pub tolerance: f64,
    pub is_consistent: bool,
    pub discrepancies: Vec<Discrepancy>,
    /// Source records compared field by field.
    pub sampled: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ValidationReport {
    /// Absolute count gap, when both counts are known.
    #[must_use]
    pub fn count_gap(&self) -> Option<u64> {
        match (self.source_count, self.target_count) {
            (Some(s), Some(t)) => Some(s.abs_diff(t)),
            _ => None,
        }
    }
}

/// Allowed count gap: `ratio` of the source count, at least one record.
#[must_use]
pub fn tolerance_for(source_count: u64, ratio: f64) -> f64 {
    (source_count as f64 * ratio).max(1.0)
}

pub struct ConsistencyValidator<R: MigrationRecord> {
    source: Arc<dyn SourceStore<R>>,
    target: Arc<dyn TargetStore>,
    codec: RecordCodec,
    tolerance_ratio: f64,
    retry: RetryConfig,
    last_report: RwLock<Option<ValidationReport>>,
}

impl<R: MigrationRecord> ConsistencyValidator<R> {
    pub fn new(
        source: Arc<dyn SourceStore<R>>,
        target: Arc<dyn TargetStore>,
        codec: RecordCodec,
        tolerance_ratio: f64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            source,
            target,
            codec,
            tolerance_ratio,
            retry,
            last_report: RwLock::new(None),
        }
    }

    /// Compare counts for `start <= timestamp <= end`.
    pub async fn validate_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ValidationReport, MigrationError> {
        self.run(start, end, 0).await
    }

    /// Counts plus a field-level check of up to `sample_size` source records.
    pub async fn validate_sample(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_size: usize,
    ) -> Result<ValidationReport, MigrationError> {
        self.run(start, end, sample_size).await
    }

    #[must_use]
    pub fn last_report(&self) -> Option<ValidationReport> {
        self.last_report.read().clone()
    }

    async fn run(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_size: usize,
    ) -> Result<ValidationReport, MigrationError> {
        if start > end {
            return Err(MigrationError::InvalidOptions(format!(
                "validation window start {} is after end {}",
                start, end
            )));
        }
        let started_at = Utc::now();
        let timer = Instant::now();

        // Records past retention are never migrated and expire from the target
        let horizon = self.codec.now() - self.codec.retention(R::CLASS);
        let live_start = start.max(horizon);
        if live_start > end {
            debug!(class = %R::CLASS, horizon = %horizon, "Window is entirely past retention");
            return Ok(self.publish(ValidationReport {
                class: R::CLASS,
                window_start: start,
                window_end: end,
                source_count: Some(0),
                target_count: Some(0),
                tolerance: tolerance_for(0, self.tolerance_ratio),
                is_consistent: true,
                discrepancies: Vec::new(),
                sampled: 0,
                started_at,
                duration_ms: timer.elapsed().as_millis() as u64,
            }));
        }

        let source_count = async {
            retry_when("source_count", &self.retry, StorageError::is_transient, || {
                self.source.count_by_time_range(live_start, end)
            })
            .await
            .result
        };
        let target_count = async {
            retry_when("target_count", &self.retry, StorageError::is_transient, || {
                self.target.count_between(live_start.timestamp_millis(), end.timestamp_millis())
            })
            .await
            .result
        };
        let (source_count, target_count) = tokio::join!(source_count, target_count);

        let mut discrepancies = Vec::new();
        let source_count = source_count
            .map_err(|e| discrepancies.push(Discrepancy::SourceQueryFailed { error: e.to_string() }))
            .ok();
        let target_count = target_count
            .map_err(|e| discrepancies.push(Discrepancy::TargetQueryFailed { error: e.to_string() }))
            .ok();

        let tolerance = tolerance_for(source_count.unwrap_or(0), self.tolerance_ratio);
        if let (Some(source), Some(target)) = (source_count, target_count) {
            let gap = source.abs_diff(target);
            metrics::set_validation_gap(R::CLASS.as_str(), gap as f64);
            if gap as f64 > tolerance {
                discrepancies.push(Discrepancy::CountMismatch { source, target, tolerance });
            }
        }

        let sampled = if sample_size > 0 {
            self.sample(live_start, end, sample_size, &mut discrepancies).await
        } else {
            0
        };

        let report = ValidationReport {
            class: R::CLASS,
            window_start: start,
            window_end: end,
            source_count,
            target_count,
            tolerance,
            is_consistent: discrepancies.is_empty(),
            discrepancies,
            sampled,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
        };

        Ok(self.publish(report))
    }

    fn publish(&self, report: ValidationReport) -> ValidationReport {
        metrics::record_validation(R::CLASS.as_str(), report.is_consistent);
        if report.is_consistent {
            info!(
                class = %R::CLASS,
                source_count = ?report.source_count,
                target_count = ?report.target_count,
                sampled = report.sampled,
                "Stores consistent for window"
            );
        } else {
            warn!(
                class = %R::CLASS,
                source_count = ?report.source_count,
                target_count = ?report.target_count,
                discrepancies = report.discrepancies.len(),
                first = %report.discrepancies[0],
                "Stores inconsistent for window"
            );
        }

        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Returns how many records were compared.
    async fn sample(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_size: usize,
        discrepancies: &mut Vec<Discrepancy>,
    ) -> usize {
        // fetch_page is half-open; the window is inclusive
        let page_end = end + Duration::milliseconds(1);
        let mut cursor: Option<NaturalKey> = None;
        let mut compared = 0usize;

        while compared < sample_size {
            let limit = (sample_size - compared).min(SAMPLE_PAGE);
            let page = retry_when("source_fetch_page", &self.retry, StorageError::is_transient, || {
                self.source.fetch_page(start, page_end, cursor.as_ref(), limit)
            })
            .await
            .result;
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    discrepancies.push(Discrepancy::SourceQueryFailed { error: e.to_string() });
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|row| row.key.clone());

            for row in page {
                compared += 1;
                let record = match row.record {
                    Ok(record) => record,
                    Err(e) => {
                        discrepancies.push(Discrepancy::UnreadableSourceRow {
                            key: row.key.to_string(),
                            reason: e.reason,
                        });
                        continue;
                    }
                };
                if self.codec.is_past_retention(&record) {
                    continue;
                }
                let expected = match self.codec.encode(&record) {
                    Ok(item) => item,
                    Err(e) => {
                        discrepancies.push(Discrepancy::UnreadableSourceRow {
                            key: row.key.to_string(),
                            reason: e.reason,
                        });
                        continue;
                    }
                };
                let stored = retry_when("target_get_item", &self.retry, StorageError::is_transient, || {
                    self.target.get_item(&expected.key)
                })
                .await
                .result;
                match stored {
                    Ok(Some(actual)) => {
                        let fields = differing_fields(&expected, &actual);
                        if !fields.is_empty() {
                            discrepancies.push(Discrepancy::FieldMismatch {
                                key: row.key.to_string(),
                                fields,
                            });
                        }
                    }
                    Ok(None) => discrepancies.push(Discrepancy::MissingInTarget {
                        key: row.key.to_string(),
                    }),
                    Err(e) => {
                        discrepancies.push(Discrepancy::TargetQueryFailed { error: e.to_string() });
                        return compared;
                    }
                }
            }
        }
        compared
    }
}

/// Names of the attributes (and item metadata) that differ.
fn differing_fields(expected: &DistributedItem, actual: &DistributedItem) -> Vec<String> {
    let mut fields = Vec::new();
    if expected.expires_at != actual.expires_at {
        fields.push("expires_at".to_string());
    }
    if expected.indexes != actual.indexes {
        fields.push("indexes".to_string());
    }
    match (expected.attributes.as_object(), actual.attributes.as_object()) {
        (Some(exp), Some(act)) => {
            for (name, value) in exp {
                if act.get(name) != Some(value) {
                    fields.push(name.clone());
                }
            }
            for name in act.keys() {
                if !exp.contains_key(name) {
                    fields.push(name.clone());
                }
            }
        }
        _ => {
            if expected.attributes != actual.attributes {
                fields.push("attributes".to_string());
            }
        }
    }
    fields
}
