// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record codec: canonical records ⇄ distributed-store items.
//!
//! Key layout:
//!
//! ```text
//! logs      PK = {service}#{yyyy-mm-dd}     SK = {yyyy-mm-ddTHH:MM:SS.fffZ}#{id:020}
//!           index application → APP#{application_id}
//! payments  PK = CUSTOMER#{customer_id}     SK = {yyyy-mm-ddTHH:MM:SSZ}#{payment_id:020}
//!           index loan → LOAN#{loan_id}, index status → STATUS#{status}
//! ```
//!
//! Sort keys start with a fixed-width UTC timestamp, so lexicographic order
//! is time order and "most recent N" is a reverse scan of one partition.
//!
//! Expiry is anchored on the record's own timestamp plus the class
//! retention. Encoding the same record twice therefore produces an
//! identical item, which is what makes backfill re-runs a no-op overwrite.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MigrationConfig;
use crate::error::RecordConversionError;
use crate::record::{MigrationRecord, PaymentStatus, RecordClass};

/// Separator between the timestamp and id parts of a sort key.
pub const KEY_SEPARATOR: char = '#';

/// Appended to an upper sort-key bound so every id at that instant sorts below it.
pub const SORT_KEY_UPPER_SUFFIX: &str = "#~";

/// Secondary index over payment status.
pub const STATUS_INDEX: &str = "status";

/// Allowed clock skew before a record timestamp counts as "in the future".
const FUTURE_SKEW_SECS: i64 = 300;

/// Source of "now" for expiry and skew checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[must_use]
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[must_use]
pub fn format_log_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[must_use]
pub fn format_payment_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[must_use]
pub fn log_partition_key(service: &str, day: NaiveDate) -> String {
    format!("{}{}{}", service, KEY_SEPARATOR, day.format("%Y-%m-%d"))
}

#[must_use]
pub fn log_sort_key(ts: DateTime<Utc>, log_id: i64) -> String {
    format!("{}{}{:020}", format_log_timestamp(ts), KEY_SEPARATOR, log_id)
}

#[must_use]
pub fn payment_partition_key(customer: &str) -> String {
    format!("CUSTOMER{}{}", KEY_SEPARATOR, customer)
}

#[must_use]
pub fn payment_sort_key(ts: DateTime<Utc>, payment_id: i64) -> String {
    format!("{}{}{:020}", format_payment_timestamp(ts), KEY_SEPARATOR, payment_id)
}

#[must_use]
pub fn payment_status_index_key(status: PaymentStatus) -> String {
    format!("STATUS{}{}", KEY_SEPARATOR, status)
}

/// Reject values that would corrupt the composite key layout.
pub fn check_key_component(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is empty", field));
    }
    if value.contains(KEY_SEPARATOR) || value.contains('|') {
        return Err(format!("{} '{}' contains a reserved key separator", field, value));
    }
    Ok(())
}

/// Composite primary key of a distributed item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.partition, self.sort)
    }
}

/// Membership of an item in a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub index: String,
    pub key: String,
}

impl IndexEntry {
    pub fn new(index: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            key: key.into(),
        }
    }
}

/// An item as stored in the distributed key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedItem {
    pub key: ItemKey,
    pub class: RecordClass,
    /// Record time (epoch millis), used for time-window counts.
    pub timestamp_ms: i64,
    /// Expiry (epoch seconds). The store drops the item after this instant.
    pub expires_at: i64,
    #[serde(default)]
    pub indexes: Vec<IndexEntry>,
    /// Record revision; stores keep the highest one they have seen.
    #[serde(default)]
    pub revision: i64,
    pub attributes: serde_json::Value,
}

impl DistributedItem {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }

    /// Whether writing `self` over `stored` would move the item backwards.
    #[must_use]
    pub fn is_superseded_by(&self, stored: &DistributedItem) -> bool {
        stored.revision > self.revision
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Converts records to and from [`DistributedItem`]s.
#[derive(Clone)]
pub struct RecordCodec {
    log_retention: Duration,
    payment_retention: Duration,
    clock: Clock,
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("log_retention", &self.log_retention)
            .field("payment_retention", &self.payment_retention)
            .finish_non_exhaustive()
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

impl RecordCodec {
    #[must_use]
    pub fn new(log_retention_days: u32, payment_retention_days: u32) -> Self {
        Self {
            log_retention: Duration::days(i64::from(log_retention_days)),
            payment_retention: Duration::days(i64::from(payment_retention_days)),
            clock: system_clock(),
        }
    }

    #[must_use]
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.log_retention_days, config.payment_retention_days)
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    #[must_use]
    pub fn retention(&self, class: RecordClass) -> Duration {
        match class {
            RecordClass::Logs => self.log_retention,
            RecordClass::Payments => self.payment_retention,
        }
    }

    /// Expiry (epoch seconds) for a record.
    pub fn expires_at<R: MigrationRecord>(&self, record: &R) -> Result<i64, RecordConversionError> {
        record
            .timestamp()
            .checked_add_signed(self.retention(R::CLASS))
            .map(|expiry| expiry.timestamp())
            .ok_or_else(|| {
                RecordConversionError::new(
                    R::CLASS,
                    &record.natural_key().to_string(),
                    format!("expiry of timestamp {} is out of range", record.timestamp()),
                )
            })
    }

    /// Whether the record's retention has already elapsed. A record whose
    /// expiry is out of range is not; [`encode`](Self::encode) rejects it.
    #[must_use]
    pub fn is_past_retention<R: MigrationRecord>(&self, record: &R) -> bool {
        self.expires_at(record)
            .map_or(false, |expires_at| expires_at <= self.now().timestamp())
    }

    pub fn encode<R: MigrationRecord>(&self, record: &R) -> Result<DistributedItem, RecordConversionError> {
        let locator = record.natural_key().to_string();
        record
            .validate()
            .map_err(|reason| RecordConversionError::new(R::CLASS, &locator, reason))?;

        let horizon = self.now() + Duration::seconds(FUTURE_SKEW_SECS);
        if record.timestamp() > horizon {
            return Err(RecordConversionError::new(
                R::CLASS,
                &locator,
                format!("timestamp {} is in the future", record.timestamp()),
            ));
        }

        let attributes = serde_json::to_value(record)
            .map_err(|e| RecordConversionError::new(R::CLASS, &locator, e.to_string()))?;

        Ok(DistributedItem {
            key: ItemKey::new(record.partition_key(), record.sort_key()),
            class: R::CLASS,
            timestamp_ms: record.timestamp().timestamp_millis(),
            expires_at: self.expires_at(record)?,
            indexes: record.index_entries(),
            revision: record.revision(),
            attributes,
        })
    }

    pub fn decode<R: MigrationRecord>(&self, item: &DistributedItem) -> Result<R, RecordConversionError> {
        if item.class != R::CLASS {
            return Err(RecordConversionError::new(
                R::CLASS,
                &item.key.to_string(),
                format!("item belongs to class {}", item.class),
            ));
        }
        serde_json::from_value(item.attributes.clone())
            .map_err(|e| RecordConversionError::new(R::CLASS, &item.key.to_string(), e.to_string()))
    }
}
