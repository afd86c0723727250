// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical record types moved by the migration engine.
//!
//! Two record classes flow through the engine:
//! - [`LogRecord`]: append-only integration/audit events, scoped by service
//! - [`PaymentRecord`]: financial events, scoped by customer, with a
//!   monotonic status lifecycle
//!
//! Both implement [`MigrationRecord`], which is everything the router,
//! validator and backfill migrator need to know about a record: its natural
//! key, its scope, its owner reference and how it maps onto the
//! distributed store's keys.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{self, IndexEntry};
use crate::error::MigrationError;

/// Record class being migrated. One backfill run per class at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordClass {
    Logs,
    Payments,
}

impl RecordClass {
    pub const ALL: [RecordClass; 2] = [RecordClass::Logs, RecordClass::Payments];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Payments => "payments",
        }
    }

    /// Relational table holding this class.
    #[must_use]
    pub fn source_table(&self) -> &'static str {
        match self {
            Self::Logs => "integration_logs",
            Self::Payments => "payments",
        }
    }

    /// Key-value table (namespace) holding this class.
    #[must_use]
    pub fn target_table(&self) -> &'static str {
        match self {
            Self::Logs => "integration-logs",
            Self::Payments => "payments",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logs" => Some(Self::Logs),
            "payments" => Some(Self::Payments),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a source record, ordered by time, then scope, then id.
///
/// This is the backfill cursor: everything at or before a committed key has
/// been migrated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub timestamp_ms: i64,
    pub scope: String,
    pub id: i64,
}

impl NaturalKey {
    pub fn new(timestamp_ms: i64, scope: impl Into<String>, id: i64) -> Self {
        Self {
            timestamp_ms,
            scope: scope.into(),
            id,
        }
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.timestamp_ms, self.id)
    }
}

/// Behaviour shared by every record class the engine can migrate.
pub trait MigrationRecord:
    Clone + std::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const CLASS: RecordClass;

    /// Secondary index answering [`owner_ref`](Self::owner_ref) lookups.
    const OWNER_INDEX: &'static str;

    fn record_id(&self) -> i64;

    /// Grouping used for time-range reads (service name, customer id).
    fn scope(&self) -> String;

    fn timestamp(&self) -> DateTime<Utc>;

    /// Owning entity reference (application id for logs, loan id for payments).
    fn owner_ref(&self) -> Option<i64>;

    fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(self.timestamp().timestamp_millis(), self.scope(), self.record_id())
    }

    fn partition_key(&self) -> String;

    fn sort_key(&self) -> String;

    fn index_entries(&self) -> Vec<IndexEntry>;

    /// Index key for an owner reference.
    fn owner_index_key(owner: i64) -> String;

    /// Partitions a time-range read over `scope` has to visit.
    fn partitions_for_range(scope: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String>;

    /// Inclusive sort-key bounds covering `[start, end]`.
    fn sort_range(start: DateTime<Utc>, end: DateTime<Utc>) -> (String, String);

    /// Static validity checks. Returns the reason on failure.
    fn validate(&self) -> Result<(), String>;

    /// Version ordering for overwrites of the same key. A stored item is
    /// only replaced by one whose revision is not lower. Immutable records
    /// stay at zero.
    fn revision(&self) -> i64 {
        0
    }
}

/// An event emitted by an integration point. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log_id: i64,
    pub timestamp: DateTime<Utc>,
    pub service_name: String,
    pub log_type: String,
    #[serde(default)]
    pub application_id: Option<i64>,
    #[serde(default)]
    pub request_data: Option<String>,
    #[serde(default)]
    pub response_data: Option<String>,
    pub is_success: bool,
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processing_time_ms: Option<i64>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl LogRecord {
    /// Minimal successful log entry; optional fields start empty.
    pub fn new(
        log_id: i64,
        service_name: impl Into<String>,
        log_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            log_id,
            timestamp,
            service_name: service_name.into(),
            log_type: log_type.into(),
            application_id: None,
            request_data: None,
            response_data: None,
            is_success: true,
            status_code: None,
            error_message: None,
            processing_time_ms: None,
            correlation_id: None,
            user_id: None,
        }
    }

    #[must_use]
    pub fn with_application(mut self, application_id: i64) -> Self {
        self.application_id = Some(application_id);
        self
    }

    #[must_use]
    pub fn failed(mut self, status_code: impl Into<String>, error: impl Into<String>) -> Self {
        self.is_success = false;
        self.status_code = Some(status_code.into());
        self.error_message = Some(error.into());
        self
    }
}

impl MigrationRecord for LogRecord {
    const CLASS: RecordClass = RecordClass::Logs;
    const OWNER_INDEX: &'static str = "application";

    fn record_id(&self) -> i64 {
        self.log_id
    }

    fn scope(&self) -> String {
        self.service_name.clone()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn owner_ref(&self) -> Option<i64> {
        self.application_id
    }

    fn partition_key(&self) -> String {
        codec::log_partition_key(&self.service_name, self.timestamp.date_naive())
    }

    fn sort_key(&self) -> String {
        codec::log_sort_key(self.timestamp, self.log_id)
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        self.application_id
            .map(|app| vec![IndexEntry::new(Self::OWNER_INDEX, Self::owner_index_key(app))])
            .unwrap_or_default()
    }

    fn owner_index_key(owner: i64) -> String {
        format!("APP#{}", owner)
    }

    fn partitions_for_range(scope: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<String> {
        let mut partitions = Vec::new();
        let mut day = start.date_naive();
        let last = end.date_naive();
        while day <= last {
            partitions.push(codec::log_partition_key(scope, day));
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        partitions
    }

    fn sort_range(start: DateTime<Utc>, end: DateTime<Utc>) -> (String, String) {
        (
            codec::format_log_timestamp(start),
            format!("{}{}", codec::format_log_timestamp(end), codec::SORT_KEY_UPPER_SUFFIX),
        )
    }

    fn validate(&self) -> Result<(), String> {
        if self.log_id < 0 {
            return Err(format!("negative log id {}", self.log_id));
        }
        codec::check_key_component("service_name", &self.service_name)?;
        if self.log_type.trim().is_empty() {
            return Err("log_type is empty".to_string());
        }
        Ok(())
    }
}

/// Revision span reserved for each lifecycle rank (epoch millis fit below it).
const REVISION_RANK_STEP: i64 = 100_000_000_000_000;

/// Lifecycle of a payment. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Refunded => "Refunded",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded)
    }

    /// Position in the lifecycle; every legal transition increases it.
    #[must_use]
    pub fn lifecycle_rank(&self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Completed | Self::Failed => 1,
            Self::Refunded => 2,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Completed, Self::Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A financial event. Payment id is globally unique.
///
/// Amounts are held in minor units to keep the record exact across both
/// stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: i64,
    pub loan_id: i64,
    pub customer_id: i64,
    pub amount_cents: i64,
    pub payment_date: DateTime<Utc>,
    pub method: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub transaction_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    pub fn new(
        payment_id: i64,
        loan_id: i64,
        customer_id: i64,
        amount_cents: i64,
        payment_date: DateTime<Utc>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            payment_id,
            loan_id,
            customer_id,
            amount_cents,
            payment_date,
            method: method.into(),
            status: PaymentStatus::Pending,
            transaction_reference: None,
            created_at: payment_date,
            updated_at: None,
        }
    }

    /// Move the payment to `next`, rejecting regressions.
    pub fn update_status(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> Result<(), MigrationError> {
        if !self.status.can_transition_to(next) {
            return Err(MigrationError::InvalidStatusTransition {
                payment_id: self.payment_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Some(at);
        Ok(())
    }
}

impl MigrationRecord for PaymentRecord {
    const CLASS: RecordClass = RecordClass::Payments;
    const OWNER_INDEX: &'static str = "loan";

    fn record_id(&self) -> i64 {
        self.payment_id
    }

    fn scope(&self) -> String {
        self.customer_id.to_string()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.payment_date
    }

    fn owner_ref(&self) -> Option<i64> {
        Some(self.loan_id)
    }

    fn partition_key(&self) -> String {
        codec::payment_partition_key(&self.customer_id.to_string())
    }

    fn sort_key(&self) -> String {
        codec::payment_sort_key(self.payment_date, self.payment_id)
    }

    fn index_entries(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(Self::OWNER_INDEX, Self::owner_index_key(self.loan_id)),
            IndexEntry::new(codec::STATUS_INDEX, codec::payment_status_index_key(self.status)),
        ]
    }

    fn owner_index_key(owner: i64) -> String {
        format!("LOAN#{}", owner)
    }

    fn partitions_for_range(scope: &str, _start: DateTime<Utc>, _end: DateTime<Utc>) -> Vec<String> {
        vec![codec::payment_partition_key(scope)]
    }

    fn sort_range(start: DateTime<Utc>, end: DateTime<Utc>) -> (String, String) {
        (
            codec::format_payment_timestamp(start),
            format!("{}{}", codec::format_payment_timestamp(end), codec::SORT_KEY_UPPER_SUFFIX),
        )
    }

    fn validate(&self) -> Result<(), String> {
        if self.payment_id < 0 || self.loan_id < 0 || self.customer_id < 0 {
            return Err(format!(
                "negative identifier (payment {}, loan {}, customer {})",
                self.payment_id, self.loan_id, self.customer_id
            ));
        }
        if self.amount_cents <= 0 {
            return Err(format!("non-positive amount {}", self.amount_cents));
        }
        if self.method.trim().is_empty() {
            return Err("payment method is empty".to_string());
        }
        Ok(())
    }

    /// Lifecycle rank first, then the last update time.
    fn revision(&self) -> i64 {
        let updated_ms = self.updated_at.map_or(0, |t| t.timestamp_millis().clamp(0, REVISION_RANK_STEP - 1));
        self.status.lifecycle_rank() * REVISION_RANK_STEP + updated_ms
    }
}
