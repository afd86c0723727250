// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level error taxonomy.
//!
//! Store-level failures live in [`StorageError`]; this module covers the
//! operator and policy errors the engine itself raises. Count mismatches
//! found by the validator are reported as
//! [`Discrepancy`](crate::validator::Discrepancy) entries, never as errors.

use thiserror::Error;

use crate::backfill::{RunId, RunStatus};
use crate::phase::MigrationPhase;
use crate::record::{PaymentStatus, RecordClass};
use crate::router::WriteOutcome;
use crate::storage::traits::StorageError;

/// A source record that cannot be turned into a target item.
///
/// Carries enough context to find and fix the source row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot convert {class} record {locator}: {reason}")]
pub struct RecordConversionError {
    pub class: RecordClass,
    /// Natural key or row description of the offending record.
    pub locator: String,
    pub reason: String,
}

impl RecordConversionError {
    pub fn new(class: RecordClass, locator: &str, reason: impl Into<String>) -> Self {
        Self {
            class,
            locator: locator.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition {
        from: MigrationPhase,
        to: MigrationPhase,
    },

    #[error("a {class} backfill is already in progress (run {run_id})")]
    MigrationAlreadyInProgress { class: RecordClass, run_id: RunId },

    #[error("backfill run {0} not found")]
    RunNotFound(RunId),

    #[error("backfill run {run_id} cannot be resumed from status {status}")]
    RunNotResumable { run_id: RunId, status: RunStatus },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("payment {payment_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        payment_id: i64,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error(transparent)]
    RecordConversion(#[from] RecordConversionError),

    #[error("background task failed: {0}")]
    BackgroundTask(String),

    #[error("dual write failed: {0}")]
    DualWriteFailure(Box<WriteOutcome>),

    #[error(transparent)]
    Store(#[from] StorageError),
}

impl MigrationError {
    /// The write outcome behind an escalated dual-write failure.
    #[must_use]
    pub fn write_outcome(&self) -> Option<&WriteOutcome> {
        match self {
            Self::DualWriteFailure(outcome) => Some(outcome),
            _ => None,
        }
    }
}
