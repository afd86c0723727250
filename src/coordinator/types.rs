// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types returned by the engine's administrative surface.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::backfill::{BackfillCheckpoint, RunId};
use crate::phase::{MigrationPhase, PhaseOverrides, RoutingPolicy};
use crate::record::RecordClass;
use crate::router::StoreSide;
use crate::validator::ValidationReport;

/// Snapshot answering the operator's status query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: MigrationPhase,
    /// Bumped on every persisted phase or override change.
    pub phase_version: u64,
    pub policy: RoutingPolicy,
    pub overrides: PhaseOverrides,
    pub last_validation: BTreeMap<RecordClass, ValidationReport>,
    /// Runs being driven by this process.
    pub active_runs: Vec<RunId>,
    /// Newest run per class, whatever its status.
    pub latest_runs: BTreeMap<RecordClass, BackfillCheckpoint>,
}

/// Overall engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// At least one store did not answer its probe.
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// Probe result for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub class: RecordClass,
    pub side: StoreSide,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub phase: MigrationPhase,
    pub stores: Vec<StoreHealth>,
}

impl HealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    /// Stores that failed their probe.
    #[must_use]
    pub fn unreachable(&self) -> Vec<&StoreHealth> {
        self.stores.iter().filter(|s| !s.reachable).collect()
    }
}
