// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration engine facade.
//!
//! The [`MigrationEngine`] wires every component together:
//! - one [`PhaseController`] shared by all record classes
//! - per class, a [`HybridRouter`], a [`ConsistencyValidator`] and a
//!   [`BackfillMigrator`] over the same source/target store pair
//! - a durable [`StateStore`] for the phase and backfill checkpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use migration_engine::{MigrationConfig, MigrationEngine, MigrationPhase};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), migration_engine::MigrationError> {
//! let engine = MigrationEngine::in_memory(MigrationConfig::default()).await?;
//! assert_eq!(engine.phase(), MigrationPhase::SourceOnly);
//!
//! engine.advance_to_dual_write("ops").await?;
//! assert!(engine.routing_policy().is_dual_write());
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use lifecycle::EngineStores;
pub use types::{HealthReport, HealthStatus, StatusReport, StoreHealth};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backfill::{BackfillMigrator, RunId, RunResult};
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::lookup_cache::TimedCache;
use crate::metrics;
use crate::phase::{MigrationPhase, PhaseController, RoutingPolicy};
use crate::record::{LogRecord, MigrationRecord, PaymentRecord, RecordClass};
use crate::router::{HybridRouter, StoreSide};
use crate::storage::state::StateStore;
use crate::storage::traits::{SourceStore, TargetStore};
use crate::validator::ConsistencyValidator;

/// Everything the engine runs for one record class.
pub struct ClassPipeline<R: MigrationRecord> {
    pub router: Arc<HybridRouter<R>>,
    pub validator: Arc<ConsistencyValidator<R>>,
    pub backfill: Arc<BackfillMigrator<R>>,
    source: Arc<dyn SourceStore<R>>,
    target: Arc<dyn TargetStore>,
}

impl<R: MigrationRecord> ClassPipeline<R> {
    async fn probe(&self) -> [StoreHealth; 2] {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let started = Instant::now();
        let source = self.source.count_by_time_range(now, now).await.map(|_| started.elapsed());
        let started = Instant::now();
        let target = self.target.count_between(now_ms, now_ms).await.map(|_| started.elapsed());

        [
            store_health(R::CLASS, StoreSide::Source, source.map_err(|e| e.to_string())),
            store_health(R::CLASS, StoreSide::Target, target.map_err(|e| e.to_string())),
        ]
    }
}

fn store_health(class: RecordClass, side: StoreSide, probe: Result<Duration, String>) -> StoreHealth {
    metrics::set_store_healthy(side.as_str(), probe.is_ok());
    match probe {
        Ok(latency) => StoreHealth {
            class,
            side,
            reachable: true,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(error) => {
            warn!(class = %class, store = %side, error = %error, "Store probe failed");
            StoreHealth {
                class,
                side,
                reachable: false,
                latency_ms: None,
                error: Some(error),
            }
        }
    }
}

/// Online migration engine for logs and payments.
pub struct MigrationEngine {
    config: MigrationConfig,
    phase: Arc<PhaseController>,
    state: Arc<dyn StateStore>,
    logs: ClassPipeline<LogRecord>,
    payments: ClassPipeline<PaymentRecord>,
    service_names: TimedCache<Vec<String>>,
    run_handles: DashMap<RunId, JoinHandle<Result<RunResult, MigrationError>>>,
}

impl MigrationEngine {
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    #[must_use]
    pub fn phase_controller(&self) -> &Arc<PhaseController> {
        &self.phase
    }

    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        self.phase.phase()
    }

    #[must_use]
    pub fn routing_policy(&self) -> RoutingPolicy {
        self.phase.routing_policy()
    }

    /// Log pipeline: route log writes and reads through `engine.logs().router`.
    #[must_use]
    pub fn logs(&self) -> &ClassPipeline<LogRecord> {
        &self.logs
    }

    #[must_use]
    pub fn payments(&self) -> &ClassPipeline<PaymentRecord> {
        &self.payments
    }

    /// Distinct service names in the log source, cached for
    /// `lookup_cache_ttl_secs`.
    pub async fn service_names(&self) -> Result<Vec<String>, MigrationError> {
        let source = Arc::clone(&self.logs.source);
        self.service_names
            .get_or_load("service_names", || async move {
                source.distinct_scopes().await.map_err(MigrationError::from)
            })
            .await
    }

    /// Current phase, policy, last validation per class and backfill runs.
    pub async fn status(&self) -> Result<StatusReport, MigrationError> {
        let snapshot = self.phase.snapshot();

        let mut last_validation = BTreeMap::new();
        if let Some(report) = self.logs.validator.last_report() {
            last_validation.insert(RecordClass::Logs, report);
        }
        if let Some(report) = self.payments.validator.last_report() {
            last_validation.insert(RecordClass::Payments, report);
        }

        let mut latest_runs = BTreeMap::new();
        for class in RecordClass::ALL {
            if let Some(latest) = self.state.list_checkpoints(class).await?.into_iter().next() {
                latest_runs.insert(class, latest);
            }
        }

        let mut active_runs = self.logs.backfill.active_runs();
        active_runs.extend(self.payments.backfill.active_runs());
        active_runs.sort();

        Ok(StatusReport {
            phase: snapshot.phase,
            phase_version: snapshot.version,
            policy: snapshot.policy(),
            overrides: snapshot.overrides,
            last_validation,
            active_runs,
            latest_runs,
        })
    }

    /// Probe every store concurrently.
    pub async fn health(&self) -> HealthReport {
        let (logs, payments) = tokio::join!(self.logs.probe(), self.payments.probe());
        let stores: Vec<StoreHealth> = logs.into_iter().chain(payments).collect();
        let status = if stores.iter().all(|s| s.reachable) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        HealthReport {
            status,
            phase: self.phase.phase(),
            stores,
        }
    }
}
