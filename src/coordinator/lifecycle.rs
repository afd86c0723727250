// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine construction: connect to the real stores or assemble from
//! supplied ones.
//!
//! Startup flow for [`MigrationEngine::connect`]:
//! 1. Validate configuration
//! 2. Connect to SQL (system of record) and create class/state tables
//! 3. Connect to Redis once; both class namespaces share the connection
//! 4. Restore the persisted phase (or seed it from configuration)

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::backfill::{BackfillMigrator, BackfillSettings};
use crate::codec::RecordCodec;
use crate::config::MigrationConfig;
use crate::error::MigrationError;
use crate::lookup_cache::TimedCache;
use crate::phase::PhaseController;
use crate::record::{LogRecord, MigrationRecord, PaymentRecord, RecordClass};
use crate::router::HybridRouter;
use crate::storage::memory::{MemorySourceStore, MemoryTargetStore};
use crate::storage::redis::RedisTargetStore;
use crate::storage::sql::{SqlConnection, SqlSourceStore};
use crate::storage::state::{MemoryStateStore, SqlStateStore, StateStore};
use crate::storage::traits::{SourceStore, TargetStore};
use crate::validator::ConsistencyValidator;

use super::{ClassPipeline, MigrationEngine};

/// Store handles the engine runs over.
pub struct EngineStores {
    pub state: Arc<dyn StateStore>,
    pub log_source: Arc<dyn SourceStore<LogRecord>>,
    pub log_target: Arc<dyn TargetStore>,
    pub payment_source: Arc<dyn SourceStore<PaymentRecord>>,
    pub payment_target: Arc<dyn TargetStore>,
}

impl EngineStores {
    /// Fresh in-process stores.
    #[must_use]
    pub fn in_memory(config: &MigrationConfig) -> Self {
        Self {
            state: Arc::new(MemoryStateStore::new()),
            log_source: Arc::new(MemorySourceStore::<LogRecord>::new()),
            log_target: Arc::new(MemoryTargetStore::new().with_max_batch(config.target_max_batch_size)),
            payment_source: Arc::new(MemorySourceStore::<PaymentRecord>::new()),
            payment_target: Arc::new(MemoryTargetStore::new().with_max_batch(config.target_max_batch_size)),
        }
    }
}

fn pipeline<R: MigrationRecord>(
    config: &MigrationConfig,
    phase: &Arc<PhaseController>,
    state: &Arc<dyn StateStore>,
    source: Arc<dyn SourceStore<R>>,
    target: Arc<dyn TargetStore>,
) -> ClassPipeline<R> {
    let codec = RecordCodec::from_config(config);
    let retry = config.store_retry();
    ClassPipeline {
        router: Arc::new(HybridRouter::new(
            Arc::clone(phase),
            Arc::clone(&source),
            Arc::clone(&target),
            codec.clone(),
            retry.clone(),
        )),
        validator: Arc::new(ConsistencyValidator::new(
            Arc::clone(&source),
            Arc::clone(&target),
            codec.clone(),
            config.consistency_tolerance,
            retry,
        )),
        backfill: Arc::new(BackfillMigrator::new(
            Arc::clone(&source),
            Arc::clone(&target),
            Arc::clone(state),
            codec,
            BackfillSettings::from_config(config),
        )),
        source,
        target,
    }
}

impl MigrationEngine {
    /// Connect to the SQL and Redis stores named in `config`.
    #[tracing::instrument(skip(config), fields(has_prefix = config.key_prefix.is_some()))]
    pub async fn connect(config: MigrationConfig) -> Result<Self, MigrationError> {
        config.validate()?;
        let sql_url = config
            .sql_url
            .clone()
            .ok_or_else(|| MigrationError::InvalidOptions("sql_url is required".into()))?;
        let redis_url = config
            .redis_url
            .clone()
            .ok_or_else(|| MigrationError::InvalidOptions("redis_url is required".into()))?;

        let sql = SqlConnection::connect(&sql_url).await?;
        let sqlite = sql.is_sqlite();
        let state: Arc<dyn StateStore> = Arc::new(SqlStateStore::new(sql.clone()).await?);
        let log_source = Arc::new(SqlSourceStore::<LogRecord>::new(sql.clone()).await?);
        let payment_source = Arc::new(SqlSourceStore::<PaymentRecord>::new(sql).await?);
        info!(sqlite, "Connected to relational store");

        let prefix = config.key_prefix.as_deref();
        let log_target = RedisTargetStore::connect(&redis_url, prefix, RecordClass::Logs)
            .await?
            .with_max_batch(config.target_max_batch_size);
        let payment_target = RedisTargetStore::with_connection(log_target.connection(), prefix, RecordClass::Payments)
            .with_max_batch(config.target_max_batch_size);
        info!(namespace = %log_target.namespace(), "Connected to key-value store");

        let stores = EngineStores {
            state,
            log_source,
            log_target: Arc::new(log_target),
            payment_source,
            payment_target: Arc::new(payment_target),
        };
        Self::with_stores(config, stores).await
    }

    /// Assemble the engine over caller-supplied stores.
    pub async fn with_stores(config: MigrationConfig, stores: EngineStores) -> Result<Self, MigrationError> {
        config.validate()?;
        let phase = Arc::new(
            PhaseController::load(Arc::clone(&stores.state), config.initial_phase, config.overrides()).await?,
        );

        let logs = pipeline(&config, &phase, &stores.state, stores.log_source, stores.log_target);
        let payments = pipeline(&config, &phase, &stores.state, stores.payment_source, stores.payment_target);

        info!(
            phase = %phase.phase(),
            continue_on_write_failure = config.continue_on_write_failure,
            require_both_writes = config.require_both_writes,
            "Migration engine ready"
        );

        Ok(Self {
            service_names: TimedCache::new(Duration::from_secs(config.lookup_cache_ttl_secs)),
            config,
            phase,
            state: stores.state,
            logs,
            payments,
            run_handles: DashMap::new(),
        })
    }

    /// Engine over fresh in-process stores.
    pub async fn in_memory(config: MigrationConfig) -> Result<Self, MigrationError> {
        let stores = EngineStores::in_memory(&config);
        Self::with_stores(config, stores).await
    }
}
