// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration phase controller.
//!
//! Holds the current [`MigrationPhase`] plus operator overrides as one
//! immutable, versioned [`PhaseState`] behind an [`ArcSwap`]. The router
//! reads it on every record operation, so reads are lock-free; changes are
//! serialized by an async mutex, persisted first and only then published.
//!
//! ```text
//! SourceOnly ──► DualWrite ──► DualWriteReadTarget ──► TargetOnly
//!      ◄──────────── rollback (explicit, operator-invoked) ───────────
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::MigrationError;
use crate::metrics;
use crate::storage::state::StateStore;

/// Operator recorded when state is seeded from configuration.
pub const CONFIG_OPERATOR: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    SourceOnly,
    DualWrite,
    DualWriteReadTarget,
    TargetOnly,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 4] = [
        MigrationPhase::SourceOnly,
        MigrationPhase::DualWrite,
        MigrationPhase::DualWriteReadTarget,
        MigrationPhase::TargetOnly,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceOnly => "source_only",
            Self::DualWrite => "dual_write",
            Self::DualWriteReadTarget => "dual_write_read_target",
            Self::TargetOnly => "target_only",
        }
    }

    #[must_use]
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    /// The only phase a forward transition into `self` may start from.
    #[must_use]
    pub fn predecessor(&self) -> Option<MigrationPhase> {
        match self {
            Self::SourceOnly => None,
            Self::DualWrite => Some(Self::SourceOnly),
            Self::DualWriteReadTarget => Some(Self::DualWrite),
            Self::TargetOnly => Some(Self::DualWriteReadTarget),
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durability vs. availability knobs, independent of phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOverrides {
    pub continue_on_write_failure: bool,
    pub require_both_writes: bool,
}

impl Default for PhaseOverrides {
    fn default() -> Self {
        Self {
            continue_on_write_failure: true,
            require_both_writes: false,
        }
    }
}

/// Which stores a record operation touches. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingPolicy {
    pub writes_to_source: bool,
    pub writes_to_target: bool,
    pub reads_from_target: bool,
    /// Only meaningful while writing to both stores.
    pub require_both_writes: bool,
    pub continue_on_write_failure: bool,
}

impl RoutingPolicy {
    #[must_use]
    pub fn derive(phase: MigrationPhase, overrides: PhaseOverrides) -> Self {
        let (writes_to_source, writes_to_target, reads_from_target) = match phase {
            MigrationPhase::SourceOnly => (true, false, false),
            MigrationPhase::DualWrite => (true, true, false),
            MigrationPhase::DualWriteReadTarget => (true, true, true),
            MigrationPhase::TargetOnly => (false, true, true),
        };
        Self {
            writes_to_source,
            writes_to_target,
            reads_from_target,
            require_both_writes: writes_to_source && writes_to_target && overrides.require_both_writes,
            continue_on_write_failure: overrides.continue_on_write_failure,
        }
    }

    #[must_use]
    pub fn is_dual_write(&self) -> bool {
        self.writes_to_source && self.writes_to_target
    }
}

/// Immutable, versioned phase snapshot. This is what gets persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: MigrationPhase,
    pub overrides: PhaseOverrides,
    /// Bumped on every change, starting at 0.
    pub version: u64,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
}

impl PhaseState {
    #[must_use]
    pub fn initial(phase: MigrationPhase, overrides: PhaseOverrides) -> Self {
        Self {
            phase,
            overrides,
            version: 0,
            changed_at: Utc::now(),
            changed_by: CONFIG_OPERATOR.to_string(),
        }
    }

    /// Successor state with the next version.
    #[must_use]
    pub fn advance(&self, phase: MigrationPhase, overrides: PhaseOverrides, operator: &str) -> Self {
        Self {
            phase,
            overrides,
            version: self.version + 1,
            changed_at: Utc::now(),
            changed_by: operator.to_string(),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RoutingPolicy {
        RoutingPolicy::derive(self.phase, self.overrides)
    }
}

/// Audit entry for one phase or override change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseTransition {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub version: u64,
    pub at: DateTime<Utc>,
    pub operator: String,
}

pub struct PhaseController {
    current: ArcSwap<PhaseState>,
    store: Arc<dyn StateStore>,
    write_lock: Mutex<()>,
    history: RwLock<Vec<PhaseTransition>>,
}

impl PhaseController {
    /// Restore the persisted phase, or seed and persist the given defaults.
    pub async fn load(
        store: Arc<dyn StateStore>,
        initial_phase: MigrationPhase,
        overrides: PhaseOverrides,
    ) -> Result<Self, MigrationError> {
        let state = match store.load_phase().await? {
            Some(state) => {
                info!(phase = %state.phase, version = state.version, "Restored migration phase");
                state
            }
            None => {
                let state = PhaseState::initial(initial_phase, overrides);
                store.save_phase(&state).await?;
                info!(phase = %state.phase, "Seeded migration phase from configuration");
                state
            }
        };
        metrics::set_phase(state.phase.ordinal());

        Ok(Self {
            current: ArcSwap::from_pointee(state),
            store,
            write_lock: Mutex::new(()),
            history: RwLock::new(Vec::new()),
        })
    }

    /// Current snapshot. Holders keep a consistent view until they drop it.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PhaseState> {
        self.current.load_full()
    }

    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        self.current.load().phase
    }

    #[must_use]
    pub fn routing_policy(&self) -> RoutingPolicy {
        self.current.load().policy()
    }

    pub async fn advance_to_dual_write(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.advance(MigrationPhase::DualWrite, operator).await
    }

    pub async fn advance_to_read_from_target(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.advance(MigrationPhase::DualWriteReadTarget, operator).await
    }

    pub async fn advance_to_target_only(&self, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        self.advance(MigrationPhase::TargetOnly, operator).await
    }

    async fn advance(&self, to: MigrationPhase, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        let _guard = self.write_lock.lock().await;
        let current = self.current.load_full();

        if to.predecessor() != Some(current.phase) {
            warn!(from = %current.phase, to = %to, operator, "Rejected phase transition");
            return Err(MigrationError::InvalidPhaseTransition { from: current.phase, to });
        }

        self.publish(&current, to, current.overrides, operator).await
    }

    /// Move back to an earlier phase. Never happens implicitly.
    pub async fn rollback(&self, to: MigrationPhase, operator: &str) -> Result<Arc<PhaseState>, MigrationError> {
        let _guard = self.write_lock.lock().await;
        let current = self.current.load_full();

        if to >= current.phase {
            warn!(from = %current.phase, to = %to, operator, "Rejected rollback");
            return Err(MigrationError::InvalidPhaseTransition { from: current.phase, to });
        }

        warn!(from = %current.phase, to = %to, operator, "Rolling back migration phase");
        self.publish(&current, to, current.overrides, operator).await
    }

    /// Change override flags without moving the phase.
    pub async fn set_overrides(
        &self,
        overrides: PhaseOverrides,
        operator: &str,
    ) -> Result<Arc<PhaseState>, MigrationError> {
        let _guard = self.write_lock.lock().await;
        let current = self.current.load_full();
        if current.overrides == overrides {
            return Ok(current);
        }
        self.publish(&current, current.phase, overrides, operator).await
    }

    /// Audit trail of changes made through this controller, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<PhaseTransition> {
        self.history.read().clone()
    }

    // Caller holds write_lock.
    async fn publish(
        &self,
        current: &PhaseState,
        phase: MigrationPhase,
        overrides: PhaseOverrides,
        operator: &str,
    ) -> Result<Arc<PhaseState>, MigrationError> {
        let next = Arc::new(current.advance(phase, overrides, operator));

        // Persist before publishing; a failed save leaves the old state in place
        self.store.save_phase(&next).await?;
        self.current.store(Arc::clone(&next));

        self.history.write().push(PhaseTransition {
            from: current.phase,
            to: phase,
            version: next.version,
            at: next.changed_at,
            operator: operator.to_string(),
        });
        metrics::set_phase(phase.ordinal());
        if phase != current.phase {
            metrics::record_phase_change(current.phase.as_str(), phase.as_str());
        }

        info!(
            from = %current.phase,
            to = %phase,
            version = next.version,
            operator,
            continue_on_write_failure = overrides.continue_on_write_failure,
            require_both_writes = overrides.require_both_writes,
            "Migration phase updated"
        );
        Ok(next)
    }
}
