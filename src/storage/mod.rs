// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store clients.
//!
//! - [`traits`]: the [`SourceStore`](traits::SourceStore) and
//!   [`TargetStore`](traits::TargetStore) seams the engine is written against
//! - [`sql`]: relational system of record (SQLite / MySQL via sqlx)
//! - [`redis`]: distributed key-value store
//! - [`memory`]: in-process stand-ins for both
//! - [`state`]: durable phase, checkpoints and backfill locks

pub mod memory;
pub mod redis;
pub mod sql;
pub mod state;
pub mod traits;
