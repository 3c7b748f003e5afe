// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Lightweight atomic counters, in the spirit of the teacher crate's own
//! block-cache `Metrics` (hit/miss counts with ratio accessors, no external
//! metrics framework pulled into the core).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Block-store and page-manager observability counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Blocks served from the local tier.
    local_hits: AtomicU64,
    /// Blocks served from the remote tier.
    remote_hits: AtomicU64,
    /// Blocks migrated from local to remote.
    migrations: AtomicU64,
    /// Bytes migrated from local to remote.
    migrated_bytes: AtomicU64,
    /// Positions paged in to a [`crate::page_manager`] arena from the block store.
    page_ins: AtomicU64,
    /// Positions evicted from a [`crate::page_manager`] arena to make room.
    page_outs: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_hit_local(&self) {
        self.local_hits.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_hit_remote(&self) {
        self.remote_hits.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_migration(&self, bytes: u64) {
        self.migrations.fetch_add(1, Relaxed);
        self.migrated_bytes.fetch_add(bytes, Relaxed);
    }

    pub(crate) fn record_page_in(&self) {
        self.page_ins.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_page_out(&self) {
        self.page_outs.fetch_add(1, Relaxed);
    }

    #[must_use]
    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Relaxed)
    }

    #[must_use]
    pub fn remote_hits(&self) -> u64 {
        self.remote_hits.load(Relaxed)
    }

    #[must_use]
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Relaxed)
    }

    #[must_use]
    pub fn migrated_bytes(&self) -> u64 {
        self.migrated_bytes.load(Relaxed)
    }

    #[must_use]
    pub fn page_ins(&self) -> u64 {
        self.page_ins.load(Relaxed)
    }

    #[must_use]
    pub fn page_outs(&self) -> u64 {
        self.page_outs.load(Relaxed)
    }

    /// Fraction of Get calls served from the local (vs. remote) tier.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn local_hit_ratio(&self) -> f64 {
        let local = self.local_hits() as f64;
        let total = local + self.remote_hits() as f64;
        if total == 0.0 {
            0.0
        } else {
            local / total
        }
    }
}
