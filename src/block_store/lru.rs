// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Strict-LRU-by-`accessed_at` ordering over local-tier block keys.
//!
//! Grounded on the teacher crate's `descriptor_table/lru.rs` `LruList`, generalized
//! from an opaque `VecDeque`-of-recency to an ordered set keyed explicitly by
//! `(accessed_at, stored_at, key)` so migration can always ask for the single
//! coldest block in `O(log n)` instead of re-scanning a deque.

use crate::block_key::BlockKey;
use std::collections::BTreeSet;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    accessed_at: u64,
    stored_at: u64,
    key: BlockKey,
}

/// Tracks local-tier recency order for eviction.
///
/// Tie-break on equal `accessed_at`: earlier `stored_at` first, then
/// lexicographic key -- both folded into the `Entry` ordering so the set's
/// natural order already matches the spec's eviction tie-break rule.
#[derive(Default)]
pub struct LruSet {
    entries: BTreeSet<Entry>,
}

impl LruSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a key's recency position.
    pub fn touch(&mut self, key: BlockKey, accessed_at: u64, stored_at: u64) {
        self.entries.retain(|e| e.key != key);
        self.entries.insert(Entry {
            accessed_at,
            stored_at,
            key,
        });
    }

    /// Removes a key from tracking (e.g. on migration or deletion).
    pub fn remove(&mut self, key: &BlockKey) {
        self.entries.retain(|e| &e.key != key);
    }

    /// Returns the least-recently-used key without removing it.
    #[must_use]
    pub fn peek_oldest(&self) -> Option<BlockKey> {
        self.entries.iter().next().map(|e| e.key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
