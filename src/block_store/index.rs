// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-memory index over [`BlockMeta`], mirrored to `index.json` under the local root.

use crate::block_key::{BlockKey, BlockMeta, Tier};
use crate::block_store::lru::LruSet;
use crate::error::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::Path;

/// Mapping from [`BlockKey`] to [`BlockMeta`], plus per-tier usage counters
/// and the LRU-by-accessed_at ordering of the local tier.
#[derive(Default)]
pub struct Index {
    entries: FxHashMap<BlockKey, BlockMeta>,
    local_used: u64,
    remote_used: u64,
    local_lru: LruSet,
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a persisted index, or returns an empty one if the file doesn't
    /// exist. A parse failure is reported (caller decides: treat as empty and
    /// log, per §7 `CorruptIndex` policy) rather than silently swallowed here.
    pub fn load(path: &Path) -> std::result::Result<Self, serde_json::Error> {
        let Ok(raw) = std::fs::read(path) else {
            return Ok(Self::new());
        };
        let on_disk: BTreeMap<String, BlockMeta> = serde_json::from_slice(&raw)?;
        let mut index = Self::new();
        for meta in on_disk.into_values() {
            index.insert(meta);
        }
        Ok(index)
    }

    /// Serializes the index to `index.json` under `local_root`, keyed by the
    /// block's `key_string` as §6 specifies.
    pub fn persist(&self, local_root: &Path) -> Result<()> {
        let mut on_disk = BTreeMap::new();
        for meta in self.entries.values() {
            on_disk.insert(meta.key.to_key_string(), meta.clone());
        }
        let json = serde_json::to_vec_pretty(&on_disk).expect("serializing BlockMeta cannot fail");
        std::fs::create_dir_all(local_root)?;
        let tmp = local_root.join("index.json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, local_root.join("index.json"))?;
        Ok(())
    }

    fn add_usage(&mut self, tier: Tier, bytes: u64) {
        match tier {
            Tier::Local => self.local_used += bytes,
            Tier::Remote => self.remote_used += bytes,
        }
    }

    fn sub_usage(&mut self, tier: Tier, bytes: u64) {
        match tier {
            Tier::Local => self.local_used = self.local_used.saturating_sub(bytes),
            Tier::Remote => self.remote_used = self.remote_used.saturating_sub(bytes),
        }
    }

    /// Inserts or replaces a block's metadata, updating usage counters and
    /// (if local) LRU tracking.
    pub fn insert(&mut self, meta: BlockMeta) {
        if let Some(old) = self.entries.remove(&meta.key) {
            self.sub_usage(old.tier, old.size_bytes);
            self.local_lru.remove(&old.key);
        }
        self.add_usage(meta.tier, meta.size_bytes);
        if meta.tier == Tier::Local {
            self.local_lru.touch(meta.key, meta.accessed_at, meta.stored_at);
        }
        self.entries.insert(meta.key, meta);
    }

    /// Removes a block from the index, returning its metadata if present.
    pub fn remove(&mut self, key: &BlockKey) -> Option<BlockMeta> {
        let meta = self.entries.remove(key)?;
        self.sub_usage(meta.tier, meta.size_bytes);
        self.local_lru.remove(&meta.key);
        Some(meta)
    }

    #[must_use]
    pub fn get(&self, key: &BlockKey) -> Option<&BlockMeta> {
        self.entries.get(key)
    }

    /// Marks a block's `accessed_at`, refreshing LRU order if it is local.
    pub fn touch_accessed(&mut self, key: &BlockKey, accessed_at: u64) {
        if let Some(meta) = self.entries.get_mut(key) {
            meta.accessed_at = accessed_at;
            if meta.tier == Tier::Local {
                self.local_lru.touch(meta.key, accessed_at, meta.stored_at);
            }
        }
    }

    #[must_use]
    pub fn contains(&self, key: &BlockKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn local_used(&self) -> u64 {
        self.local_used
    }

    #[must_use]
    pub fn remote_used(&self) -> u64 {
        self.remote_used
    }

    /// The coldest local-tier block, if any.
    #[must_use]
    pub fn oldest_local(&self) -> Option<BlockKey> {
        self.local_lru.peek_oldest()
    }

    /// Every block belonging to `seq`.
    pub fn keys_for_seq(&self, seq: u64) -> Vec<BlockKey> {
        self.entries
            .keys()
            .filter(|k| k.seq == seq)
            .copied()
            .collect()
    }

    /// Blocks for `(seq, layer, is_key)` overlapping `[begin, end)`, sorted by
    /// `begin_pos` ascending.
    pub fn range(&self, seq: u64, layer: u32, is_key: bool, begin: u64, end: u64) -> Vec<BlockMeta> {
        let mut matches: Vec<BlockMeta> = self
            .entries
            .values()
            .filter(|m| {
                m.key.seq == seq
                    && m.key.layer == layer
                    && m.key.is_key == is_key
                    && m.key.overlaps(begin, end)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|m| m.key.begin_pos);
        matches
    }

    /// Every block currently tracked, regardless of tier.
    pub fn iter_metas(&self) -> impl Iterator<Item = &BlockMeta> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn recompute_usage(&self) -> (u64, u64) {
        let mut local = 0u64;
        let mut remote = 0u64;
        for meta in self.entries.values() {
            match meta.tier {
                Tier::Local => local += meta.size_bytes,
                Tier::Remote => remote += meta.size_bytes,
            }
        }
        (local, remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(seq: u64, tier: Tier, size: u64) -> BlockMeta {
        BlockMeta {
            key: BlockKey::row(seq, 0, 0, true),
            dtype: "f16".into(),
            shape: vec![1],
            size_bytes: size,
            compressed: false,
            tier,
            stored_at: 0,
            accessed_at: 0,
        }
    }

    #[test]
    fn usage_counters_track_inserts_and_removes() {
        let mut index = Index::new();
        index.insert(meta(1, Tier::Local, 100));
        index.insert(meta(2, Tier::Remote, 50));
        assert_eq!(index.local_used(), 100);
        assert_eq!(index.remote_used(), 50);
        assert_eq!(index.recompute_usage(), (100, 50));

        index.remove(&BlockKey::row(1, 0, 0, true));
        assert_eq!(index.local_used(), 0);
        assert_eq!(index.recompute_usage(), (0, 50));
    }

    #[test]
    fn reinsert_replaces_and_rebalances_usage() {
        let mut index = Index::new();
        index.insert(meta(1, Tier::Local, 100));
        index.insert(meta(1, Tier::Remote, 100));
        assert_eq!(index.local_used(), 0);
        assert_eq!(index.remote_used(), 100);
    }
}
