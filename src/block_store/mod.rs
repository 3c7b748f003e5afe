// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Persistent two-tier (local/remote) block-addressed byte store.
//!
//! See SPEC_FULL.md §4.1. Grounded on the teacher crate's segment/block-cache
//! split: a durable index (here: JSON, there: a manifest) gates access to
//! immutable on-disk blocks, and a budget discipline decides what stays hot.

mod compression;
mod index;
mod lru;
mod paths;

pub use index::Index;

use crate::block_key::{BlockKey, BlockMeta, Tier, now_epoch_secs};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use std::path::PathBuf;
use std::sync::RwLock;

/// Aggregate byte/count usage for one tier.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TierStats {
    pub block_count: u64,
    pub bytes_used: u64,
}

/// Snapshot returned by [`BlockStore::stats`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub local: TierStats,
    pub remote: TierStats,
}

/// Construction parameters for a [`BlockStore`].
#[derive(Clone, Debug)]
pub struct BlockStoreOptions {
    pub local_root: PathBuf,
    pub remote_root: Option<PathBuf>,
    pub local_budget_bytes: u64,
    pub remote_budget_bytes: u64,
    pub compress: bool,
}

/// The tiered, budget-disciplined, persistently-indexed byte store.
///
/// All public operations are serialized by a single [`RwLock`] around the
/// index: readers (`Get`/`Has`/`GetRange`/`Stats`) share it, writers (`Put`,
/// `RemoveSeq`) take it exclusively. `Get`'s `accessed_at` bump is the sole
/// read-that-becomes-a-write path, matching §4.1's documented upgrade.
pub struct BlockStore {
    options: BlockStoreOptions,
    index: RwLock<Index>,
    metrics: Metrics,
}

impl BlockStore {
    /// Opens (or creates) a block store at the given roots, rebuilding the
    /// index from `index.json` if present.
    pub fn open(options: BlockStoreOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.local_root)?;
        if let Some(remote) = &options.remote_root {
            std::fs::create_dir_all(remote)?;
        }

        let index_path = paths::index_file_path(&options.local_root);
        let index = match Index::load(&index_path) {
            Ok(index) => index,
            Err(e) => {
                log::warn!("block store index at {index_path:?} failed to parse ({e}), starting from an empty index");
                Index::new()
            }
        };

        Ok(Self {
            options,
            index: RwLock::new(index),
            metrics: Metrics::default(),
        })
    }

    fn root_for(&self, tier: Tier) -> Option<&std::path::Path> {
        match tier {
            Tier::Local => Some(&self.options.local_root),
            Tier::Remote => self.options.remote_root.as_deref(),
        }
    }

    /// Persists `data` under `key`, compressing first if configured, migrating
    /// cold local blocks to remote if the local budget would be exceeded.
    pub fn put(&self, key: BlockKey, dtype: &str, shape: Vec<u64>, data: &[u8]) -> Result<()> {
        let size_bytes = data.len() as u64;

        let (payload, compressed): (Vec<u8>, bool) = if self.options.compress {
            match compression::compress(data) {
                Some(c) => (c, true),
                None => (data.to_vec(), false),
            }
        } else {
            (data.to_vec(), false)
        };
        let on_disk_size = payload.len() as u64;

        let mut index = self.index.write().expect("index lock poisoned");

        while index.local_used() + on_disk_size > self.options.local_budget_bytes {
            if !self.migrate_oldest_local(&mut index)? {
                return Err(Error::BudgetExhausted {
                    tier: Tier::Local,
                    requested: on_disk_size,
                    available: self
                        .options
                        .local_budget_bytes
                        .saturating_sub(index.local_used()),
                });
            }
        }

        let path = paths::block_file_path(&self.options.local_root, &key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &payload)?;

        let now = now_epoch_secs();
        index.insert(BlockMeta {
            key,
            dtype: dtype.to_string(),
            shape,
            size_bytes,
            compressed,
            tier: Tier::Local,
            stored_at: now,
            accessed_at: now,
        });

        Ok(())
    }

    /// Moves the single coldest local block to the remote tier. Returns
    /// `false` if no remote is configured, remote has no room, or there is
    /// nothing local left to move.
    fn migrate_oldest_local(&self, index: &mut Index) -> Result<bool> {
        let Some(remote_root) = self.options.remote_root.clone() else {
            return Ok(false);
        };
        let Some(key) = index.oldest_local() else {
            return Ok(false);
        };
        let meta = index.get(&key).expect("oldest_local returned a tracked key").clone();

        if index.remote_used() + meta.size_bytes > self.options.remote_budget_bytes {
            return Ok(false);
        }

        let local_path = paths::block_file_path(&self.options.local_root, &key);
        let remote_path = paths::block_file_path(&remote_root, &key);
        if let Some(parent) = remote_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::read(&local_path)?;
        // Write destination before removing source: an interruption between
        // these two lines leaves the index still pointing at local, and the
        // orphaned remote copy is simply overwritten by the next migration
        // attempt (§5 "Cancellation").
        std::fs::write(&remote_path, &bytes)?;
        std::fs::remove_file(&local_path)?;

        let mut migrated = meta;
        migrated.tier = Tier::Remote;
        index.insert(migrated);

        log::debug!("migrated block {} from local to remote", key.to_key_string());
        self.metrics.record_migration(bytes.len() as u64);

        Ok(true)
    }

    /// Reads a block's bytes back, decompressing if necessary, and bumps
    /// `accessed_at`.
    pub fn get(&self, key: &BlockKey) -> Result<(Vec<u8>, BlockMeta)> {
        let meta = {
            let index = self.index.read().expect("index lock poisoned");
            index.get(key).cloned().ok_or(Error::NotFound)?
        };

        let root = self.root_for(meta.tier).ok_or(Error::NotFound)?;
        let path = paths::block_file_path(root, key);
        let raw = std::fs::read(&path)?;

        let bytes = if meta.compressed {
            compression::decompress(&raw)?
        } else {
            raw
        };

        match meta.tier {
            Tier::Local => self.metrics.record_hit_local(),
            Tier::Remote => self.metrics.record_hit_remote(),
        }

        let mut index = self.index.write().expect("index lock poisoned");
        index.touch_accessed(key, now_epoch_secs());

        Ok((bytes, meta))
    }

    #[must_use]
    pub fn has(&self, key: &BlockKey) -> bool {
        self.index.read().expect("index lock poisoned").contains(key)
    }

    /// Overlapping blocks for `(seq, layer, is_key)` in `[begin, end)`, sorted
    /// by `begin_pos` ascending.
    #[must_use]
    pub fn get_range(&self, seq: u64, layer: u32, is_key: bool, begin: u64, end: u64) -> Vec<BlockMeta> {
        self.index
            .read()
            .expect("index lock poisoned")
            .range(seq, layer, is_key, begin, end)
    }

    /// Deletes every block belonging to `seq` from both tiers. Returns the
    /// number of blocks removed.
    pub fn remove_seq(&self, seq: u64) -> Result<usize> {
        let mut index = self.index.write().expect("index lock poisoned");
        let keys = index.keys_for_seq(seq);

        for key in &keys {
            let meta = index.remove(key).expect("key came from this index");
            if let Some(root) = self.root_for(meta.tier) {
                let path = paths::block_file_path(root, key);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(keys.len())
    }

    /// Removes a single block, ignoring `NotFound` (callers, e.g. the page
    /// manager's `RemoveRange`, may ask to delete a block that was never
    /// spilled to disk in the first place).
    pub fn remove_block(&self, key: &BlockKey) -> Result<()> {
        let mut index = self.index.write().expect("index lock poisoned");
        let Some(meta) = index.remove(key) else {
            return Ok(());
        };
        if let Some(root) = self.root_for(meta.tier) {
            let path = paths::block_file_path(root, key);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> BlockStoreStats {
        let index = self.index.read().expect("index lock poisoned");
        let mut local = TierStats::default();
        let mut remote = TierStats::default();
        local.bytes_used = index.local_used();
        remote.bytes_used = index.remote_used();
        // Re-derive counts from the index rather than tracking separately, so
        // `Stats` can never drift from the source of truth.
        for meta in index.iter_metas() {
            match meta.tier {
                Tier::Local => local.block_count += 1,
                Tier::Remote => remote.block_count += 1,
            }
        }
        BlockStoreStats { local, remote }
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Persists the index to disk.
    pub fn close(&self) -> Result<()> {
        let index = self.index.read().expect("index lock poisoned");
        index.persist(&self.options.local_root)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to persist block store index on drop: {e}");
        }
    }
}
