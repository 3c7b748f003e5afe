// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-sequence, per-layer pinned K/V arenas backed by the [`crate::block_store`].
//!
//! See SPEC_FULL.md §4.2. One [`PageManager`] owns every layer's arena for a
//! single sequence; positions spilled under host memory pressure are handed
//! to the block store keyed by `(seq, layer, position, K-or-V)` and paged
//! back in transparently on the next `get_range` that needs them.

mod arena;
mod lru_list;

pub use arena::{PinnedRange, SlotState};

use crate::block_key::{BlockKey, LayerIdx, Position, SeqId};
use crate::block_store::BlockStore;
use crate::error::{Error, Result};
use arena::LayerArena;
use std::sync::Arc;

/// Construction parameters for a [`PageManager`].
#[derive(Clone, Debug)]
pub struct PageManagerOptions {
    pub seq: SeqId,
    pub num_layers: u32,
    pub kv_heads: u32,
    pub head_dim: u32,
    pub elem_bytes: u32,
    /// Per-layer ceiling on host-resident bytes (summed across K and V).
    ///
    /// §6 documents `host_budget_bytes` as a single session-wide figure, but
    /// the invariants in §4.2 are all stated per layer, and there is no
    /// spec-defined policy for splitting one global number across an unknown
    /// layer count, so this crate applies it per layer.
    pub host_budget_bytes: u64,
}

/// Per-layer host/disk position counts and byte usage.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerStats {
    pub host_positions: u64,
    pub disk_positions: u64,
    pub host_bytes: u64,
}

/// Snapshot returned by [`PageManager::stats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageManagerStats {
    pub per_layer: Vec<LayerStats>,
}

impl PageManagerStats {
    #[must_use]
    pub fn total_host_positions(&self) -> u64 {
        self.per_layer.iter().map(|l| l.host_positions).sum()
    }

    #[must_use]
    pub fn total_disk_positions(&self) -> u64 {
        self.per_layer.iter().map(|l| l.disk_positions).sum()
    }
}

/// Owns one sequence's pinned K/V arenas, one per transformer layer.
///
/// §4.2 specifies "a single mutex serializes all operations on the manager";
/// since `get_range` hands back a borrow into the arena that must outlive
/// the call, that mutex is the caller's responsibility (wrap a `PageManager`
/// in a `Mutex` alongside the runtime's generate loop) rather than an
/// internal lock here — an internal lock could not let a borrow escape the
/// locked section without `unsafe`.
pub struct PageManager {
    seq: SeqId,
    block_store: Arc<BlockStore>,
    row_stride: usize,
    host_budget_bytes: u64,
    dtype: String,
    shape: Vec<u64>,
    layers: Vec<LayerArena>,
}

impl PageManager {
    #[must_use]
    pub fn new(options: PageManagerOptions, block_store: Arc<BlockStore>) -> Self {
        let row_stride = options.kv_heads as usize * options.head_dim as usize * options.elem_bytes as usize;
        let layers = (0..options.num_layers).map(|_| LayerArena::new(row_stride)).collect();
        Self {
            seq: options.seq,
            block_store,
            row_stride,
            host_budget_bytes: options.host_budget_bytes,
            dtype: format!("f{}", options.elem_bytes * 8),
            shape: vec![u64::from(options.kv_heads), u64::from(options.head_dim)],
            layers,
        }
    }

    #[must_use]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    fn spill(block_store: &BlockStore, seq: SeqId, dtype: &str, shape: &[u64], layer: LayerIdx, pos: Position, k: &[u8], v: &[u8]) -> Result<()> {
        block_store.put(BlockKey::row(seq, layer, pos, true), dtype, shape.to_vec(), k)?;
        block_store.put(BlockKey::row(seq, layer, pos, false), dtype, shape.to_vec(), v)?;
        block_store.metrics().record_page_out();
        Ok(())
    }

    fn layer_mut(&mut self, layer: LayerIdx) -> Result<&mut LayerArena> {
        self.layers.get_mut(layer as usize).ok_or(Error::NotFound)
    }

    /// Loads `pos` back from the block store into `layer`'s arena if it is
    /// currently disk-resident. No-op if already host-resident or empty.
    /// `protect` excludes other positions (e.g. the rest of an in-flight
    /// `get_range` batch) from being chosen as the row evicted to make room.
    fn page_in(&mut self, layer: LayerIdx, pos: Position, protect: impl Fn(u64) -> bool) -> Result<()> {
        if self.layer_mut(layer)?.state_at(pos) != SlotState::Disk {
            return Ok(());
        }
        let (k, _) = self.block_store.get(&BlockKey::row(self.seq, layer, pos, true))?;
        let (v, _) = self.block_store.get(&BlockKey::row(self.seq, layer, pos, false))?;

        let seq = self.seq;
        let dtype = self.dtype.clone();
        let shape = self.shape.clone();
        let budget = self.host_budget_bytes;
        let block_store = self.block_store.clone();

        let arena = self.layer_mut(layer)?;
        arena.place_host(pos, &k, &v, budget, protect, |p, k, v| Self::spill(&block_store, seq, &dtype, &shape, layer, p, k, v))?;
        self.block_store.metrics().record_page_in();
        Ok(())
    }

    /// Appends a new row at the next free position in `layer`, returning the
    /// assigned position.
    pub fn append(&mut self, layer: LayerIdx, k_row: &[u8], v_row: &[u8]) -> Result<Position> {
        let pos = self.layer_mut(layer)?.count();
        self.store(layer, pos, k_row, v_row)?;
        Ok(pos)
    }

    /// Writes `k_row`/`v_row` at an explicit position, extending `count` if
    /// `pos` is beyond the current tail.
    pub fn store(&mut self, layer: LayerIdx, pos: Position, k_row: &[u8], v_row: &[u8]) -> Result<()> {
        let seq = self.seq;
        let dtype = self.dtype.clone();
        let shape = self.shape.clone();
        let budget = self.host_budget_bytes;
        let block_store = self.block_store.clone();

        let arena = self.layer_mut(layer)?;
        arena.place_host(pos, k_row, v_row, budget, |_| false, |p, k, v| Self::spill(&block_store, seq, &dtype, &shape, layer, p, k, v))?;
        Ok(())
    }

    /// Borrows a contiguous `[start, start+count)` range from `layer`,
    /// paging in any disk-resident positions first. The borrow is valid
    /// until the next call to `get_range` (enforced by the borrow checker:
    /// this takes `&mut self`, so no other `PageManager` method can run
    /// while the returned [`PinnedRange`] is alive).
    ///
    /// Every position in the range is protected from eviction while the
    /// rest of the range pages in, so a position paged in earlier in this
    /// same call can never be spilled back to disk by a later position in
    /// the same range — the "every position in range is host-resident"
    /// contract on [`PinnedRange`] holds as long as `host_budget_bytes` is
    /// large enough to hold `count` rows at once; otherwise this fails with
    /// `HostBudgetExhausted` rather than silently returning a stale slot.
    pub fn get_range(&mut self, layer: LayerIdx, start: Position, count: u64) -> Result<PinnedRange<'_>> {
        let end = start + count;
        for pos in start..end {
            if self.layer_mut(layer)?.state_at(pos) == SlotState::Empty {
                return Err(Error::NotFound);
            }
            self.page_in(layer, pos, |p| p >= start && p < end)?;
        }
        Ok(self.layers.get(layer as usize).ok_or(Error::NotFound)?.pinned_range(start, count))
    }

    /// Marks `[start, start+count)` empty across every layer and deletes any
    /// spilled blocks through the block store.
    pub fn remove_range(&mut self, start: Position, count: u64) -> Result<()> {
        let num_layers = self.layers.len() as u32;
        for layer in 0..num_layers {
            for pos in start..start + count {
                self.block_store.remove_block(&BlockKey::row(self.seq, layer, pos, true))?;
                self.block_store.remove_block(&BlockKey::row(self.seq, layer, pos, false))?;
                self.layer_mut(layer)?.mark_empty(pos);
            }
            self.layer_mut(layer)?.shrink_tail();
        }
        Ok(())
    }

    /// Empties every layer and removes this sequence's blocks from the block
    /// store.
    pub fn clear(&mut self) -> Result<()> {
        for layer in &mut self.layers {
            layer.clear();
        }
        self.block_store.remove_seq(self.seq)?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> PageManagerStats {
        let per_layer = self
            .layers
            .iter()
            .map(|layer| {
                let mut stats = LayerStats { host_bytes: layer.host_resident_bytes(), ..Default::default() };
                for pos in 0..layer.count() {
                    match layer.state_at(pos) {
                        SlotState::Host => stats.host_positions += 1,
                        SlotState::Disk => stats.disk_positions += 1,
                        SlotState::Empty => {}
                    }
                }
                stats
            })
            .collect();
        PageManagerStats { per_layer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStoreOptions;

    fn manager(dir: &tempfile::TempDir, host_budget_bytes: u64) -> PageManager {
        let store = BlockStore::open(BlockStoreOptions {
            local_root: dir.path().join("local"),
            remote_root: Some(dir.path().join("remote")),
            local_budget_bytes: 10_000_000,
            remote_budget_bytes: 10_000_000,
            compress: false,
        })
        .unwrap();
        PageManager::new(
            PageManagerOptions {
                seq: 1,
                num_layers: 2,
                kv_heads: 2,
                head_dim: 4,
                elem_bytes: 2,
                host_budget_bytes,
            },
            Arc::new(store),
        )
    }

    fn row(stride: usize, fill: u8) -> Vec<u8> {
        vec![fill; stride]
    }

    #[test]
    fn append_assigns_sequential_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = manager(&dir, 1_000_000);
        let stride = pm.row_stride();
        let p0 = pm.append(0, &row(stride, 1), &row(stride, 2)).unwrap();
        let p1 = pm.append(0, &row(stride, 3), &row(stride, 4)).unwrap();
        assert_eq!(p0, 0);
        assert_eq!(p1, 1);
    }

    #[test]
    fn get_range_returns_contiguous_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = manager(&dir, 1_000_000);
        let stride = pm.row_stride();
        for i in 0..4u8 {
            pm.append(0, &row(stride, i), &row(stride, 100 + i)).unwrap();
        }
        let range = pm.get_range(0, 1, 2).unwrap();
        assert_eq!(range.k.len(), 2 * stride);
        assert_eq!(&range.k[..stride], &row(stride, 1)[..]);
        assert_eq!(&range.k[stride..], &row(stride, 2)[..]);
    }

    #[test]
    fn eviction_spills_to_block_store_and_pages_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let probe = manager(&dir, 1_000_000);
        let stride = probe.row_stride();
        let host_budget = 2 * (2 * stride) as u64; // room for exactly 2 positions
        let mut pm = PageManager::new(
            PageManagerOptions { seq: 1, num_layers: 1, kv_heads: 2, head_dim: 4, elem_bytes: 2, host_budget_bytes: host_budget },
            probe.block_store.clone(),
        );

        for i in 0..5u8 {
            pm.append(0, &row(stride, i), &row(stride, 100 + i)).unwrap();
        }
        let stats = pm.stats();
        assert!(stats.per_layer[0].disk_positions >= 1);

        let range = pm.get_range(0, 0, 1).unwrap();
        assert_eq!(&range.k[..], &row(stride, 0)[..]);
    }

    #[test]
    fn get_range_leaves_every_position_in_the_batch_host_resident() {
        // Budget for exactly two resident positions. After the appends,
        // positions 3 and 4 are host-resident and 0..=2 are disk-resident.
        // Requesting the range [2, 4) must page position 2 back in without
        // evicting position 3, which is also in the requested range and was
        // (before this fix) indistinguishable from any other host-resident
        // row to the single-position exclusion check.
        let dir = tempfile::tempdir().unwrap();
        let probe = manager(&dir, 1_000_000);
        let stride = probe.row_stride();
        let host_budget = 2 * (2 * stride) as u64;
        let mut pm = PageManager::new(
            PageManagerOptions { seq: 1, num_layers: 1, kv_heads: 2, head_dim: 4, elem_bytes: 2, host_budget_bytes: host_budget },
            probe.block_store.clone(),
        );

        for i in 0..5u8 {
            pm.append(0, &row(stride, i), &row(stride, 100 + i)).unwrap();
        }
        assert_eq!(pm.layers[0].state_at(3), SlotState::Host);
        assert_eq!(pm.layers[0].state_at(2), SlotState::Disk);

        let range = pm.get_range(0, 2, 2).unwrap();
        assert_eq!(&range.k[..stride], &row(stride, 2)[..]);
        assert_eq!(&range.k[stride..], &row(stride, 3)[..]);
        assert_eq!(pm.layers[0].state_at(2), SlotState::Host);
        assert_eq!(pm.layers[0].state_at(3), SlotState::Host);
    }

    #[test]
    fn remove_range_deletes_blocks_and_shrinks_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = manager(&dir, 1_000_000);
        let stride = pm.row_stride();
        for i in 0..3u8 {
            pm.append(0, &row(stride, i), &row(stride, i)).unwrap();
        }
        pm.remove_range(2, 1).unwrap();
        assert_eq!(pm.layers[0].count(), 2);
    }

    #[test]
    fn clear_empties_all_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mut pm = manager(&dir, 1_000_000);
        let stride = pm.row_stride();
        pm.append(0, &row(stride, 1), &row(stride, 1)).unwrap();
        pm.append(1, &row(stride, 1), &row(stride, 1)).unwrap();
        pm.clear().unwrap();
        let stats = pm.stats();
        assert_eq!(stats.total_host_positions(), 0);
    }
}
