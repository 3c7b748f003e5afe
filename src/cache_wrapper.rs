// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bridges a host runtime's KV cache cell lifecycle to the [`crate::block_store`].
//!
//! See SPEC_FULL.md §4.6. The runtime's tensor storage is represented by
//! [`TensorView`], a small trait over a borrowed mutable byte slice, so the
//! wrapper can be exercised against an in-memory fake without a real
//! host-runtime cache.

use crate::block_key::{BlockKey, LayerIdx, Position, SeqId};
use crate::block_store::BlockStore;
use std::sync::Arc;

/// A runtime-owned tensor's byte-level view: `stride` bytes per row,
/// `capacity` rows, contiguous storage (`stride * capacity` bytes total).
/// The wrapper never retains a `TensorView` beyond the call it was passed
/// into.
pub trait TensorView {
    fn stride(&self) -> usize;
    fn capacity(&self) -> usize;
    fn row(&self, index: usize) -> &[u8];
    fn row_mut(&mut self, index: usize) -> &mut [u8];
}

/// One occupied cache cell: which (sequence, position) it currently holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellOccupant {
    pub seq: SeqId,
    pub pos: Position,
}

/// Tracks which cells are free/occupied in a runtime-owned tensor, and
/// bridges eviction/restoration to the block store.
///
/// §7 policy: this layer never aborts the containing request on tiering
/// errors. `remove` drops snapshot failures with a warning (the runtime
/// already plans to discard those cells regardless); `restore_range` stops
/// at the first missing or failed position and lets the runtime fall back
/// to recomputation for the rest.
pub struct CacheWrapper {
    block_store: Arc<BlockStore>,
    num_layers: u32,
    dtype: String,
    shape: Vec<u64>,
    occupants: Vec<Option<CellOccupant>>,
}

impl CacheWrapper {
    #[must_use]
    pub fn new(block_store: Arc<BlockStore>, num_layers: u32, dtype: impl Into<String>, shape: Vec<u64>, capacity: usize) -> Self {
        Self {
            block_store,
            num_layers,
            dtype: dtype.into(),
            shape,
            occupants: vec![None; capacity],
        }
    }

    /// Marks cell `index` as holding `(seq, pos)`.
    pub fn occupy(&mut self, index: usize, seq: SeqId, pos: Position) {
        self.occupants[index] = Some(CellOccupant { seq, pos });
    }

    #[must_use]
    pub fn occupant(&self, index: usize) -> Option<CellOccupant> {
        self.occupants[index]
    }

    /// The block store backing this wrapper's snapshots.
    #[must_use]
    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    fn cells_in_range(&self, seq: SeqId, begin_pos: Position, end_pos: Position) -> Vec<usize> {
        self.occupants
            .iter()
            .enumerate()
            .filter_map(|(i, occ)| occ.filter(|o| o.seq == seq && o.pos >= begin_pos && o.pos < end_pos).map(|_| i))
            .collect()
    }

    /// Snapshots every occupied cell in `[begin_pos, end_pos)` for `seq`
    /// into the block store (one (layer, K/V) pair per position via
    /// `tensors`), then frees those cells.
    ///
    /// `tensors(layer, is_key)` must return the runtime's tensor for that
    /// (layer, K-or-V) pair; `row_of(cell_index)` maps a cache cell to its
    /// row index within that tensor.
    pub fn remove(&mut self, seq: SeqId, begin_pos: Position, end_pos: Position, mut tensors: impl FnMut(LayerIdx, bool) -> Box<dyn TensorView + '_>, row_of: impl Fn(usize) -> usize) {
        let cells = self.cells_in_range(seq, begin_pos, end_pos);
        for &cell in &cells {
            let pos = self.occupants[cell].expect("cell came from cells_in_range").pos;
            for layer in 0..self.num_layers {
                for &is_key in &[true, false] {
                    let tensor = tensors(layer, is_key);
                    let row = tensor.row(row_of(cell)).to_vec();
                    let key = BlockKey::row(seq, layer, pos, is_key);
                    if let Err(e) = self.block_store.put(key, &self.dtype, self.shape.clone(), &row) {
                        log::warn!("cache wrapper: snapshot of {} failed, dropping ({e})", key.to_key_string());
                    }
                }
            }
        }
        for cell in cells {
            self.occupants[cell] = None;
        }
    }

    /// Extends an in-memory prefix match onto disk: for each position
    /// starting at `begin_pos`, restores both K and V for every layer into
    /// a free cell via `free_cell` and `tensors`, stopping at the first
    /// position with a missing block. Returns the number of positions
    /// actually restored.
    pub fn restore_range(&mut self, seq: SeqId, begin_pos: Position, end_pos: Position, mut tensors: impl FnMut(LayerIdx, bool) -> Box<dyn TensorView + '_>, mut free_cell: impl FnMut() -> Option<usize>) -> usize {
        let mut restored = 0;
        for pos in begin_pos..end_pos {
            let mut layer_bytes: Vec<(LayerIdx, Vec<u8>, Vec<u8>)> = Vec::with_capacity(self.num_layers as usize);
            let mut complete = true;
            for layer in 0..self.num_layers {
                let k_key = BlockKey::row(seq, layer, pos, true);
                let v_key = BlockKey::row(seq, layer, pos, false);
                match (self.block_store.get(&k_key), self.block_store.get(&v_key)) {
                    (Ok((k, _)), Ok((v, _))) => layer_bytes.push((layer, k, v)),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                break;
            }

            let Some(cell) = free_cell() else {
                break;
            };
            for (layer, k, v) in layer_bytes {
                let mut k_tensor = tensors(layer, true);
                k_tensor.row_mut(cell).copy_from_slice(&k);
                let mut v_tensor = tensors(layer, false);
                v_tensor.row_mut(cell).copy_from_slice(&v);
            }
            self.occupants[cell] = Some(CellOccupant { seq, pos });
            restored += 1;
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStoreOptions;

    struct FakeTensor {
        stride: usize,
        data: Vec<u8>,
    }

    impl FakeTensor {
        fn new(stride: usize, capacity: usize) -> Self {
            Self { stride, data: vec![0u8; stride * capacity] }
        }
    }

    impl TensorView for FakeTensor {
        fn stride(&self) -> usize {
            self.stride
        }

        fn capacity(&self) -> usize {
            self.data.len() / self.stride
        }

        fn row(&self, index: usize) -> &[u8] {
            &self.data[index * self.stride..(index + 1) * self.stride]
        }

        fn row_mut(&mut self, index: usize) -> &mut [u8] {
            &mut self.data[index * self.stride..(index + 1) * self.stride]
        }
    }

    fn wrapper(dir: &tempfile::TempDir, num_layers: u32, capacity: usize) -> CacheWrapper {
        let store = BlockStore::open(BlockStoreOptions {
            local_root: dir.path().join("local"),
            remote_root: None,
            local_budget_bytes: 1_000_000,
            remote_budget_bytes: 0,
            compress: false,
        })
        .unwrap();
        CacheWrapper::new(Arc::new(store), num_layers, "f16", vec![8], capacity)
    }

    #[test]
    fn remove_snapshots_then_frees_cells() {
        let dir = tempfile::tempdir().unwrap();
        let mut wrapper = wrapper(&dir, 1, 4);
        let mut k_tensor = FakeTensor::new(8, 4);
        let mut v_tensor = FakeTensor::new(8, 4);
        k_tensor.data[0..8].copy_from_slice(&[1; 8]);
        v_tensor.data[0..8].copy_from_slice(&[2; 8]);
        wrapper.occupy(0, 7, 3);

        wrapper.remove(
            7,
            3,
            4,
            |_layer, is_key| -> Box<dyn TensorView + '_> {
                if is_key {
                    Box::new(FakeTensor { stride: 8, data: k_tensor.data.clone() })
                } else {
                    Box::new(FakeTensor { stride: 8, data: v_tensor.data.clone() })
                }
            },
            |_cell| 0,
        );

        assert!(wrapper.occupant(0).is_none());
        let (bytes, _) = wrapper.block_store.get(&BlockKey::row(7, 0, 3, true)).unwrap();
        assert_eq!(bytes, vec![1u8; 8]);
    }

    /// Aliases a single persistent `FakeTensor` across repeated `tensors`
    /// callbacks, so a write through `row_mut` is observable after the call
    /// returns instead of landing in a throwaway clone.
    struct TensorRef<'a>(&'a mut FakeTensor);

    impl TensorView for TensorRef<'_> {
        fn stride(&self) -> usize {
            self.0.stride()
        }

        fn capacity(&self) -> usize {
            self.0.capacity()
        }

        fn row(&self, index: usize) -> &[u8] {
            self.0.row(index)
        }

        fn row_mut(&mut self, index: usize) -> &mut [u8] {
            self.0.row_mut(index)
        }
    }

    #[test]
    fn restore_range_stops_at_first_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut wrapper = wrapper(&dir, 1, 4);
        wrapper.block_store.put(BlockKey::row(7, 0, 0, true), "f16", vec![8], &[9u8; 8]).unwrap();
        wrapper.block_store.put(BlockKey::row(7, 0, 0, false), "f16", vec![8], &[10u8; 8]).unwrap();
        // position 1 deliberately left absent from the block store.

        let mut dst_k = FakeTensor::new(8, 4);
        let mut dst_v = FakeTensor::new(8, 4);
        let mut free = vec![0usize, 1, 2, 3].into_iter();

        let restored = wrapper.restore_range(
            7,
            0,
            2,
            |_layer, is_key| -> Box<dyn TensorView + '_> {
                if is_key {
                    Box::new(TensorRef(&mut dst_k))
                } else {
                    Box::new(TensorRef(&mut dst_v))
                }
            },
            || free.next(),
        );

        assert_eq!(restored, 1);
        assert_eq!(dst_k.row(0), [9u8; 8]);
        assert_eq!(dst_v.row(0), [10u8; 8]);
    }
}
