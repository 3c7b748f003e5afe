// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Builder-style configuration for the tiering stack.
//!
//! See SPEC_FULL.md §6. Every option in the configuration table is a field
//! here, set through a chained `with_*` setter and validated at [`TieringConfig::open`].

use crate::block_store::{BlockStore, BlockStoreOptions};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Threshold (in total KV positions) above which an auto-selected chunk size
/// switches from 512 to 2048, per §6's bridge ABI.
const AUTO_CHUNK_SIZE_THRESHOLD: u64 = 4096;
const AUTO_CHUNK_SIZE_LARGE: u64 = 2048;
const AUTO_CHUNK_SIZE_SMALL: u64 = 512;

/// Chained configuration for a tiering session: two storage tiers plus the
/// pinned-arena and orchestrator geometry that sit on top of them.
///
/// Clone-on-write in spirit: every setter takes `self` by value and hands
/// back an owned copy, so `let cfg = TieringConfig::new(root).compress(true);`
/// reads the way the teacher crate's own `Config` builder does.
#[derive(Clone, Debug)]
pub struct TieringConfig {
    /// Master switch; when `false`, wrapper operations are documented no-ops
    /// (enforced by callers — this crate's `BlockStore`/`PageManager` do not
    /// themselves read this flag, since they have no notion of "disabled").
    pub tiering_enabled: bool,
    pub local_path: PathBuf,
    pub remote_path: Option<PathBuf>,
    pub local_budget_bytes: u64,
    pub remote_budget_bytes: u64,
    pub compress: bool,
    /// Positions per wrapper-level block. Finer granularity means more I/O
    /// per restore but coarser loses prefix-extension precision.
    pub block_size: u32,
    pub host_budget_bytes: u64,
    /// Positions per orchestrator chunk. `0` means "auto": §6's 2048-above-4096,
    /// else 512.
    pub chunk_size: u64,
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub elem_bytes: u32,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            tiering_enabled: true,
            local_path: PathBuf::from(".kv_tiering"),
            remote_path: None,
            local_budget_bytes: 1 << 30, // 1 GiB
            remote_budget_bytes: 16 << 30, // 16 GiB
            compress: false,
            block_size: 256,
            host_budget_bytes: 512 << 20, // 512 MiB
            chunk_size: 0,
            num_kv_heads: 8,
            head_dim: 128,
            elem_bytes: 2,
        }
    }
}

impl TieringConfig {
    /// Starts a new config rooted at `local_path`, otherwise defaulted.
    #[must_use]
    pub fn new<P: AsRef<Path>>(local_path: P) -> Self {
        Self { local_path: local_path.as_ref().to_path_buf(), ..Default::default() }
    }

    #[must_use]
    pub fn tiering_enabled(mut self, enabled: bool) -> Self {
        self.tiering_enabled = enabled;
        self
    }

    #[must_use]
    pub fn remote_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.remote_path = Some(path.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn local_budget_bytes(mut self, bytes: u64) -> Self {
        self.local_budget_bytes = bytes;
        self
    }

    #[must_use]
    pub fn remote_budget_bytes(mut self, bytes: u64) -> Self {
        self.remote_budget_bytes = bytes;
        self
    }

    #[must_use]
    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    #[must_use]
    pub fn block_size(mut self, positions: u32) -> Self {
        self.block_size = positions;
        self
    }

    #[must_use]
    pub fn host_budget_bytes(mut self, bytes: u64) -> Self {
        self.host_budget_bytes = bytes;
        self
    }

    /// Sets the orchestrator chunk size. `0` requests auto-selection, see
    /// [`TieringConfig::resolved_chunk_size`].
    #[must_use]
    pub fn chunk_size(mut self, positions: u64) -> Self {
        self.chunk_size = positions;
        self
    }

    #[must_use]
    pub fn kv_geometry(mut self, num_kv_heads: u32, head_dim: u32, elem_bytes: u32) -> Self {
        self.num_kv_heads = num_kv_heads;
        self.head_dim = head_dim;
        self.elem_bytes = elem_bytes;
        self
    }

    /// Resolves `chunk_size == 0` against `total_positions`, per §6's bridge
    /// ABI: 2048 above the 4096-position threshold, else 512.
    #[must_use]
    pub fn resolved_chunk_size(&self, total_positions: u64) -> u64 {
        if self.chunk_size != 0 {
            return self.chunk_size;
        }
        if total_positions > AUTO_CHUNK_SIZE_THRESHOLD {
            AUTO_CHUNK_SIZE_LARGE
        } else {
            AUTO_CHUNK_SIZE_SMALL
        }
    }

    /// Validates the configuration and opens the block store it describes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedHeadDim`] if `head_dim` has no kernel
    /// instantiation, and propagates any I/O error from opening the store.
    pub fn open(self) -> Result<BlockStore> {
        if !crate::kernel::SUPPORTED_HEAD_DIMS.contains(&(self.head_dim as usize)) {
            return Err(Error::UnsupportedHeadDim(self.head_dim as usize));
        }
        BlockStore::open(BlockStoreOptions {
            local_root: self.local_path,
            remote_root: self.remote_path,
            local_budget_bytes: self.local_budget_bytes,
            remote_budget_bytes: self.remote_budget_bytes,
            compress: self.compress,
        })
    }
}
