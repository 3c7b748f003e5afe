// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tiered KV page manager and paged ring attention for streaming transformer
//! inference.
//!
//! ##### About
//!
//! This crate extends the usable attention context of a transformer runtime
//! past on-device high-bandwidth memory by treating per-layer key/value
//! tensors as a four-tier virtual memory hierarchy — accelerator memory,
//! pinned host memory, local solid-state storage, and remote bulk storage —
//! and by supplying a streaming attention primitive that computes *exact*
//! softmax attention over a KV sequence that never simultaneously resides on
//! the accelerator.
//!
//! Two tightly coupled subsystems make this up:
//!
//! - The [`block_store`] + [`page_manager`] pair owns every KV row once it
//!   leaves the accelerator, routing it between pinned memory and one or two
//!   disk tiers under a budget discipline, persisting an index across
//!   restarts, and serving contiguous position ranges back on demand.
//! - The [`kernel`] + [`pipeline`] pair is the streaming attention algorithm:
//!   given a query resident on the accelerator and a KV sequence sourced from
//!   the page manager, it produces the exact softmax-attention output by
//!   processing KV in fixed-size chunks through a double-buffered
//!   copy/compute pipeline using the online-softmax recurrence.
//!
//! This crate has no real accelerator wired in: "the accelerator" is modeled
//! behind the [`pipeline::DeviceBackend`] trait, with [`pipeline::HostBackend`]
//! as a synchronous CPU reference implementation. A real CUDA/ROCm-backed
//! implementation is a drop-in behind the same trait.
//!
//! # Example usage
//!
//! ```
//! use kv_tiering::config::TieringConfig;
//! use kv_tiering::page_manager::{PageManager, PageManagerOptions};
//! use kv_tiering::pipeline::{AttentionDims, HostBackend, Orchestrator};
//! use half::f16;
//! use std::sync::Arc;
//! #
//! # let dir = tempfile::tempdir()?;
//!
//! // Open (or recover) the two-tier block store.
//! let store = TieringConfig::new(dir.path().join("local"))
//!     .remote_path(dir.path().join("remote"))
//!     .kv_geometry(/* kv_heads */ 1, /* head_dim */ 64, /* elem_bytes */ 2)
//!     .open()?;
//! let store = Arc::new(store);
//!
//! // One sequence's pinned KV arenas, one per layer.
//! let mut pages = PageManager::new(
//!     PageManagerOptions { seq: 0, num_layers: 1, kv_heads: 1, head_dim: 64, elem_bytes: 2, host_budget_bytes: 1 << 20 },
//!     store,
//! );
//! let row = vec![0u8; 64 * 2];
//! pages.append(0, &row, &row)?;
//!
//! // Stream attention for that layer through the host reference backend.
//! let orchestrator = Orchestrator::new(HostBackend);
//! let q = vec![f16::from_f32(0.1); 64];
//! let mut out = vec![f16::ZERO; 64];
//! let dims = AttentionDims { q_heads: 1, kv_heads: 1, head_dim: 64 };
//! orchestrator.forward(&mut pages, 0, &q, &mut out, dims, 1, 0.125, 64)?;
//! #
//! # Ok::<(), kv_tiering::error::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod block_key;
pub mod block_store;
pub mod cache_wrapper;
pub mod config;
pub mod context_pool;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod page_manager;
pub mod pipeline;

pub use block_key::{BlockKey, BlockMeta, Tier};
pub use block_store::{BlockStore, BlockStoreOptions, BlockStoreStats};
pub use cache_wrapper::{CacheWrapper, TensorView};
pub use config::TieringConfig;
pub use context_pool::{ContextKey, ContextPool, GlobalContextPool};
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use page_manager::{PageManager, PageManagerOptions, PageManagerStats};
pub use pipeline::{AttentionDims, DeviceBackend, HostBackend, Orchestrator};
