// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Double-buffered host→device copy/compute pipeline for one layer's forward
//! attention pass.
//!
//! See SPEC_FULL.md §4.4. `DeviceBackend` stands in for the accelerator API;
//! `HostBackend` executes every "stream" op inline on the calling thread,
//! which makes the ordering guarantee trivially satisfied and lets the
//! ping-pong bookkeeping be unit-tested without a real device.
//!
//! A `Forward` call is scoped to a single sequence (one [`crate::page_manager::PageManager`]):
//! the spec's "batch × q_heads" running-state sizing collapses to "q_heads"
//! here, since batching multiple sequences through one `PageManager` has no
//! counterpart in this crate — a caller driving a batch invokes `forward`
//! once per sequence.

use crate::error::Result;
use crate::kernel::{self, RunningState};
use crate::page_manager::PageManager;
use half::f16;

/// Geometry shared by every call into a [`DeviceBackend`].
#[derive(Copy, Clone, Debug)]
pub struct AttentionDims {
    pub q_heads: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
}

/// Trait boundary standing in for the accelerator API: host→device copies,
/// kernel launches, and stream synchronization.
pub trait DeviceBackend {
    /// Opaque device-resident allocation.
    type Buffer;

    /// Issues an async copy of `host` into a fresh device buffer.
    fn copy_h2d(&self, host: &[f16]) -> Result<Self::Buffer>;

    /// Runs the online-softmax chunk kernel for every query head against the
    /// chunk's K/V rows (row-major by position, `kv_heads * head_dim` wide),
    /// updating `state`/`accum` in place.
    #[allow(clippy::too_many_arguments)]
    fn launch_chunk_kernel(
        &self,
        q: &[f16],
        k_chunk: &Self::Buffer,
        v_chunk: &Self::Buffer,
        chunk_len: usize,
        dims: AttentionDims,
        scale: f32,
        state: &mut [RunningState],
        accum: &mut [f32],
    ) -> Result<()>;

    /// Normalizes every query head's accumulator into the destination row.
    fn launch_normalize(&self, state: &[RunningState], accum: &[f32], dims: AttentionDims, dst: &mut [f16]) -> Result<()>;

    /// Blocks until every previously issued op on this backend has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Synchronous reference backend: every "stream" op runs inline.
#[derive(Default)]
pub struct HostBackend;

impl DeviceBackend for HostBackend {
    type Buffer = Vec<f16>;

    fn copy_h2d(&self, host: &[f16]) -> Result<Self::Buffer> {
        Ok(host.to_vec())
    }

    fn launch_chunk_kernel(
        &self,
        q: &[f16],
        k_chunk: &Self::Buffer,
        v_chunk: &Self::Buffer,
        chunk_len: usize,
        dims: AttentionDims,
        scale: f32,
        state: &mut [RunningState],
        accum: &mut [f32],
    ) -> Result<()> {
        for qh in 0..dims.q_heads {
            let kv_head = kernel::kv_head_for(qh, dims.q_heads, dims.kv_heads);
            let q_row = &q[qh * dims.head_dim..(qh + 1) * dims.head_dim];

            let mut k_rows = Vec::with_capacity(chunk_len * dims.head_dim);
            let mut v_rows = Vec::with_capacity(chunk_len * dims.head_dim);
            for pos in 0..chunk_len {
                let base = (pos * dims.kv_heads + kv_head) * dims.head_dim;
                k_rows.extend_from_slice(&k_chunk[base..base + dims.head_dim]);
                v_rows.extend_from_slice(&v_chunk[base..base + dims.head_dim]);
            }

            let o = &mut accum[qh * dims.head_dim..(qh + 1) * dims.head_dim];
            kernel::run_chunk(dims.head_dim, &mut state[qh], o, q_row, &k_rows, &v_rows, scale)?;
        }
        Ok(())
    }

    fn launch_normalize(&self, state: &[RunningState], accum: &[f32], dims: AttentionDims, dst: &mut [f16]) -> Result<()> {
        for qh in 0..dims.q_heads {
            let o = &accum[qh * dims.head_dim..(qh + 1) * dims.head_dim];
            let out = &mut dst[qh * dims.head_dim..(qh + 1) * dims.head_dim];
            kernel::normalize(&state[qh], o, out);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

/// Owns the ping-pong host→device double buffer and running-state scratch
/// for one orchestrator context.
pub struct Orchestrator<B: DeviceBackend> {
    backend: B,
}

impl<B: DeviceBackend> Orchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs the chunked forward pass for one layer of one sequence,
    /// reading K/V from `page_manager` and writing the normalized output
    /// into `dst`.
    ///
    /// Mirrors §4.4's algorithm: copy chunk 0, then for each chunk c,
    /// prefetch c+1 into the other ping-pong slot while the kernel consumes
    /// the buffer already in flight.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(&self, page_manager: &mut PageManager, layer: u32, q: &[f16], dst: &mut [f16], dims: AttentionDims, total_positions: u64, scale: f32, chunk_size: u64) -> Result<()> {
        debug_assert_eq!(q.len(), dims.q_heads * dims.head_dim);
        debug_assert_eq!(dst.len(), dims.q_heads * dims.head_dim);

        let mut state = vec![RunningState::new(); dims.q_heads];
        let mut accum = vec![0f32; dims.q_heads * dims.head_dim];

        if total_positions == 0 {
            self.backend.launch_normalize(&state, &accum, dims, dst)?;
            return Ok(());
        }

        let chunk_size = chunk_size.max(1);
        let num_chunks = total_positions.div_ceil(chunk_size);
        let chunk_len_of = |c: u64| -> u64 {
            let start = c * chunk_size;
            chunk_size.min(total_positions - start)
        };

        // Loads chunk `c`'s K and V rows together (one `get_range` call)
        // and stages both into device buffers. Kept as a plain method
        // rather than a closure so it only ever holds one `&mut PageManager`
        // borrow at a time, even though two ping-pong slots are in flight.
        fn load_chunk<B: DeviceBackend>(
            backend: &B,
            page_manager: &mut PageManager,
            layer: u32,
            start: u64,
            len: u64,
            elems_per_row: usize,
        ) -> Result<(B::Buffer, B::Buffer)> {
            let range = page_manager.get_range(layer, start, len)?;
            let mut k_host = vec![f16::ZERO; len as usize * elems_per_row];
            let mut v_host = vec![f16::ZERO; len as usize * elems_per_row];
            bytes_to_f16(range.k, &mut k_host);
            bytes_to_f16(range.v, &mut v_host);
            Ok((backend.copy_h2d(&k_host)?, backend.copy_h2d(&v_host)?))
        }

        let elems_per_row = dims.kv_heads * dims.head_dim;
        let mut ping: [Option<B::Buffer>; 2] = [None, None];
        let mut v_ping: [Option<B::Buffer>; 2] = [None, None];

        let (k0, v0) = load_chunk(&self.backend, page_manager, layer, 0, chunk_len_of(0), elems_per_row)?;
        ping[0] = Some(k0);
        v_ping[0] = Some(v0);
        self.backend.synchronize()?;

        let mut slot = 0usize;
        for c in 0..num_chunks {
            let next = 1 - slot;
            if c + 1 < num_chunks {
                let start = (c + 1) * chunk_size;
                let (k, v) = load_chunk(&self.backend, page_manager, layer, start, chunk_len_of(c + 1), elems_per_row)?;
                ping[next] = Some(k);
                v_ping[next] = Some(v);
            }
            self.backend.synchronize()?;

            let chunk_len = chunk_len_of(c) as usize;
            let k = ping[slot].as_ref().expect("chunk c was loaded before this iteration");
            let v = v_ping[slot].as_ref().expect("chunk c was loaded before this iteration");
            self.backend.launch_chunk_kernel(q, k, v, chunk_len, dims, scale, &mut state, &mut accum)?;
            self.backend.synchronize()?;

            slot = next;
        }

        self.backend.launch_normalize(&state, &accum, dims, dst)?;
        Ok(())
    }
}

fn bytes_to_f16(bytes: &[u8], out: &mut [f16]) {
    debug_assert_eq!(bytes.len(), out.len() * 2);
    for (i, dst) in out.iter_mut().enumerate() {
        let raw = u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        *dst = f16::from_bits(raw);
    }
}
