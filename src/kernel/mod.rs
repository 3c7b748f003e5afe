// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Chunked online-softmax attention kernel.
//!
//! See SPEC_FULL.md §4.3. Dispatch over `head_dim` mirrors what a real
//! per-dimension kernel-instantiation table would do: a `match` selects a
//! `const HEAD_DIM: usize` monomorphization so the inner dot-product loops
//! are fixed-size at each supported head dim.

use crate::error::{Error, Result};
use half::f16;

/// Head dimensions this crate instantiates a kernel for.
pub const SUPPORTED_HEAD_DIMS: [usize; 5] = [64, 80, 96, 128, 256];

/// Running online-softmax accumulator for one (batch, query-head).
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningState {
    pub m: f32,
    pub l: f32,
}

impl RunningState {
    #[must_use]
    pub fn new() -> Self {
        Self { m: f32::NEG_INFINITY, l: 0.0 }
    }
}

/// Maps query head `q` to its shared KV head under grouped-query attention.
#[must_use]
pub fn kv_head_for(q_head: usize, q_heads: usize, kv_heads: usize) -> usize {
    debug_assert!(kv_heads > 0 && q_heads >= kv_heads);
    q_head * kv_heads / q_heads
}

/// Processes one chunk of `L` K/V rows against a single query, updating
/// `state` and the running output accumulator `o` in place.
///
/// `q` is `HEAD_DIM` f16 elements; `k_chunk`/`v_chunk` are `L * HEAD_DIM` f16
/// elements, row-major by position; `o` is `HEAD_DIM` f32 accumulators.
pub fn run_chunk(head_dim: usize, state: &mut RunningState, o: &mut [f32], q: &[f16], k_chunk: &[f16], v_chunk: &[f16], scale: f32) -> Result<()> {
    if o.len() != head_dim || q.len() != head_dim {
        return Err(Error::UnsupportedHeadDim(head_dim));
    }
    match head_dim {
        64 => chunk_kernel::<64>(state, o, q, k_chunk, v_chunk, scale),
        80 => chunk_kernel::<80>(state, o, q, k_chunk, v_chunk, scale),
        96 => chunk_kernel::<96>(state, o, q, k_chunk, v_chunk, scale),
        128 => chunk_kernel::<128>(state, o, q, k_chunk, v_chunk, scale),
        256 => chunk_kernel::<256>(state, o, q, k_chunk, v_chunk, scale),
        other => Err(Error::UnsupportedHeadDim(other)),
    }
}

fn chunk_kernel<const HEAD_DIM: usize>(state: &mut RunningState, o: &mut [f32], q: &[f16], k_chunk: &[f16], v_chunk: &[f16], scale: f32) -> Result<()> {
    debug_assert_eq!(q.len(), HEAD_DIM);
    debug_assert_eq!(o.len(), HEAD_DIM);
    debug_assert_eq!(k_chunk.len() % HEAD_DIM, 0);
    debug_assert_eq!(k_chunk.len(), v_chunk.len());

    let q: [f32; HEAD_DIM] = std::array::from_fn(|d| q[d].to_f32());
    let chunk_len = k_chunk.len() / HEAD_DIM;

    let mut scores = vec![0f32; chunk_len];
    let mut m_chunk = f32::NEG_INFINITY;
    for (j, score) in scores.iter_mut().enumerate() {
        let row = &k_chunk[j * HEAD_DIM..(j + 1) * HEAD_DIM];
        let mut dot = 0f32;
        for d in 0..HEAD_DIM {
            dot += q[d] * row[d].to_f32();
        }
        *score = dot * scale;
        m_chunk = m_chunk.max(*score);
    }

    let m_old = state.m;
    let m_new = m_old.max(m_chunk);
    let correction = if m_old > f32::NEG_INFINITY { (m_old - m_new).exp() } else { 0.0 };

    for out in o.iter_mut() {
        *out *= correction;
    }
    state.l *= correction;

    for (j, score) in scores.iter().enumerate() {
        let w = (score - m_new).exp();
        state.l += w;
        let row = &v_chunk[j * HEAD_DIM..(j + 1) * HEAD_DIM];
        for d in 0..HEAD_DIM {
            o[d] += w * row[d].to_f32();
        }
    }

    state.m = m_new;
    Ok(())
}

/// Normalizes the running accumulator into an f16 output row, per §4.3's
/// "output = O / ℓ, cast to f16 on write" with the ℓ = 0 edge case mapped to
/// an all-zero row.
pub fn normalize(state: &RunningState, o: &[f32], out: &mut [f16]) {
    debug_assert_eq!(o.len(), out.len());
    if state.l == 0.0 {
        out.fill(f16::ZERO);
        return;
    }
    for (dst, &src) in out.iter_mut().zip(o) {
        *dst = f16::from_f32(src / state.l);
    }
}

/// Full reference attention over `positions` K/V rows for one (batch,
/// query-head), chunked by `chunk_size`. Used both as the production
/// single-threaded fallback path and as the exactness reference in tests.
pub fn attend_reference(head_dim: usize, q: &[f16], k: &[f16], v: &[f16], chunk_size: usize, scale: f32) -> Result<Vec<f16>> {
    if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
        return Err(Error::UnsupportedHeadDim(head_dim));
    }
    let positions = k.len() / head_dim;
    let mut state = RunningState::new();
    let mut o = vec![0f32; head_dim];

    let mut start = 0;
    while start < positions {
        let len = chunk_size.min(positions - start).max(1).min(positions - start);
        let end = start + len;
        run_chunk(head_dim, &mut state, &mut o, q, &k[start * head_dim..end * head_dim], &v[start * head_dim..end * head_dim], scale)?;
        start = end;
    }

    let mut out = vec![f16::ZERO; head_dim];
    normalize(&state, &o, &mut out);
    Ok(out)
}
