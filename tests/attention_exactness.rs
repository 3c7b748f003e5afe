// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! End-to-end scenarios from SPEC_FULL.md §8: single-chunk, multi-chunk with
//! a partial tail, and grouped-query attention, all run through the full
//! `PageManager` -> `Orchestrator` -> `HostBackend` path rather than the
//! kernel alone.

use half::f16;
use kv_tiering::block_store::{BlockStore, BlockStoreOptions};
use kv_tiering::kernel;
use kv_tiering::page_manager::{PageManager, PageManagerOptions};
use kv_tiering::pipeline::{AttentionDims, HostBackend, Orchestrator};
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::sync::Arc;

fn store(dir: &tempfile::TempDir) -> Arc<BlockStore> {
    Arc::new(
        BlockStore::open(BlockStoreOptions {
            local_root: dir.path().join("local"),
            remote_root: Some(dir.path().join("remote")),
            local_budget_bytes: 1 << 30,
            remote_budget_bytes: 1 << 30,
            compress: false,
        })
        .unwrap(),
    )
}

fn gaussian_row(rng: &mut impl Rng, elems: usize, scale: f32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(elems * 2);
    for _ in 0..elems {
        let sample: f32 = rng.sample(StandardNormal);
        let x = sample * scale;
        bytes.extend_from_slice(&f16::from_f32(x).to_bits().to_le_bytes());
    }
    bytes
}

fn bytes_to_f16(bytes: &[u8]) -> Vec<f16> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Naive, unchunked f32 reference over f16-quantized Q/K/V for one head.
fn reference_attend(head_dim: usize, q: &[f16], k: &[f16], v: &[f16], scale: f32) -> Vec<f32> {
    let positions = k.len() / head_dim;
    let mut scores = vec![0f32; positions];
    for (j, score) in scores.iter_mut().enumerate() {
        let row = &k[j * head_dim..(j + 1) * head_dim];
        let mut dot = 0f32;
        for d in 0..head_dim {
            dot += q[d].to_f32() * row[d].to_f32();
        }
        *score = dot * scale;
    }
    let m = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut l = 0f32;
    let mut o = vec![0f32; head_dim];
    for (j, score) in scores.iter().enumerate() {
        let w = (score - m).exp();
        l += w;
        let row = &v[j * head_dim..(j + 1) * head_dim];
        for d in 0..head_dim {
            o[d] += w * row[d].to_f32();
        }
    }
    if l == 0.0 {
        return vec![0.0; head_dim];
    }
    o.iter().map(|x| x / l).collect()
}

fn assert_within_tolerance(got: &[f16], expected: &[f32]) {
    let mut sum_rel = 0f32;
    for (g, e) in got.iter().zip(expected) {
        let denom = e.abs().max(1e-6);
        let err = (g.to_f32() - e).abs() / denom;
        assert!(err <= 0.05, "per-element tolerance exceeded: {err}");
        sum_rel += err;
    }
    assert!(sum_rel / got.len() as f32 <= 0.005, "mean relative error exceeded 0.5%");
}

#[test]
fn single_chunk_attention_matches_reference() {
    let mut rng = StdRng::seed_from_u64(1);
    let dir = tempfile::tempdir().unwrap();
    let head_dim = 128;
    let seq_len = 64;
    let chunk_size = 64;

    let mut pm = PageManager::new(
        PageManagerOptions { seq: 0, num_layers: 1, kv_heads: 1, head_dim: head_dim as u32, elem_bytes: 2, host_budget_bytes: 1 << 30 },
        store(&dir),
    );

    let mut k_all = Vec::new();
    let mut v_all = Vec::new();
    for _ in 0..seq_len {
        let k = gaussian_row(&mut rng, head_dim, 0.1);
        let v = gaussian_row(&mut rng, head_dim, 0.1);
        k_all.extend(bytes_to_f16(&k));
        v_all.extend(bytes_to_f16(&v));
        pm.append(0, &k, &v).unwrap();
    }

    let q_bytes = gaussian_row(&mut rng, head_dim, 0.1);
    let q = bytes_to_f16(&q_bytes);
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut dst = vec![f16::ZERO; head_dim];
    let dims = AttentionDims { q_heads: 1, kv_heads: 1, head_dim };
    Orchestrator::new(HostBackend)
        .forward(&mut pm, 0, &q, &mut dst, dims, seq_len as u64, scale, chunk_size as u64)
        .unwrap();

    let expected = reference_attend(head_dim, &q, &k_all, &v_all, scale);
    assert_within_tolerance(&dst, &expected);
}

#[test]
fn multi_chunk_partial_tail_matches_reference_and_runs_three_chunks() {
    let mut rng = StdRng::seed_from_u64(2);
    let dir = tempfile::tempdir().unwrap();
    let head_dim = 128;
    let seq_len = 300;
    let chunk_size = 128u64; // 3 chunks: 128, 128, 44

    let mut pm = PageManager::new(
        PageManagerOptions { seq: 0, num_layers: 1, kv_heads: 1, head_dim: head_dim as u32, elem_bytes: 2, host_budget_bytes: 1 << 30 },
        store(&dir),
    );

    let mut k_all = Vec::new();
    let mut v_all = Vec::new();
    for _ in 0..seq_len {
        let k = gaussian_row(&mut rng, head_dim, 0.1);
        let v = gaussian_row(&mut rng, head_dim, 0.1);
        k_all.extend(bytes_to_f16(&k));
        v_all.extend(bytes_to_f16(&v));
        pm.append(0, &k, &v).unwrap();
    }

    let q_bytes = gaussian_row(&mut rng, head_dim, 0.1);
    let q = bytes_to_f16(&q_bytes);
    let scale = 1.0 / (head_dim as f32).sqrt();

    assert_eq!((seq_len as u64).div_ceil(chunk_size), 3);

    let mut dst = vec![f16::ZERO; head_dim];
    let dims = AttentionDims { q_heads: 1, kv_heads: 1, head_dim };
    Orchestrator::new(HostBackend)
        .forward(&mut pm, 0, &q, &mut dst, dims, seq_len as u64, scale, chunk_size)
        .unwrap();

    let expected = reference_attend(head_dim, &q, &k_all, &v_all, scale);
    assert_within_tolerance(&dst, &expected);
}

#[test]
fn grouped_query_attention_reads_from_floor_mapped_kv_head() {
    let head_dim = 128usize;
    let q_heads = 40usize;
    let kv_heads = 8usize;
    assert_eq!(kernel::kv_head_for(0, q_heads, kv_heads), 0);
    assert_eq!(kernel::kv_head_for(39, q_heads, kv_heads), 7);
    // every query head's floor-mapped kv head matches q * kv_heads / q_heads
    for q in 0..q_heads {
        assert_eq!(kernel::kv_head_for(q, q_heads, kv_heads), q * kv_heads / q_heads);
    }

    let mut rng = StdRng::seed_from_u64(3);
    let dir = tempfile::tempdir().unwrap();
    let seq_len = 512;
    let chunk_size = 256u64;

    let mut pm = PageManager::new(
        PageManagerOptions { seq: 0, num_layers: 1, kv_heads: kv_heads as u32, head_dim: head_dim as u32, elem_bytes: 2, host_budget_bytes: 1 << 30 },
        store(&dir),
    );

    let mut k_all = vec![Vec::new(); kv_heads];
    let mut v_all = vec![Vec::new(); kv_heads];
    for _ in 0..seq_len {
        let k_row = gaussian_row(&mut rng, kv_heads * head_dim, 0.1);
        let v_row = gaussian_row(&mut rng, kv_heads * head_dim, 0.1);
        let k_f16 = bytes_to_f16(&k_row);
        let v_f16 = bytes_to_f16(&v_row);
        for h in 0..kv_heads {
            k_all[h].extend_from_slice(&k_f16[h * head_dim..(h + 1) * head_dim]);
            v_all[h].extend_from_slice(&v_f16[h * head_dim..(h + 1) * head_dim]);
        }
        pm.append(0, &k_row, &v_row).unwrap();
    }

    let q_bytes = gaussian_row(&mut rng, q_heads * head_dim, 0.1);
    let q = bytes_to_f16(&q_bytes);
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut dst = vec![f16::ZERO; q_heads * head_dim];
    let dims = AttentionDims { q_heads, kv_heads, head_dim };
    Orchestrator::new(HostBackend)
        .forward(&mut pm, 0, &q, &mut dst, dims, seq_len as u64, scale, chunk_size)
        .unwrap();

    for qh in 0..q_heads {
        let kv_head = kernel::kv_head_for(qh, q_heads, kv_heads);
        let q_row = &q[qh * head_dim..(qh + 1) * head_dim];
        let expected = reference_attend(head_dim, q_row, &k_all[kv_head], &v_all[kv_head], scale);
        let got = &dst[qh * head_dim..(qh + 1) * head_dim];
        assert_within_tolerance(got, &expected);
    }
}
