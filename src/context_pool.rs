// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide bounded pool of orchestrator contexts.
//!
//! See SPEC_FULL.md §4.5. Guarded by `OnceLock`, the same one-shot
//! primitive family the teacher crate reaches for on its own one-time setup
//! paths (e.g. its journal/compaction worker bootstrap).

use crate::error::{Error, Result};
use crate::pipeline::{DeviceBackend, Orchestrator};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Mutex, OnceLock};

/// Identifies one orchestrator context's geometry and placement.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub num_kv_heads: u32,
    pub head_dim: u32,
    pub chunk_size: u64,
    pub device: u32,
}

/// Bounded, lazily-initialized pool of [`Orchestrator`] contexts keyed by
/// [`ContextKey`]. `B::Buffer` contexts are never evicted individually —
/// `cleanup` tears the whole pool down at once, matching §4.5.
pub struct ContextPool<B: DeviceBackend> {
    max_contexts: usize,
    contexts: Mutex<FxHashMap<ContextKey, Orchestrator<B>>>,
}

impl<B: DeviceBackend> ContextPool<B> {
    #[must_use]
    pub fn new(max_contexts: usize) -> Self {
        Self { max_contexts, contexts: Mutex::new(FxHashMap::default()) }
    }

    /// Returns the existing context for `key`, or constructs one with
    /// `make` if absent. Fails with `PoolExhausted` if the pool is full and
    /// `key` is not already present.
    pub fn get_or_create(&self, key: ContextKey, make: impl FnOnce() -> Orchestrator<B>) -> Result<()> {
        let mut contexts = self.contexts.lock().expect("context pool lock poisoned");
        if contexts.contains_key(&key) {
            return Ok(());
        }
        if contexts.len() >= self.max_contexts {
            return Err(Error::PoolExhausted);
        }
        contexts.insert(key, make());
        Ok(())
    }

    /// Runs `f` with the context for `key`, if present.
    pub fn with_context<R>(&self, key: &ContextKey, f: impl FnOnce(&Orchestrator<B>) -> R) -> Option<R> {
        let contexts = self.contexts.lock().expect("context pool lock poisoned");
        contexts.get(key).map(f)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.lock().expect("context pool lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears down every context.
    pub fn cleanup(&self) {
        self.contexts.lock().expect("context pool lock poisoned").clear();
    }
}

/// Global one-shot guard for the process-wide pool, per §9 "Global state":
/// callers wire this up explicitly during runtime boot rather than relying
/// on implicit first-use initialization.
pub struct GlobalContextPool<B: DeviceBackend> {
    once: OnceLock<ContextPool<B>>,
}

impl<B: DeviceBackend> GlobalContextPool<B> {
    pub const fn new() -> Self {
        Self { once: OnceLock::new() }
    }

    /// Initializes the pool on first call; subsequent calls (with any
    /// `max_contexts`) observe the pool created by the first call.
    pub fn initialize(&self, max_contexts: usize) -> &ContextPool<B> {
        self.once.get_or_init(|| ContextPool::new(max_contexts))
    }

    /// Returns the pool, if `initialize` has already run.
    pub fn get(&self) -> Option<&ContextPool<B>> {
        self.once.get()
    }
}

impl<B: DeviceBackend> Default for GlobalContextPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::HostBackend;

    fn key(n: u32) -> ContextKey {
        ContextKey { num_kv_heads: n, head_dim: 64, chunk_size: 256, device: 0 }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let pool: ContextPool<HostBackend> = ContextPool::new(2);
        pool.get_or_create(key(1), || Orchestrator::new(HostBackend)).unwrap();
        pool.get_or_create(key(1), || Orchestrator::new(HostBackend)).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn pool_exhausted_when_full() {
        let pool: ContextPool<HostBackend> = ContextPool::new(1);
        pool.get_or_create(key(1), || Orchestrator::new(HostBackend)).unwrap();
        let err = pool.get_or_create(key(2), || Orchestrator::new(HostBackend)).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted));
    }

    #[test]
    fn cleanup_empties_pool() {
        let pool: ContextPool<HostBackend> = ContextPool::new(2);
        pool.get_or_create(key(1), || Orchestrator::new(HostBackend)).unwrap();
        pool.cleanup();
        assert!(pool.is_empty());
    }

    #[test]
    fn global_pool_initializes_once() {
        let global: GlobalContextPool<HostBackend> = GlobalContextPool::new();
        let a = global.initialize(4) as *const _;
        let b = global.initialize(99) as *const _;
        assert_eq!(a, b);
        assert_eq!(global.get().unwrap().max_contexts, 4);
    }
}
