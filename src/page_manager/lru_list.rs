// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Generic recency list, ported from the teacher crate's
//! `descriptor_table::lru::LruList` almost verbatim: a `VecDeque` where
//! `refresh` moves an item to the back (most-recently-used) and
//! `get_least_recently_used` rotates the front item to the back while
//! handing it out. Here it orders host-resident KV positions instead of
//! open file descriptors.

use std::collections::VecDeque;

#[derive(Default)]
pub struct LruList<T: Clone + Eq + PartialEq>(VecDeque<T>);

impl<T: Clone + Eq + PartialEq> LruList<T> {
    pub fn remove_by(&mut self, f: impl FnMut(&T) -> bool) {
        self.0.retain(f);
    }

    pub fn remove(&mut self, item: &T) {
        self.remove_by(|x| x != item);
    }

    pub fn refresh(&mut self, item: T) {
        self.remove(&item);
        self.0.push_back(item);
    }

    /// Returns the least recently used item for which `keep` is `false`,
    /// scanning from the front. Lets a caller protect a batch of items (e.g.
    /// a range being paged in together) from being chosen as an eviction
    /// victim, rather than only the single most-recent one.
    pub fn peek_least_recently_used_excluding(&self, keep: impl Fn(&T) -> bool) -> Option<T> {
        self.0.iter().find(|item| !keep(item)).cloned()
    }
}
