// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded per-user send-dedup window: suppresses repeated pushes
//! across the periodic poller and the streaming path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::hash::dedupe_hash_nonempty;

const DEDUP_TTL: Duration = Duration::from_secs(3600);
const DEDUP_MAX_ENTRIES: usize = 256;

pub struct DedupWindow {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupWindow {
    pub fn new() -> Self {
        Self::with_limits(DEDUP_TTL, DEDUP_MAX_ENTRIES)
    }

    pub fn with_limits(ttl: Duration, max_entries: usize) -> Self {
        Self { entries: HashMap::new(), ttl, max_entries }
    }

    /// Expired entries go first; then the oldest by insertion time
    /// until the window fits.
    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted_at| inserted_at.elapsed() <= ttl);
        if self.entries.len() <= self.max_entries {
            return;
        }
        let mut by_age: Vec<(String, Instant)> =
            self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
        let excess = self.entries.len() - self.max_entries;
        for (key, _) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }

    /// Record-and-test: `false` when the text was pushed recently.
    pub fn should_send(&mut self, text: &str) -> bool {
        let Some(digest) = dedupe_hash_nonempty(text) else {
            return true;
        };
        self.prune();
        if self.entries.contains_key(&digest) {
            return false;
        }
        self.entries.insert(digest, Instant::now());
        true
    }

    /// Record without testing (used after a streamed run completes).
    pub fn record(&mut self, text: &str) {
        let Some(digest) = dedupe_hash_nonempty(text) else {
            return;
        };
        self.prune();
        self.entries.insert(digest, Instant::now());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[path = "dedupe_tests.rs"]
mod tests;
