// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Content hashing shared by every dedup scope: the driver's per-run
//! set, the orchestrator's rollout reconciliation, and the adapter's
//! per-user send window.

use sha2::{Digest, Sha256};

/// Normalize text before hashing: unify line endings to `\n`, strip
/// trailing whitespace from each line, and drop trailing blank lines.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize_for_dedupe(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = unified.split('\n').map(|line| line.trim_end()).collect();
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n")
}

/// Hex SHA-256 of the normalized text.
pub fn dedupe_hash(text: &str) -> String {
    let normalized = normalize_for_dedupe(text);
    hash_normalized(&normalized)
}

/// Hex SHA-256 of already-normalized text.
pub fn hash_normalized(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Hash for dedup purposes, skipping empty or whitespace-only text.
pub fn dedupe_hash_nonempty(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let normalized = normalize_for_dedupe(text);
    if normalized.is_empty() {
        return None;
    }
    Some(hash_normalized(&normalized))
}

#[cfg(test)]
#[path = "hash_tests.rs"]
mod tests;
