// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use nix::fcntl::{Flock, FlockArg};

/// Process-wide single-instance guard: an exclusive non-blocking
/// `flock(2)` on a well-known path, holding the owner's pid as content.
/// The lock is released when the guard is dropped.
pub struct ProcessLock {
    _lock: Flock<std::fs::File>,
}

impl ProcessLock {
    /// Acquire the lock or fail because another instance holds it.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create lock dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lock file {}", path.display()))?;
        let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_file, _errno)| anyhow::anyhow!("检测到已有实例正在运行。"))?;
        lock.set_len(0)?;
        write!(lock, "{}", std::process::id())?;
        lock.flush()?;
        Ok(Self { _lock: lock })
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
