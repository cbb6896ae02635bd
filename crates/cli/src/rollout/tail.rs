// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Live follower of a rotating session file. Tracks `(path, inode,
//! offset)`; any stat failure, inode change, or truncation forgets the
//! handle and re-resolves the path from the resume id on the next wake.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ReasoningMode;

use super::{event_msg_text, find_session_file, summarize_reasoning, EventText, RolloutRecord};

const STAT_INTERVAL: Duration = Duration::from_millis(500);
const RESOLVE_BACKOFF: Duration = Duration::from_millis(500);
const READ_BACKOFF: Duration = Duration::from_millis(200);

pub struct EventTailer {
    codex_home: PathBuf,
    resume_id: String,
    reasoning_mode: ReasoningMode,
    reasoning_throttle: Duration,
}

struct OpenLog {
    path: PathBuf,
    reader: BufReader<std::fs::File>,
    inode: u64,
    offset: u64,
}

impl EventTailer {
    pub fn new(
        codex_home: PathBuf,
        resume_id: impl Into<String>,
        reasoning_mode: ReasoningMode,
        reasoning_throttle_seconds: f64,
    ) -> Self {
        Self {
            codex_home,
            resume_id: resume_id.into(),
            reasoning_mode,
            reasoning_throttle: Duration::from_secs_f64(reasoning_throttle_seconds.max(0.0)),
        }
    }

    fn open_current(&self) -> Option<OpenLog> {
        let path = find_session_file(&self.codex_home, &self.resume_id)?;
        let file = std::fs::File::open(&path).ok()?;
        let meta = file.metadata().ok()?;
        let inode = meta.ino();
        let offset = meta.len();
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset)).ok()?;
        Some(OpenLog { path, reader, inode, offset })
    }

    /// Follow the stream until `shutdown`, sending each visible text to
    /// `tx`. Reasoning events are throttled and hidden or summarized;
    /// consecutive duplicate messages are suppressed.
    pub async fn run(self, tx: mpsc::Sender<String>, shutdown: CancellationToken) {
        let mut open: Option<OpenLog> = None;
        let mut last_stat_check = Instant::now() - STAT_INTERVAL;
        let mut last_reasoning_at: Option<Instant> = None;
        let mut last_message: Option<String> = None;

        while !shutdown.is_cancelled() {
            let Some(log) = open.as_mut() else {
                open = self.open_current();
                if open.is_none() && !Self::pause(&shutdown, RESOLVE_BACKOFF).await {
                    break;
                }
                continue;
            };

            let mut line = String::new();
            let read = {
                let mut raw = Vec::new();
                match log.reader.read_until(b'\n', &mut raw) {
                    Ok(n) => {
                        line = String::from_utf8_lossy(&raw).into_owned();
                        n
                    }
                    Err(_) => 0,
                }
            };

            if read == 0 {
                // No new data: periodically re-stat to catch rotation,
                // deletion, and truncation.
                if last_stat_check.elapsed() >= STAT_INTERVAL {
                    last_stat_check = Instant::now();
                    let stat = std::fs::metadata(&log.path);
                    let stale = match stat {
                        Err(_) => true,
                        Ok(meta) => meta.ino() != log.inode || meta.len() < log.offset,
                    };
                    if stale {
                        open = None;
                    }
                }
                if !Self::pause(&shutdown, READ_BACKOFF).await {
                    break;
                }
                continue;
            }

            log.offset += read as u64;
            let Some(record) = RolloutRecord::parse(line.trim()) else {
                continue;
            };
            let Some(event) = event_msg_text(&record) else {
                continue;
            };
            let text = match event {
                EventText::Reasoning(text) => {
                    let throttled = last_reasoning_at
                        .is_some_and(|at| at.elapsed() < self.reasoning_throttle);
                    if throttled {
                        continue;
                    }
                    last_reasoning_at = Some(Instant::now());
                    match self.reasoning_mode {
                        ReasoningMode::Summary => summarize_reasoning(&text),
                        ReasoningMode::Hidden => "进度：内部推理进行中（内容已隐藏）。".to_string(),
                    }
                }
                EventText::Message(text) => {
                    if last_message.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    last_message = Some(text.clone());
                    text
                }
            };
            if tx.send(text).await.is_err() {
                break;
            }
        }
    }

    /// Sleep unless shutdown fires first; returns `false` on shutdown.
    async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
#[path = "tail_tests.rs"]
mod tests;
