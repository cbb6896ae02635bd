// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coalescing buffer in front of a chat sender. Producers push lines;
//! a periodic flusher drains them, joins with newlines, splits to the
//! chunk limit, and forwards each piece. Lives for one run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chat::{split_chunks, ChatOutput};

pub struct StreamBroker {
    inner: Arc<BrokerInner>,
    flush_interval: Duration,
    flusher: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct BrokerInner {
    out: Arc<dyn ChatOutput>,
    chunk_limit: usize,
    buffer: Mutex<Vec<String>>,
}

impl StreamBroker {
    pub fn new(out: Arc<dyn ChatOutput>, flush_interval: f64, chunk_limit: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner { out, chunk_limit, buffer: Mutex::new(Vec::new()) }),
            flush_interval: Duration::from_secs_f64(flush_interval.max(0.01)),
            flusher: parking_lot::Mutex::new(None),
        }
    }

    /// Start the periodic flusher. Idempotent.
    pub fn start(&self) {
        let mut flusher = self.flusher.lock();
        if flusher.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let interval = self.flush_interval;
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                inner.flush(false).await;
            }
        });
        *flusher = Some((shutdown, handle));
    }

    /// Cancel the flusher, await it, then flush whatever remains. The
    /// buffer is empty afterwards.
    pub async fn stop(&self) {
        let taken = self.flusher.lock().take();
        if let Some((shutdown, handle)) = taken {
            shutdown.cancel();
            if let Err(e) = handle.await {
                debug!("flusher task ended abnormally: {e}");
            }
        }
        self.inner.flush(true).await;
    }

    /// Queue one line; stderr lines carry a marker tag.
    pub async fn push(&self, text: &str, is_error: bool) {
        let line = if is_error { format!("[stderr] {text}") } else { text.to_string() };
        self.inner.buffer.lock().await.push(line);
    }

    pub async fn flush(&self, is_final: bool) {
        self.inner.flush(is_final).await;
    }

    #[cfg(test)]
    pub(crate) async fn buffered(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }
}

impl BrokerInner {
    async fn flush(&self, is_final: bool) {
        let content = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            let content = buffer.join("\n");
            buffer.clear();
            content
        };
        for chunk in split_chunks(&content, self.chunk_limit) {
            self.out.stream(&chunk, is_final).await;
        }
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
