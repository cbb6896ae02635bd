// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport-free outbound chat surface. The adapter supplies a
//! [`ChatApi`]; [`StreamSender`] keeps one logical "current message"
//! and appends by editing it until the chunk limit forces a new bubble.

use std::sync::Arc;

use async_trait::async_trait;

/// Hard ceiling of the transport's message size.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Minimal chat operations the sender needs.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Send a new message, returning its id.
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<i32>;

    /// Edit a previously sent message in place.
    async fn edit_message(&self, chat_id: i64, message_id: i32, text: &str) -> anyhow::Result<()>;
}

/// Status + stream sink handed to the orchestrator for one user
/// interaction.
#[async_trait]
pub trait ChatOutput: Send + Sync {
    /// One-off status notice, always a fresh message.
    async fn status(&self, text: &str);

    /// Streamed output chunk; `is_final` marks the last flush of a run.
    async fn stream(&self, text: &str, is_final: bool);
}

/// Appends output to the last outbound message until the accumulated
/// text would exceed the chunk limit, then rolls over to a new message.
/// Yields the fewest visible bubbles while staying within the limit.
pub struct StreamSender {
    api: Arc<dyn ChatApi>,
    chat_id: i64,
    chunk_limit: usize,
    message_id: Option<i32>,
    full_text: String,
}

impl StreamSender {
    pub fn new(api: Arc<dyn ChatApi>, chat_id: i64, chunk_limit: usize) -> Self {
        let chunk_limit = chunk_limit.clamp(1, TELEGRAM_MESSAGE_LIMIT);
        Self { api, chat_id, chunk_limit, message_id: None, full_text: String::new() }
    }

    pub async fn send(&mut self, text: &str, _is_final: bool) -> anyhow::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let candidate = if self.full_text.is_empty() {
            text.to_string()
        } else {
            format!("{}\n{}", self.full_text, text)
        };

        if candidate.chars().count() > self.chunk_limit {
            return self.send_new_message(text).await;
        }

        self.full_text = candidate;
        let Some(message_id) = self.message_id else {
            let text = self.full_text.clone();
            return self.send_new_message(&text).await;
        };
        let edit = self.api.edit_message(self.chat_id, message_id, &self.full_text).await;
        if edit.is_err() {
            // The message is no longer editable; start a fresh one.
            let text = self.full_text.clone();
            return self.send_new_message(&text).await;
        }
        Ok(())
    }

    async fn send_new_message(&mut self, text: &str) -> anyhow::Result<()> {
        for chunk in split_chunks(text, self.chunk_limit) {
            let message_id = self.api.send_message(self.chat_id, &chunk).await?;
            self.message_id = Some(message_id);
            self.full_text = chunk;
        }
        Ok(())
    }
}

/// Split text into consecutive pieces of at most `limit` codepoints.
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        if count == limit {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
#[path = "chat_tests.rs"]
mod tests;
