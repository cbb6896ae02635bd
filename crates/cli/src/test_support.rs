// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for unit tests.

use std::collections::BTreeSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chat::ChatOutput;
use crate::config::{InputMode, ReasoningMode, RuntimeConfig};
use crate::driver::{RunSink, StatusToken};

/// A runtime config with fast timers, suitable as a baseline for tests.
pub fn runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        telegram_bot_token: "token".to_string(),
        telegram_allowed_user_ids: BTreeSet::from([1]),
        codex_cli_cmd: "codex".to_string(),
        codex_cli_args: Vec::new(),
        codex_cli_input_mode: InputMode::Stdin,
        codex_cli_resume_id: None,
        codex_cli_approvals_mode: Some("3".to_string()),
        codex_cli_skip_git_check: true,
        codex_cli_use_pty: false,
        codex_workdir: ".".to_string(),
        stream_flush_interval: 0.01,
        stream_include_stderr: false,
        progress_tick_interval: 0.5,
        run_timeout_seconds: 5.0,
        context_compaction_idle_timeout_seconds: 60.0,
        no_output_idle_timeout_seconds: 900.0,
        final_result_idle_timeout_seconds: 30.0,
        jsonl_sync_interval_seconds: 0.0,
        jsonl_stream_events: false,
        jsonl_reasoning_throttle_seconds: 10.0,
        jsonl_reasoning_mode: ReasoningMode::Hidden,
        message_chunk_limit: 1000,
    }
}

/// A [`RunSink`] that records everything it sees.
#[derive(Default)]
pub struct CollectingSink {
    pub outputs: Mutex<Vec<(String, bool)>>,
    pub statuses: Mutex<Vec<StatusToken>>,
    pub finals: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn output_texts(&self) -> Vec<String> {
        self.outputs.lock().iter().map(|(text, _)| text.clone()).collect()
    }

    pub fn saw_status(&self, token: StatusToken) -> bool {
        self.statuses.lock().contains(&token)
    }
}

#[async_trait]
impl RunSink for CollectingSink {
    async fn output(&self, text: &str, is_error: bool) {
        self.outputs.lock().push((text.to_string(), is_error));
    }

    async fn status(&self, token: StatusToken) {
        self.statuses.lock().push(token);
    }

    async fn final_message(&self, text: &str) {
        self.finals.lock().push(text.to_string());
    }
}

/// A [`ChatOutput`] that records statuses and streamed chunks.
#[derive(Default)]
pub struct CollectingOutput {
    pub statuses: Mutex<Vec<String>>,
    pub streamed: Mutex<Vec<(String, bool)>>,
}

impl CollectingOutput {
    pub fn status_texts(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }

    pub fn stream_texts(&self) -> Vec<String> {
        self.streamed.lock().iter().map(|(text, _)| text.clone()).collect()
    }
}

#[async_trait]
impl ChatOutput for CollectingOutput {
    async fn status(&self, text: &str) {
        self.statuses.lock().push(text.to_string());
    }

    async fn stream(&self, text: &str, is_final: bool) {
        self.streamed.lock().push((text.to_string(), is_final));
    }
}

/// Write an executable `sh` script and return its path.
pub fn write_script(dir: &std::path::Path, body: &str) -> anyhow::Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake_codex.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}"))?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path)
}
