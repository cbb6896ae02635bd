// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user run lifecycle for one bot: at-most-one-active enforcement,
//! FIFO prompt queueing, run classification and persistence, and the
//! between-runs reconciliation against the rollout stream.

use std::collections::HashMap;
use std::future::Future;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::StreamBroker;
use crate::chat::ChatOutput;
use crate::config::RuntimeConfig;
use crate::driver::{RunSink, Runner, StatusToken};
use crate::hash::{dedupe_hash, dedupe_hash_nonempty};
use crate::rollout::{self, RolloutRecord};
use crate::session::{now_ts, Run, RunStatus, SessionManager, SessionState};
use crate::store::Store;

/// An installed per-user run: the task plus its cancellation handle.
struct RunHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Open-file cursor for one `bot:resume` rollout stream. Reset to
/// defaults whenever the backing file goes stale.
#[derive(Default)]
struct SyncCursor {
    path: PathBuf,
    inode: u64,
    offset: u64,
}

pub struct Orchestrator {
    config: Arc<RuntimeConfig>,
    sessions: Arc<SessionManager>,
    store: Arc<Store>,
    runner: Arc<dyn Runner>,
    bot_id: String,
    active: Mutex<HashMap<i64, RunHandle>>,
    sync_cursors: Mutex<HashMap<String, SyncCursor>>,
}

/// Driver-facing sink for one run: stream output through the broker,
/// remember the last status token and the recovered final message.
struct RunBridge {
    config: Arc<RuntimeConfig>,
    broker: Arc<StreamBroker>,
    status: parking_lot::Mutex<Option<StatusToken>>,
    final_message: parking_lot::Mutex<Option<String>>,
}

#[async_trait]
impl RunSink for RunBridge {
    async fn output(&self, text: &str, is_error: bool) {
        if is_error && !self.config.stream_include_stderr {
            debug!("stderr 已隐藏：{text}");
            return;
        }
        self.broker.push(text, is_error).await;
    }

    async fn status(&self, token: StatusToken) {
        *self.status.lock() = Some(token);
    }

    async fn final_message(&self, text: &str) {
        *self.final_message.lock() = Some(text.to_string());
    }
}

impl Orchestrator {
    pub fn new(
        config: Arc<RuntimeConfig>,
        sessions: Arc<SessionManager>,
        store: Arc<Store>,
        runner: Arc<dyn Runner>,
        bot_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            sessions,
            store,
            runner,
            bot_id: bot_id.into(),
            active: Mutex::new(HashMap::new()),
            sync_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch a prompt: start it now, or queue it behind the user's
    /// active run.
    pub async fn submit_prompt(
        self: &Arc<Self>,
        user_id: i64,
        prompt: &str,
        out: Arc<dyn ChatOutput>,
    ) -> anyhow::Result<()> {
        let session = self.sessions.get_or_create(user_id).await?;
        self.store.record_message(&session.session_id, "user", prompt)?;

        let mut active = self.active.lock().await;
        if let Some(handle) = active.get(&user_id) {
            if !handle.task.is_finished() {
                self.sessions.enqueue_prompt(user_id, prompt).await?;
                let queued = self.sessions.peek_queue(user_id).await?;
                out.status(&format!("已收到新指令，当前任务结束后执行。排队中：{queued}")).await;
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_once(
            user_id,
            prompt.to_string(),
            out,
            session.resume_id.clone(),
            cancel.clone(),
        ));
        active.insert(user_id, RunHandle { task, cancel });
        info!("启动任务 user_id={user_id} bot_id={}", self.bot_id);
        Ok(())
    }

    /// Request cancellation of the user's active run, if any.
    pub async fn cancel_run(&self, user_id: i64, out: &dyn ChatOutput) {
        let active = self.active.lock().await;
        match active.get(&user_id) {
            Some(handle) if !handle.task.is_finished() => {
                handle.cancel.cancel();
                out.status("已请求停止当前任务。").await;
                info!("取消任务 user_id={user_id}");
            }
            _ => out.status("当前没有运行中的任务。").await,
        }
    }

    pub async fn status(&self, user_id: i64, out: &dyn ChatOutput) -> anyhow::Result<()> {
        let session = self.sessions.get_or_create(user_id).await?;
        let queued = self.sessions.peek_queue(user_id).await?;
        let resume_text = session.resume_id.unwrap_or_else(|| "未设置".to_string());
        out.status(&format!(
            "会话状态：{}，排队指令：{queued}，resume_id：{resume_text}",
            session.state
        ))
        .await;
        Ok(())
    }

    pub async fn is_running(&self, user_id: i64) -> anyhow::Result<bool> {
        let session = self.sessions.get_or_create(user_id).await?;
        Ok(session.state == SessionState::Running)
    }

    /// The session's resume id, falling back to the bot's configured one.
    pub async fn get_resume_id(&self, user_id: i64) -> anyhow::Result<Option<String>> {
        let session = self.sessions.get_or_create(user_id).await?;
        Ok(session.resume_id.or_else(|| self.config.codex_cli_resume_id.clone()))
    }

    pub async fn set_chat_id(&self, user_id: i64, chat_id: i64) -> anyhow::Result<()> {
        self.sessions.set_chat_id(user_id, chat_id).await?;
        Ok(())
    }

    pub fn get_last_chat_id(&self, user_id: i64) -> Option<i64> {
        self.store.get_last_chat_id_by_user_id(user_id, &self.bot_id).unwrap_or_default()
    }

    /// Session binding is intentionally read-only.
    pub async fn set_resume_id(&self, user_id: i64, out: &dyn ChatOutput) {
        info!("会话绑定已禁用 user_id={user_id}");
        out.status("会话绑定已禁用，当前仅支持查看状态。").await;
    }

    /// Deliver the most recent result: session state first, then the
    /// store, then the rollout stream.
    pub async fn last_result(&self, user_id: i64, out: &dyn ChatOutput) -> anyhow::Result<()> {
        let session = self.sessions.get_or_create(user_id).await?;
        let mut result = session.last_result.clone();
        if result.is_none() {
            result = self.store.get_last_result_by_user_id(user_id, &self.bot_id)?;
            if let Some(found) = &result {
                self.sessions.set_last_result(user_id, Some(found.clone())).await?;
            }
        }
        if result.is_none() {
            let resume_id =
                session.resume_id.clone().or_else(|| self.config.codex_cli_resume_id.clone());
            if let Some(resume_id) = resume_id {
                result = rollout::last_assistant_message(&rollout::codex_home(), &resume_id);
                if let Some(found) = &result {
                    self.sessions.set_last_result(user_id, Some(found.clone())).await?;
                }
            }
        }
        match result {
            Some(found) => out.stream(&found, true).await,
            None => out.status("暂无可用结果。").await,
        }
        Ok(())
    }

    pub async fn retry_last(
        self: &Arc<Self>,
        user_id: i64,
        last_prompt: Option<&str>,
        out: Arc<dyn ChatOutput>,
    ) -> anyhow::Result<()> {
        let Some(prompt) = last_prompt else {
            out.status("没有可重试的指令。").await;
            return Ok(());
        };
        self.submit_prompt(user_id, prompt, out).await
    }

    /// One run from dispatch to terminal state. Boxed so the post-run
    /// queue drain can resubmit through `submit_prompt`.
    fn run_once(
        self: Arc<Self>,
        user_id: i64,
        prompt: String,
        out: Arc<dyn ChatOutput>,
        resume_id: Option<String>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Err(e) = self.run_once_inner(user_id, &prompt, out, resume_id, cancel).await {
                warn!("任务执行失败 user_id={user_id}: {e:#}");
            }
        })
    }

    async fn run_once_inner(
        self: &Arc<Self>,
        user_id: i64,
        prompt: &str,
        out: Arc<dyn ChatOutput>,
        resume_id: Option<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let session = self.sessions.set_state(user_id, SessionState::Running).await?;
        let mut run = Run::new(&session.session_id, prompt);
        self.store.record_run(&run)?;
        self.sessions.set_current_run(user_id, Some(run.run_id.clone())).await?;
        info!("任务开始 run_id={} user_id={user_id} bot_id={}", run.run_id, self.bot_id);

        out.status("已开始执行。").await;
        let broker = Arc::new(StreamBroker::new(
            out.clone(),
            self.config.stream_flush_interval,
            self.config.message_chunk_limit,
        ));
        broker.start();
        let bridge = Arc::new(RunBridge {
            config: self.config.clone(),
            broker: broker.clone(),
            status: parking_lot::Mutex::new(None),
            final_message: parking_lot::Mutex::new(None),
        });

        let result = self
            .runner
            .run(prompt, resume_id.as_deref(), bridge.clone(), cancel)
            .await;

        let status_token = *bridge.status.lock();
        match result {
            Ok(return_code) => match status_token {
                Some(StatusToken::Timeout) => {
                    run.status = RunStatus::Timeout;
                    run.error = Some("运行超时".to_string());
                }
                Some(StatusToken::Canceled) => {
                    run.status = RunStatus::Canceled;
                    run.error = Some("任务被取消".to_string());
                }
                None if return_code != 0 => {
                    run.status = RunStatus::Error;
                    run.error = Some(format!("退出码 {return_code}"));
                }
                None => run.status = RunStatus::Done,
            },
            Err(e) => {
                run.status = RunStatus::Error;
                run.error = Some(format!("{e:#}"));
            }
        }

        run.finished_at = Some(now_ts());
        broker.stop().await;
        self.store.update_run(&run.run_id, run.status, run.finished_at, run.error.as_deref())?;
        let final_message = bridge.final_message.lock().clone();
        if let Some(message) = final_message {
            self.sessions.set_last_result(user_id, Some(message)).await?;
        }
        self.sessions.set_current_run(user_id, None).await?;
        self.sessions.set_state(user_id, SessionState::Idle).await?;
        info!("任务结束 run_id={} status={} bot_id={}", run.run_id, run.status, self.bot_id);
        out.status(&format_run_summary(&run)).await;
        self.post_run_cleanup(user_id, out).await
    }

    /// Release the active slot, then drain the queue or go quiet.
    async fn post_run_cleanup(
        self: &Arc<Self>,
        user_id: i64,
        out: Arc<dyn ChatOutput>,
    ) -> anyhow::Result<()> {
        self.active.lock().await.remove(&user_id);
        match self.sessions.dequeue_prompt(user_id).await? {
            Some(prompt) => self.submit_prompt(user_id, &prompt, out).await,
            None => {
                out.status("等待新指令。").await;
                Ok(())
            }
        }
    }

    /// Background reconciliation between runs: read newly appended
    /// assistant messages from the rollout stream, dedup against the
    /// session's last result and the stored cursor hash, and return the
    /// survivors for delivery.
    pub async fn poll_external_results(
        &self,
        user_id: i64,
        allow_send: bool,
    ) -> anyhow::Result<Vec<String>> {
        let Some(resume_id) = self.get_resume_id(user_id).await? else {
            return Ok(Vec::new());
        };
        let session = self.sessions.get_or_create(user_id).await?;
        let last_result_hash =
            session.last_result.as_deref().and_then(dedupe_hash_nonempty);
        let (mut last_ts, mut last_hash) =
            self.store.get_jsonl_state_by_user_id(user_id, &self.bot_id)?;
        let Some(path) = rollout::find_session_file(&rollout::codex_home(), &resume_id) else {
            return Ok(Vec::new());
        };

        let mut cursors = self.sync_cursors.lock().await;
        let cursor = cursors.entry(format!("{}:{resume_id}", self.bot_id)).or_default();
        if cursor.path != path {
            *cursor = SyncCursor::default();
        }
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                *cursor = SyncCursor::default();
                return Ok(Vec::new());
            }
        };
        if cursor.inode != 0 && meta.ino() != cursor.inode {
            *cursor = SyncCursor::default();
            return Ok(Vec::new());
        }
        if meta.len() < cursor.offset {
            *cursor = SyncCursor::default();
            return Ok(Vec::new());
        }

        // First poll after chat binding: record a baseline instead of
        // replaying the historical backlog.
        if last_ts.is_none() && last_hash.is_none() {
            self.sessions.set_jsonl_state(user_id, Some(now_ts()), None).await?;
            return Ok(Vec::new());
        }

        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(_) => {
                *cursor = SyncCursor::default();
                return Ok(Vec::new());
            }
        };
        if cursor.inode == 0 {
            cursor.path = path.clone();
            cursor.inode = meta.ino();
        }
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(cursor.offset))?;

        let mut messages = Vec::new();
        let mut updated = false;
        let mut raw = Vec::new();
        loop {
            raw.clear();
            let read = reader.read_until(b'\n', &mut raw)?;
            if read == 0 {
                break;
            }
            cursor.offset += read as u64;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(record) = RolloutRecord::parse(line) else {
                continue;
            };
            let Some(text) = rollout::assistant_message_text(&record) else {
                continue;
            };
            let Some(timestamp) = record.timestamp_secs() else {
                continue;
            };
            if last_ts.is_some_and(|ts| timestamp < ts) {
                continue;
            }
            let digest = dedupe_hash(&text);
            let max_ts = Some(last_ts.map_or(timestamp, |ts| ts.max(timestamp)));
            if last_result_hash.as_deref() == Some(digest.as_str()) {
                // Already delivered inline by the run that produced it.
                last_ts = max_ts;
                last_hash = Some(digest);
                updated = true;
                continue;
            }
            if last_hash.as_deref() == Some(digest.as_str()) {
                last_ts = max_ts;
                updated = true;
                continue;
            }
            if allow_send {
                messages.push(text.clone());
                self.sessions.set_last_result(user_id, Some(text)).await?;
            }
            last_ts = max_ts;
            last_hash = Some(digest);
            updated = true;
        }

        if updated {
            self.sessions.set_jsonl_state(user_id, last_ts, last_hash).await?;
        }
        Ok(messages)
    }
}

fn format_run_summary(run: &Run) -> String {
    match run.status {
        RunStatus::Done => "运行完成。".to_string(),
        RunStatus::Canceled => "运行已取消。".to_string(),
        RunStatus::Timeout => "运行超时。".to_string(),
        RunStatus::Error => {
            let detail = run.error.as_deref().unwrap_or("未知错误");
            format!("运行失败：{detail}")
        }
        RunStatus::Running => "运行结束。".to_string(),
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
