// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telegram binding: command routing, allow-list authorization,
//! per-user send dedup, and the periodic rollout-sync tick. All chat
//! traffic goes through the [`ChatApi`] seam so the adapter logic is
//! transport-free.

pub mod dedupe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::chat::{ChatApi, ChatOutput, StreamSender};
use crate::commands::{parse_command, CommandType};
use crate::config::RuntimeConfig;
use crate::orchestrator::Orchestrator;

use dedupe::DedupWindow;

const HELP_TEXT: &str = "可用命令：\n\
/new <内容> 提交新指令\n\
/session 查看当前会话绑定（只读）\n\
/stop 停止当前任务\n\
/status 查看状态\n\
/retry 重试上一次指令\n\
/lastresult 查看最近一次结果\n\
/whoami 查看用户 ID\n\
/help 查看帮助";

#[derive(Default)]
struct UserContext {
    last_prompt: Option<String>,
    chat_id: Option<i64>,
    stream_buffer: String,
    dedupe: DedupWindow,
}

pub struct TelegramAdapter {
    config: Arc<RuntimeConfig>,
    orchestrator: Arc<Orchestrator>,
    users: Mutex<HashMap<i64, UserContext>>,
}

/// [`ChatApi`] over a live teloxide bot.
pub struct TelegramChat {
    bot: Bot,
}

impl TelegramChat {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatApi for TelegramChat {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<i32> {
        let message = self.bot.send_message(ChatId(chat_id), text).await?;
        Ok(message.id.0)
    }

    async fn edit_message(&self, chat_id: i64, message_id: i32, text: &str) -> anyhow::Result<()> {
        self.bot.edit_message_text(ChatId(chat_id), MessageId(message_id), text).await?;
        Ok(())
    }
}

/// Per-interaction [`ChatOutput`]: statuses are standalone messages,
/// streamed chunks go through one [`StreamSender`]. When `tracked`, the
/// streamed text accumulates in the user's context and its digest is
/// recorded on the final flush.
struct StreamOutput {
    adapter: Arc<TelegramAdapter>,
    api: Arc<dyn ChatApi>,
    chat_id: i64,
    user_id: i64,
    tracked: bool,
    sender: Mutex<StreamSender>,
}

#[async_trait]
impl ChatOutput for StreamOutput {
    async fn status(&self, text: &str) {
        if let Err(e) = self.api.send_message(self.chat_id, text).await {
            warn!("发送状态消息失败 user_id={}: {e:#}", self.user_id);
        }
    }

    async fn stream(&self, text: &str, is_final: bool) {
        if self.tracked && !text.is_empty() {
            self.adapter.append_stream_buffer(self.user_id, text).await;
        }
        if let Err(e) = self.sender.lock().await.send(text, is_final).await {
            warn!("发送流式消息失败 user_id={}: {e:#}", self.user_id);
        }
        if self.tracked && is_final {
            self.adapter.record_stream_digest(self.user_id).await;
        }
    }
}

impl TelegramAdapter {
    pub fn new(config: Arc<RuntimeConfig>, orchestrator: Arc<Orchestrator>) -> Self {
        Self { config, orchestrator, users: Mutex::new(HashMap::new()) }
    }

    /// Long-polling entry point; also starts the rollout-sync tick.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let bot = Bot::new(self.config.telegram_bot_token.clone());
        let api: Arc<dyn ChatApi> = Arc::new(TelegramChat::new(bot.clone()));
        self.clone().spawn_sync_loop(api.clone());

        info!("Telegram 适配器启动，进入 polling");
        let handler = Update::filter_message().endpoint(on_message);
        Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![self.clone(), api])
            .build()
            .dispatch()
            .await;
        Ok(())
    }

    fn spawn_sync_loop(self: Arc<Self>, api: Arc<dyn ChatApi>) {
        if self.config.jsonl_sync_interval_seconds <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(self.config.jsonl_sync_interval_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            loop {
                self.sync_tick(&api).await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Handle one inbound text message.
    pub async fn handle_text(
        self: &Arc<Self>,
        api: &Arc<dyn ChatApi>,
        user_id: i64,
        chat_id: i64,
        text: &str,
    ) {
        if !self.authorize(api, user_id, chat_id).await {
            return;
        }
        let Some(command) = parse_command(text) else {
            self.submit(api, user_id, chat_id, text.to_string()).await;
            return;
        };
        match command.kind {
            CommandType::Help => {
                self.send_plain(api, chat_id, HELP_TEXT).await;
            }
            CommandType::Whoami => {
                self.send_plain(api, chat_id, &format!("user_id={user_id}, chat_id={chat_id}"))
                    .await;
            }
            CommandType::Session => {
                if command.payload.is_some() {
                    self.send_plain(api, chat_id, "会话绑定已禁用，当前仅支持查看状态。").await;
                } else {
                    let out = self.output(api, user_id, chat_id, false);
                    if let Err(e) = self.orchestrator.status(user_id, out.as_ref()).await {
                        warn!("查询状态失败 user_id={user_id}: {e:#}");
                    }
                }
            }
            CommandType::Stop => {
                let out = self.output(api, user_id, chat_id, false);
                self.orchestrator.cancel_run(user_id, out.as_ref()).await;
            }
            CommandType::Status => {
                let out = self.output(api, user_id, chat_id, false);
                if let Err(e) = self.orchestrator.status(user_id, out.as_ref()).await {
                    warn!("查询状态失败 user_id={user_id}: {e:#}");
                }
            }
            CommandType::Retry => {
                let last_prompt = self.users.lock().await.get(&user_id).and_then(|ctx| ctx.last_prompt.clone());
                let out = self.output(api, user_id, chat_id, false);
                if let Err(e) =
                    self.orchestrator.retry_last(user_id, last_prompt.as_deref(), out).await
                {
                    warn!("重试失败 user_id={user_id}: {e:#}");
                }
            }
            CommandType::New => match command.payload {
                Some(prompt) => self.submit(api, user_id, chat_id, prompt).await,
                None => self.send_plain(api, chat_id, "请提供指令内容。").await,
            },
            CommandType::LastResult => {
                let out = self.output(api, user_id, chat_id, false);
                if let Err(e) = self.orchestrator.last_result(user_id, out.as_ref()).await {
                    warn!("查询结果失败 user_id={user_id}: {e:#}");
                }
            }
        }
    }

    /// Allow-list check; an authorized message re-binds the chat.
    async fn authorize(&self, api: &Arc<dyn ChatApi>, user_id: i64, chat_id: i64) -> bool {
        if self.config.telegram_allowed_user_ids.is_empty() {
            warn!("未配置允许用户列表 user_id={user_id}");
            self.send_plain(api, chat_id, "未配置允许的用户列表，请联系管理员。").await;
            return false;
        }
        if !self.config.telegram_allowed_user_ids.contains(&user_id) {
            warn!("拒绝用户 user_id={user_id}");
            self.send_plain(api, chat_id, "无权限使用此机器人。").await;
            return false;
        }
        self.users.lock().await.entry(user_id).or_default().chat_id = Some(chat_id);
        if let Err(e) = self.orchestrator.set_chat_id(user_id, chat_id).await {
            warn!("记录 chat_id 失败 user_id={user_id}: {e:#}");
        }
        true
    }

    async fn submit(self: &Arc<Self>, api: &Arc<dyn ChatApi>, user_id: i64, chat_id: i64, prompt: String) {
        info!("收到消息 user_id={user_id}");
        {
            let mut users = self.users.lock().await;
            let ctx = users.entry(user_id).or_default();
            ctx.stream_buffer.clear();
            ctx.dedupe.clear();
            ctx.last_prompt = Some(prompt.clone());
            ctx.chat_id = Some(chat_id);
        }
        let out = self.output(api, user_id, chat_id, true);
        if let Err(e) = self.orchestrator.submit_prompt(user_id, &prompt, out).await {
            warn!("提交指令失败 user_id={user_id}: {e:#}");
        }
    }

    /// One periodic reconciliation pass over the known users.
    pub async fn sync_tick(self: &Arc<Self>, api: &Arc<dyn ChatApi>) {
        let user_ids: Vec<i64> = if self.config.telegram_allowed_user_ids.is_empty() {
            self.users.lock().await.keys().copied().collect()
        } else {
            self.config.telegram_allowed_user_ids.iter().copied().collect()
        };

        for user_id in user_ids {
            let chat_id = {
                let mut users = self.users.lock().await;
                let ctx = users.entry(user_id).or_default();
                if ctx.chat_id.is_none() {
                    ctx.chat_id = self.orchestrator.get_last_chat_id(user_id);
                }
                ctx.chat_id
            };
            let Some(chat_id) = chat_id else {
                continue;
            };

            let running = match self.orchestrator.is_running(user_id).await {
                Ok(running) => running,
                Err(e) => {
                    warn!("JSONL 同步失败 user_id={user_id} err={e:#}");
                    continue;
                }
            };
            let messages = match self.orchestrator.poll_external_results(user_id, !running).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("JSONL 同步失败 user_id={user_id} err={e:#}");
                    continue;
                }
            };
            if messages.is_empty() {
                continue;
            }

            let mut sender =
                StreamSender::new(api.clone(), chat_id, self.config.message_chunk_limit);
            for message in messages {
                let should_send =
                    self.users.lock().await.entry(user_id).or_default().dedupe.should_send(&message);
                if !should_send {
                    info!("JSONL 去重：跳过重复结果 user_id={user_id}");
                    continue;
                }
                if let Err(e) = sender.send(&message, true).await {
                    warn!("推送结果失败 user_id={user_id}: {e:#}");
                }
            }
        }
    }

    fn output(
        self: &Arc<Self>,
        api: &Arc<dyn ChatApi>,
        user_id: i64,
        chat_id: i64,
        tracked: bool,
    ) -> Arc<dyn ChatOutput> {
        Arc::new(StreamOutput {
            adapter: self.clone(),
            api: api.clone(),
            chat_id,
            user_id,
            tracked,
            sender: Mutex::new(StreamSender::new(
                api.clone(),
                chat_id,
                self.config.message_chunk_limit,
            )),
        })
    }

    async fn send_plain(&self, api: &Arc<dyn ChatApi>, chat_id: i64, text: &str) {
        if let Err(e) = api.send_message(chat_id, text).await {
            warn!("发送消息失败 chat_id={chat_id}: {e:#}");
        }
    }

    async fn append_stream_buffer(&self, user_id: i64, text: &str) {
        let mut users = self.users.lock().await;
        let ctx = users.entry(user_id).or_default();
        if ctx.stream_buffer.is_empty() {
            ctx.stream_buffer.push_str(text);
        } else {
            ctx.stream_buffer.push('\n');
            ctx.stream_buffer.push_str(text);
        }
    }

    /// Remember the streamed transcript's digest so the poller does not
    /// push the same content again.
    async fn record_stream_digest(&self, user_id: i64) {
        let mut users = self.users.lock().await;
        let ctx = users.entry(user_id).or_default();
        let buffer = ctx.stream_buffer.clone();
        ctx.dedupe.record(&buffer);
    }
}

async fn on_message(
    msg: Message,
    adapter: Arc<TelegramAdapter>,
    api: Arc<dyn ChatApi>,
) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;
    let chat_id = msg.chat.id.0;
    adapter.handle_text(&api, user_id, chat_id, text).await;
    Ok(())
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
