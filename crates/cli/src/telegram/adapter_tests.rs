// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::chat::ChatApi;
use crate::config::RuntimeConfig;
use crate::driver::{RunSink, Runner};
use crate::orchestrator::Orchestrator;
use crate::session::SessionManager;
use crate::store::Store;
use crate::test_support::runtime_config;

use super::TelegramAdapter;

#[derive(Default)]
struct FakeApi {
    sent: parking_lot::Mutex<Vec<(i64, String)>>,
    next_id: parking_lot::Mutex<i32>,
}

impl FakeApi {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, text)| text.clone()).collect()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<i32> {
        let mut next = self.next_id.lock();
        *next += 1;
        self.sent.lock().push((chat_id, text.to_string()));
        Ok(*next)
    }

    async fn edit_message(&self, _chat_id: i64, _message_id: i32, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Completes immediately with a single line of output.
#[derive(Default)]
struct InstantRunner {
    calls: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl Runner for InstantRunner {
    async fn run(
        &self,
        prompt: &str,
        _resume_id: Option<&str>,
        sink: Arc<dyn RunSink>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<i32> {
        self.calls.lock().push(prompt.to_string());
        sink.output("ok", false).await;
        Ok(0)
    }
}

struct Fixture {
    adapter: Arc<TelegramAdapter>,
    api: Arc<dyn ChatApi>,
    fake: Arc<FakeApi>,
    runner: Arc<InstantRunner>,
}

fn fixture(dir: &std::path::Path, config: RuntimeConfig) -> anyhow::Result<Fixture> {
    let config = Arc::new(config);
    let store = Arc::new(Store::open(&dir.join("test.db"))?);
    store.init()?;
    let sessions = Arc::new(SessionManager::new(store.clone(), "default"));
    let runner = Arc::new(InstantRunner::default());
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        sessions,
        store,
        runner.clone(),
        "default",
    ));
    let adapter = Arc::new(TelegramAdapter::new(config, orchestrator));
    let fake = Arc::new(FakeApi::default());
    let api: Arc<dyn ChatApi> = fake.clone();
    Ok(Fixture { adapter, api, fake, runner })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn unknown_users_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 999, 42, "/status").await;
    let texts = fx.fake.texts();
    assert_eq!(texts, vec!["无权限使用此机器人。".to_string()]);
    Ok(())
}

#[tokio::test]
async fn empty_allow_list_rejects_everyone() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = runtime_config();
    config.telegram_allowed_user_ids.clear();
    let fx = fixture(dir.path(), config)?;

    fx.adapter.handle_text(&fx.api, 1, 42, "hello").await;
    assert!(fx.fake.texts().iter().any(|t| t.contains("未配置允许的用户列表")));
    assert!(fx.runner.calls.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn help_and_whoami_respond() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 1, 42, "/help").await;
    fx.adapter.handle_text(&fx.api, 1, 42, "/whoami").await;
    let texts = fx.fake.texts();
    assert!(texts.iter().any(|t| t.contains("可用命令")));
    assert!(texts.iter().any(|t| t.contains("user_id=1, chat_id=42")));
    Ok(())
}

#[tokio::test]
async fn plain_text_submits_a_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 1, 42, "build the thing").await;
    settle().await;

    assert_eq!(*fx.runner.calls.lock(), vec!["build the thing".to_string()]);
    let texts = fx.fake.texts();
    assert!(texts.iter().any(|t| t.contains("已开始执行")));
    assert!(texts.iter().any(|t| t.contains("运行完成")));
    Ok(())
}

#[tokio::test]
async fn retry_resubmits_the_last_prompt() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 1, 42, "/new do it").await;
    settle().await;
    fx.adapter.handle_text(&fx.api, 1, 42, "/retry").await;
    settle().await;

    assert_eq!(*fx.runner.calls.lock(), vec!["do it".to_string(), "do it".to_string()]);
    Ok(())
}

#[tokio::test]
async fn new_without_payload_asks_for_content() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 1, 42, "/new").await;
    assert!(fx.fake.texts().iter().any(|t| t.contains("请提供指令内容")));
    assert!(fx.runner.calls.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn session_with_payload_reports_binding_disabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    fx.adapter.handle_text(&fx.api, 1, 42, "/session resume-new").await;
    assert!(fx.fake.texts().iter().any(|t| t.contains("会话绑定已禁用")));
    Ok(())
}

#[tokio::test]
async fn sync_tick_without_bound_chats_sends_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = runtime_config();
    config.codex_cli_resume_id = Some("resume-none".to_string());
    let fx = fixture(dir.path(), config)?;

    fx.adapter.sync_tick(&fx.api).await;
    assert!(fx.fake.texts().is_empty());
    Ok(())
}
