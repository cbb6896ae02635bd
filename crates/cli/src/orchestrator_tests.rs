// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::driver::{RunSink, Runner};
use crate::session::SessionManager;
use crate::store::Store;
use crate::test_support::{runtime_config, CollectingOutput};

use super::Orchestrator;

/// A runner the test controls: records prompts, signals start, blocks
/// until released.
#[derive(Default)]
struct ControlledRunner {
    calls: parking_lot::Mutex<Vec<String>>,
    started: CancellationToken,
    finish: CancellationToken,
    final_message: parking_lot::Mutex<Option<String>>,
}

#[async_trait]
impl Runner for ControlledRunner {
    async fn run(
        &self,
        prompt: &str,
        _resume_id: Option<&str>,
        sink: Arc<dyn RunSink>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<i32> {
        self.calls.lock().push(prompt.to_string());
        self.started.cancel();
        sink.output("ok", false).await;
        let final_message = self.final_message.lock().clone();
        if let Some(message) = final_message {
            sink.final_message(&message).await;
        }
        self.finish.cancelled().await;
        Ok(0)
    }
}

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    runner: Arc<ControlledRunner>,
    sessions: Arc<SessionManager>,
    store: Arc<Store>,
}

fn fixture(dir: &std::path::Path, config: RuntimeConfig) -> anyhow::Result<Fixture> {
    let store = Arc::new(Store::open(&dir.join("test.db"))?);
    store.init()?;
    let sessions = Arc::new(SessionManager::new(store.clone(), "default"));
    let runner = Arc::new(ControlledRunner::default());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(config),
        sessions.clone(),
        store.clone(),
        runner.clone(),
        "default",
    ));
    Ok(Fixture { orchestrator, runner, sessions, store })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn queued_prompt_runs_after_the_active_one() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.submit_prompt(1, "first", out.clone()).await?;
    fx.runner.started.cancelled().await;
    fx.orchestrator.submit_prompt(1, "second", out.clone()).await?;

    assert_eq!(fx.sessions.peek_queue(1).await?, 1);
    let statuses = out.status_texts();
    assert!(statuses.iter().any(|s| s.contains("排队中：1")));

    fx.runner.finish.cancel();
    settle().await;

    assert_eq!(*fx.runner.calls.lock(), vec!["first".to_string(), "second".to_string()]);
    let statuses = out.status_texts();
    assert!(statuses.iter().any(|s| s.contains("运行完成")));
    assert!(statuses.iter().any(|s| s.contains("等待新指令")));
    Ok(())
}

#[tokio::test]
async fn set_resume_id_is_disabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.set_resume_id(1, out.as_ref()).await;
    let session = fx.sessions.get_or_create(1).await?;
    assert_eq!(session.resume_id, None);
    assert!(out.status_texts().iter().any(|s| s.contains("禁用")));
    Ok(())
}

#[tokio::test]
async fn last_result_returns_the_final_message() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;
    *fx.runner.final_message.lock() = Some("final answer".to_string());
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.submit_prompt(1, "first", out.clone()).await?;
    fx.runner.started.cancelled().await;
    fx.runner.finish.cancel();
    settle().await;

    let out = Arc::new(CollectingOutput::default());
    fx.orchestrator.last_result(1, out.as_ref()).await?;
    assert!(out.stream_texts().contains(&"final answer".to_string()));
    Ok(())
}

#[tokio::test]
async fn last_result_falls_back_to_the_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;

    let previous = crate::session::Session::new(1, "default");
    fx.store.record_session(&previous)?;
    fx.store.update_session_last_result(&previous.session_id, Some("stored result"))?;

    let out = Arc::new(CollectingOutput::default());
    fx.orchestrator.last_result(1, out.as_ref()).await?;
    assert!(out.stream_texts().contains(&"stored result".to_string()));
    Ok(())
}

#[tokio::test]
async fn cancel_without_an_active_run_reports_idle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.cancel_run(1, out.as_ref()).await;
    assert!(out.status_texts().iter().any(|s| s.contains("当前没有运行中的任务")));
    Ok(())
}

#[tokio::test]
async fn retry_without_history_reports_nothing_to_do() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fx = fixture(dir.path(), runtime_config())?;
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.retry_last(1, None, out.clone()).await?;
    assert!(out.status_texts().iter().any(|s| s.contains("没有可重试的指令")));
    assert!(fx.runner.calls.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn status_reports_state_queue_and_resume_id() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = runtime_config();
    config.codex_cli_resume_id = None;
    let fx = fixture(dir.path(), config)?;
    let out = Arc::new(CollectingOutput::default());

    fx.orchestrator.status(1, out.as_ref()).await?;
    let statuses = out.status_texts();
    assert!(statuses.iter().any(|s| s.contains("会话状态：idle") && s.contains("未设置")));
    Ok(())
}

fn write_rollout_line(
    path: &std::path::Path,
    timestamp: &str,
    text: &str,
) -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        r#"{{"timestamp":"{timestamp}","type":"response_item","payload":{{"type":"message","role":"assistant","content":[{{"type":"output_text","text":"{text}"}}]}}}}"#
    )?;
    Ok(())
}

#[tokio::test]
#[serial_test::serial]
async fn external_results_dedupe_against_the_last_result() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    std::fs::create_dir_all(home.path().join("sessions"))?;
    std::env::set_var("CODEX_HOME", home.path());

    let mut config = runtime_config();
    config.codex_cli_resume_id = Some("resume-sync".to_string());
    let fx = fixture(dir.path(), config)?;

    let session_file = home.path().join("sessions").join("rollout-1-resume-sync.jsonl");
    write_rollout_line(&session_file, "2026-01-01T00:00:01Z", "same result")?;

    fx.sessions.set_last_result(1, Some("same result".to_string())).await?;
    fx.sessions.set_jsonl_state(1, Some(0.0), None).await?;

    let result = fx.orchestrator.poll_external_results(1, true).await;
    std::env::remove_var("CODEX_HOME");

    assert!(result?.is_empty());
    let (last_ts, last_hash) = fx.store.get_jsonl_state_by_user_id(1, "default")?;
    assert!(last_ts.is_some());
    assert!(last_hash.is_some());
    Ok(())
}

#[tokio::test]
#[serial_test::serial]
async fn first_poll_after_binding_suppresses_history() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    std::fs::create_dir_all(home.path().join("sessions"))?;
    std::env::set_var("CODEX_HOME", home.path());

    let mut config = runtime_config();
    config.codex_cli_resume_id = Some("resume-base".to_string());
    let fx = fixture(dir.path(), config)?;

    let session_file = home.path().join("sessions").join("rollout-1-resume-base.jsonl");
    write_rollout_line(&session_file, "2020-01-01T00:00:00Z", "ancient history")?;

    // Neither cursor field set: the first poll records a baseline only.
    let first = fx.orchestrator.poll_external_results(1, true).await?;
    assert!(first.is_empty());
    let session = fx.sessions.get_or_create(1).await?;
    assert!(session.jsonl_last_ts.is_some());

    // A record newer than the baseline is delivered.
    let future = (chrono::Utc::now() + chrono::Duration::seconds(5))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    write_rollout_line(&session_file, &future, "fresh news")?;
    let second = fx.orchestrator.poll_external_results(1, true).await;
    std::env::remove_var("CODEX_HOME");

    assert_eq!(second?, vec!["fresh news".to_string()]);
    let session = fx.sessions.get_or_create(1).await?;
    assert_eq!(session.last_result.as_deref(), Some("fresh news"));
    Ok(())
}

#[tokio::test]
#[serial_test::serial]
async fn poll_without_send_advances_the_cursor_silently() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let home = tempfile::tempdir()?;
    std::fs::create_dir_all(home.path().join("sessions"))?;
    std::env::set_var("CODEX_HOME", home.path());

    let mut config = runtime_config();
    config.codex_cli_resume_id = Some("resume-mute".to_string());
    let fx = fixture(dir.path(), config)?;

    let session_file = home.path().join("sessions").join("rollout-1-resume-mute.jsonl");
    write_rollout_line(&session_file, "2026-01-01T00:00:01Z", "streamed inline")?;
    fx.sessions.set_jsonl_state(1, Some(0.0), None).await?;

    let result = fx.orchestrator.poll_external_results(1, false).await;
    std::env::remove_var("CODEX_HOME");

    assert!(result?.is_empty());
    let session = fx.sessions.get_or_create(1).await?;
    // The message was not delivered and is not the last result, but the
    // cursor moved past it.
    assert_eq!(session.last_result, None);
    assert!(session.jsonl_last_hash.is_some());
    Ok(())
}
