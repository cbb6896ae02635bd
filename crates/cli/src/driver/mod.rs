// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child-process driver for the Codex CLI: argument/environment
//! construction, pipe and PTY execution channels with identical
//! ingestion semantics, idle watchdogs, rollout tailing, and
//! final-message recovery.

pub mod pipe;
pub mod pty;
pub mod watch;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{InputMode, RuntimeConfig};
use crate::hash::dedupe_hash;
use crate::rollout::{self, EventTailer};
use crate::session::now_ts;

/// Out-of-band classification reported by the driver while a run is in
/// flight; the orchestrator turns the last token into the run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusToken {
    Timeout,
    Canceled,
}

/// Callbacks wired into one run.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// A line of child output (or a driver notice). `is_error` marks
    /// stderr lines.
    async fn output(&self, text: &str, is_error: bool);

    /// A status token overriding the exit-code classification.
    async fn status(&self, token: StatusToken);

    /// The recovered final message, reported once after the child is
    /// drained.
    async fn final_message(&self, text: &str);
}

/// The seam the orchestrator drives; the production implementation is
/// [`CodexDriver`].
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        resume_id: Option<&str>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> anyhow::Result<i32>;
}

pub struct CodexDriver {
    config: Arc<RuntimeConfig>,
}

impl CodexDriver {
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Runner for CodexDriver {
    async fn run(
        &self,
        prompt: &str,
        resume_id: Option<&str>,
        sink: Arc<dyn RunSink>,
        cancel: CancellationToken,
    ) -> anyhow::Result<i32> {
        // Reserved per run; the guard removes the file on every exit path.
        let last_message_file = tempfile::Builder::new()
            .prefix("codex-last-message-")
            .suffix(".txt")
            .tempfile()
            .ok();
        let last_message_path = last_message_file.as_ref().map(|f| f.path().to_path_buf());

        let (args, use_exec) =
            build_args(&self.config, prompt, resume_id, last_message_path.as_deref());
        let active_resume_id =
            resume_id.map(str::to_string).or_else(|| self.config.codex_cli_resume_id.clone());

        let shared = Arc::new(RunShared::new(
            self.config.clone(),
            sink,
            last_message_path,
            active_resume_id,
        ));

        if self.config.codex_cli_use_pty && !use_exec {
            pty::execute(&self.config, &args, prompt, shared, cancel).await
        } else {
            pipe::execute(&self.config, &args, prompt, shared, cancel).await
        }
    }
}

pub(crate) fn is_context_compacted(text: &str) -> bool {
    text.to_lowercase().contains("context compacted")
}

/// Build the child argv. Returns the argument vector and whether the
/// one-shot `exec … resume <id>` framing is in use.
pub(crate) fn build_args(
    config: &RuntimeConfig,
    prompt: &str,
    resume_id: Option<&str>,
    output_last_message: Option<&Path>,
) -> (Vec<String>, bool) {
    let mut args = vec![config.codex_cli_cmd.clone()];
    let active_resume_id =
        resume_id.map(str::to_string).or_else(|| config.codex_cli_resume_id.clone());

    if let Some(resume) = active_resume_id {
        args.push("exec".to_string());
        if config.codex_cli_skip_git_check {
            args.push("--skip-git-repo-check".to_string());
        }
        if let Some(path) = output_last_message {
            args.push("--output-last-message".to_string());
            args.push(path.display().to_string());
        }
        args.extend(config.codex_cli_args.iter().cloned());
        args.push("resume".to_string());
        args.push(resume);
        if config.codex_cli_input_mode == InputMode::Arg {
            if config.codex_cli_approvals_mode.is_some() {
                warn!("arg 模式无法注入 /approvals 指令，已跳过");
            }
            args.push(prompt.to_string());
        } else {
            args.push("-".to_string());
        }
        return (args, true);
    }

    if let Some(path) = output_last_message {
        args.push("--output-last-message".to_string());
        args.push(path.display().to_string());
    }
    args.extend(config.codex_cli_args.iter().cloned());
    if config.codex_cli_input_mode == InputMode::Arg {
        if config.codex_cli_approvals_mode.is_some() {
            warn!("arg 模式无法注入 /approvals 指令，已跳过");
        }
        args.push(prompt.to_string());
    }
    (args, false)
}

/// Stdin payload: the optional `/approvals <N>` prefix, then the prompt.
pub(crate) fn build_input(config: &RuntimeConfig, prompt: &str) -> String {
    match &config.codex_cli_approvals_mode {
        Some(mode) => format!("/approvals {mode}\n{prompt}\n"),
        None => format!("{prompt}\n"),
    }
}

/// Environment defaults layered over the inherited environment:
/// terminal behavior for interactive children and the session bus when
/// its socket exists. Existing variables always win.
pub(crate) fn env_defaults() -> Vec<(String, String)> {
    let mut defaults = Vec::new();
    if std::env::var_os("PROMPT_TOOLKIT_NO_CPR").is_none() {
        defaults.push(("PROMPT_TOOLKIT_NO_CPR".to_string(), "1".to_string()));
    }
    if std::env::var_os("TERM").is_none() {
        defaults.push(("TERM".to_string(), "xterm-256color".to_string()));
    }
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("/run/user/{}", nix::unistd::getuid().as_raw()));
    if std::env::var_os("XDG_RUNTIME_DIR").is_none() {
        defaults.push(("XDG_RUNTIME_DIR".to_string(), runtime_dir.clone()));
    }
    let bus_path = Path::new(&runtime_dir).join("bus");
    if bus_path.exists() && std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_none() {
        defaults.push((
            "DBUS_SESSION_BUS_ADDRESS".to_string(),
            format!("unix:path={}", bus_path.display()),
        ));
    }
    defaults
}

pub(crate) fn apply_env(command: &mut tokio::process::Command) {
    for (key, value) in env_defaults() {
        command.env(key, value);
    }
}

/// State shared by the workers of one run.
pub(crate) struct RunShared {
    pub(crate) config: Arc<RuntimeConfig>,
    pub(crate) sink: Arc<dyn RunSink>,
    pub(crate) last_message_path: Option<PathBuf>,
    pub(crate) resume_id: Option<String>,
    pub(crate) run_started_at: f64,
    /// Signals every worker that the run is over.
    pub(crate) finished: CancellationToken,
    last_output_at: parking_lot::Mutex<Instant>,
    context_compacted: AtomicBool,
    forced_done: AtomicBool,
    fallback_attempted: AtomicBool,
    last_message_sent: parking_lot::Mutex<Option<String>>,
    sent_hashes: parking_lot::Mutex<HashSet<String>>,
    child_pid: AtomicU32,
}

impl RunShared {
    fn new(
        config: Arc<RuntimeConfig>,
        sink: Arc<dyn RunSink>,
        last_message_path: Option<PathBuf>,
        resume_id: Option<String>,
    ) -> Self {
        Self {
            config,
            sink,
            last_message_path,
            resume_id,
            run_started_at: now_ts(),
            finished: CancellationToken::new(),
            last_output_at: parking_lot::Mutex::new(Instant::now()),
            context_compacted: AtomicBool::new(false),
            forced_done: AtomicBool::new(false),
            fallback_attempted: AtomicBool::new(false),
            last_message_sent: parking_lot::Mutex::new(None),
            sent_hashes: parking_lot::Mutex::new(HashSet::new()),
            child_pid: AtomicU32::new(0),
        }
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.child_pid.store(pid, Ordering::Release);
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child_pid.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.last_output_at.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_output_at.lock().elapsed()
    }

    pub(crate) fn mark_compacted(&self) {
        self.context_compacted.store(true, Ordering::Release);
    }

    pub(crate) fn compacted(&self) -> bool {
        self.context_compacted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_forced_done(&self) {
        self.forced_done.store(true, Ordering::Release);
    }

    pub(crate) fn forced_done(&self) -> bool {
        self.forced_done.load(Ordering::Acquire)
    }

    /// Dedup-filtered emission; duplicate non-error texts are dropped
    /// for the lifetime of the run.
    pub(crate) async fn emit(&self, text: &str, is_error: bool) {
        if !is_error && !text.is_empty() {
            let digest = dedupe_hash(text);
            if !self.sent_hashes.lock().insert(digest) {
                return;
            }
        }
        self.sink.output(text, is_error).await;
    }

    /// Ingest one decoded line of child output.
    pub(crate) async fn ingest_line(&self, text: &str, is_error: bool) {
        self.touch();
        if is_context_compacted(text) {
            self.mark_compacted();
        }
        self.emit(text, is_error).await;
    }

    /// Remember and emit a recovered final message unless it was the
    /// last one already delivered this way.
    pub(crate) async fn emit_final_if_new(&self, message: &str) {
        let is_new = {
            let mut last = self.last_message_sent.lock();
            if last.as_deref() == Some(message) {
                false
            } else {
                *last = Some(message.to_string());
                true
            }
        };
        if is_new {
            self.emit(message, false).await;
        }
    }

    pub(crate) fn terminate_child(&self) {
        let pid = self.pid();
        if pid == 0 {
            return;
        }
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }

    /// Contents of the `--output-last-message` capture file, if any.
    pub(crate) fn read_last_message_file(&self) -> Option<String> {
        let path = self.last_message_path.as_deref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let content = content.trim();
        if content.is_empty() {
            return None;
        }
        Some(content.to_string())
    }

    /// One-shot rollout fallback used by the watchdog thresholds.
    pub(crate) fn fallback_last_assistant_message(&self) -> Option<String> {
        let resume_id = self.resume_id.as_deref()?;
        if self.fallback_attempted.swap(true, Ordering::AcqRel) {
            return None;
        }
        rollout::last_assistant_message_after(
            &rollout::codex_home(),
            resume_id,
            self.run_started_at,
        )
    }

    /// End-of-run recovery: capture file first, then the rollout stream
    /// bounded by the run start time.
    pub(crate) fn recover_final_message(&self) -> Option<String> {
        if let Some(message) = self.read_last_message_file() {
            return Some(message);
        }
        let resume_id = self.resume_id.as_deref()?;
        rollout::last_assistant_message_after(
            &rollout::codex_home(),
            resume_id,
            self.run_started_at,
        )
    }
}

/// Spawn the workers common to both execution channels.
pub(crate) fn spawn_common_workers(shared: &Arc<RunShared>) -> Vec<JoinHandle<()>> {
    let mut workers = vec![tokio::spawn(watch::idle_watchdog(shared.clone()))];
    if shared.resume_id.is_some() && shared.config.jsonl_stream_events {
        workers.push(tokio::spawn(tail_worker(shared.clone())));
    }
    if shared.config.progress_tick_interval > 0.0 && !shared.config.jsonl_stream_events {
        workers.push(tokio::spawn(progress_ticker(shared.clone())));
    }
    workers
}

/// Follow the rollout stream for this run, feeding visible texts into
/// the shared ingestion path (they also count as output for the
/// watchdogs).
async fn tail_worker(shared: Arc<RunShared>) {
    let Some(resume_id) = shared.resume_id.clone() else {
        return;
    };
    let tailer = EventTailer::new(
        rollout::codex_home(),
        resume_id,
        shared.config.jsonl_reasoning_mode,
        shared.config.jsonl_reasoning_throttle_seconds,
    );
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let consume = async {
        while let Some(text) = rx.recv().await {
            shared.touch();
            shared.emit(&text, false).await;
        }
    };
    tokio::join!(tailer.run(tx, shared.finished.clone()), consume);
}

/// Periodic "still running" notice, only when event streaming is off.
async fn progress_ticker(shared: Arc<RunShared>) {
    let interval = Duration::from_secs_f64(shared.config.progress_tick_interval.max(0.01));
    loop {
        tokio::select! {
            _ = shared.finished.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.finished.is_cancelled() {
            break;
        }
        let idle_for = shared.idle_for();
        if idle_for >= interval {
            // Bypasses the dedup set: the text varies only by the count.
            shared
                .sink
                .output(&format!("进度：运行中，已等待 {} 秒", idle_for.as_secs()), false)
                .await;
        }
    }
}

/// Drive the child to completion: wall-clock timeout, cancellation,
/// worker drain, and final-message recovery.
pub(crate) async fn supervise(
    mut child: Child,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
) -> anyhow::Result<i32> {
    let run_timeout = Duration::from_secs_f64(shared.config.run_timeout_seconds.max(0.0));
    let mut canceled = false;
    let mut exit_code: Option<i32> = None;

    tokio::select! {
        _ = cancel.cancelled() => {
            shared.sink.status(StatusToken::Canceled).await;
            shared.terminate_child();
            let _ = child.wait().await;
            canceled = true;
            info!("Codex CLI 已取消 pid={}", shared.pid());
        }
        result = tokio::time::timeout(run_timeout, child.wait()) => {
            match result {
                Ok(Ok(status)) => exit_code = status.code(),
                Ok(Err(e)) => warn!("等待子进程失败: {e}"),
                Err(_) => {
                    shared.sink.status(StatusToken::Timeout).await;
                    shared.terminate_child();
                    if let Ok(status) = child.wait().await {
                        exit_code = status.code();
                    }
                }
            }
        }
    }

    // Drain barrier: every worker observes `finished` and is awaited.
    shared.finished.cancel();
    for handle in workers {
        let _ = handle.await;
    }

    if canceled {
        return Ok(0);
    }

    if let Some(message) = shared.recover_final_message() {
        shared.sink.final_message(&message).await;
    }

    if shared.forced_done() {
        return Ok(0);
    }
    Ok(exit_code.unwrap_or(0))
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
