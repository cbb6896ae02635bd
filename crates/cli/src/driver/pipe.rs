// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipe execution channel: line-buffered stdout/stderr ingestion.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{InputMode, RuntimeConfig};

use super::{apply_env, build_input, spawn_common_workers, supervise, RunShared};

pub(crate) async fn execute(
    config: &RuntimeConfig,
    args: &[String],
    prompt: &str,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
) -> anyhow::Result<i32> {
    let program = args.first().ok_or_else(|| anyhow::anyhow!("empty child argv"))?;
    let mut command = Command::new(program);
    command
        .args(&args[1..])
        .current_dir(&config.codex_workdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command.stdin(if config.codex_cli_input_mode == InputMode::Stdin {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    apply_env(&mut command);

    let mut child = command.spawn().with_context(|| format!("启动 Codex CLI 失败: {program}"))?;
    let pid = child.id().unwrap_or(0);
    shared.set_pid(pid);
    info!("启动 Codex CLI 进程 pid={pid}");

    if config.codex_cli_input_mode == InputMode::Stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(build_input(config, prompt).as_bytes())
                .await
                .context("写入子进程 stdin")?;
            // Dropping closes the pipe; the child reads to EOF.
        }
    }

    let mut workers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        workers.push(tokio::spawn(read_lines(stdout, false, shared.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        workers.push(tokio::spawn(read_lines(stderr, true, shared.clone())));
    }
    workers.extend(spawn_common_workers(&shared));

    supervise(child, workers, shared, cancel).await
}

/// Decode one stream line by line (lossy UTF-8), feeding the shared
/// ingestion path until EOF or run end.
async fn read_lines<R>(stream: R, is_error: bool, shared: Arc<RunShared>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // Read-first bias: drain buffered output before honoring the
        // run-finished signal.
        tokio::select! {
            biased;
            result = reader.read_until(b'\n', &mut buf) => match result {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = shared.finished.cancelled() => break,
        }
        let text = String::from_utf8_lossy(&buf);
        shared.ingest_line(text.trim_end(), is_error).await;
    }
}
