// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY execution channel. Shares the pipe channel's ingestion
//! semantics, plus terminal plumbing: the cursor-position probe is
//! answered locally and a small trailing slack keeps ANSI escape
//! sequences from being split across reads.

use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{InputMode, RuntimeConfig};

use super::{apply_env, build_input, spawn_common_workers, supervise, RunShared};

/// `ESC [ 6 n` — the child asking where the cursor is.
const CPR_REQUEST: &[u8] = b"\x1b[6n";
/// Fixed local answer: row 1, column 1.
const CPR_RESPONSE: &[u8] = b"\x1b[1;1R";
/// Longest suffix that may be a partial escape sequence.
const ANSI_SLACK: usize = 3;

/// The parent's side of the PTY, readable and writable through the
/// reactor. Reads yield `Ok(0)` at end of stream, including the EIO a
/// PTY master raises once the child side is gone.
struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    fn new(fd: OwnedFd) -> anyhow::Result<Self> {
        let flags = fcntl(&fd, FcntlArg::F_GETFL).context("read master fd flags")?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(&fd, FcntlArg::F_SETFL(flags)).context("set master nonblocking")?;
        Ok(Self { fd: AsyncFd::new(fd).context("register master fd")? })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let attempt = guard.try_io(|fd| {
                match nix::unistd::read(fd, buf) {
                    Ok(n) => Ok(n),
                    Err(Errno::EIO) => Ok(0),
                    Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
                }
            });
            match attempt {
                Ok(result) => return result,
                // Spurious readiness; wait for the reactor again.
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            let mut guard = self.fd.writable().await?;
            let attempt = guard.try_io(|fd| {
                nix::unistd::write(fd.get_ref(), &data[written..])
                    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
            match attempt {
                Ok(result) => written += result?,
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

pub(crate) async fn execute(
    config: &RuntimeConfig,
    args: &[String],
    prompt: &str,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
) -> anyhow::Result<i32> {
    let program = args.first().ok_or_else(|| anyhow::anyhow!("empty child argv"))?;
    let pty = nix::pty::openpty(None, None).context("openpty")?;

    let mut command = Command::new(program);
    command.args(&args[1..]).current_dir(&config.codex_workdir).kill_on_drop(true);
    apply_env(&mut command);
    command.stdin(Stdio::from(pty.slave.try_clone().context("dup pty slave")?));
    command.stdout(Stdio::from(pty.slave.try_clone().context("dup pty slave")?));
    command.stderr(Stdio::from(pty.slave));

    let mut child = command.spawn().with_context(|| format!("启动 Codex CLI 失败: {program}"))?;
    // Close the parent's copies of the slave so the master observes EOF
    // once the child is gone.
    drop(command);

    let pid = child.id().unwrap_or(0);
    shared.set_pid(pid);
    info!("启动 Codex CLI 伪终端 pid={pid}");

    let master = PtyMaster::new(pty.master)?;

    if config.codex_cli_input_mode == InputMode::Stdin {
        master.write(build_input(config, prompt).as_bytes()).await.context("写入伪终端输入")?;
    } else if config.codex_cli_approvals_mode.is_some() {
        warn!("PTY arg 模式无法注入 /approvals 指令，已跳过");
    }

    let mut workers = vec![tokio::spawn(read_output(master, shared.clone()))];
    workers.extend(spawn_common_workers(&shared));

    supervise(child, workers, shared, cancel).await
}

/// Raw-byte reader: strips and answers CPR probes, holds back the ANSI
/// slack, then splits on newlines like the pipe channel.
async fn read_output(master: PtyMaster, shared: Arc<RunShared>) {
    let mut chunk = vec![0u8; 1024];
    let mut raw_buf: Vec<u8> = Vec::new();
    let mut text_buf = String::new();

    loop {
        let read = tokio::select! {
            biased;
            result = master.read(&mut chunk) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
            _ = shared.finished.cancelled() => break,
        };
        shared.touch();
        raw_buf.extend_from_slice(&chunk[..read]);

        while let Some(idx) = find_subsequence(&raw_buf, CPR_REQUEST) {
            if idx > 0 {
                text_buf.push_str(&String::from_utf8_lossy(&raw_buf[..idx]));
            }
            raw_buf.drain(..idx + CPR_REQUEST.len());
            let _ = master.write(CPR_RESPONSE).await;
        }

        if raw_buf.len() > ANSI_SLACK {
            let emit_len = raw_buf.len() - ANSI_SLACK;
            text_buf.push_str(&String::from_utf8_lossy(&raw_buf[..emit_len]));
            raw_buf.drain(..emit_len);
        }

        while let Some(pos) = text_buf.find('\n') {
            let line = text_buf[..pos].trim_end_matches('\r').to_string();
            text_buf.drain(..=pos);
            if !line.is_empty() {
                shared.ingest_line(&line, false).await;
            }
        }
    }

    if !raw_buf.is_empty() {
        text_buf.push_str(&String::from_utf8_lossy(&raw_buf));
    }
    let rest = text_buf.trim();
    if !rest.is_empty() {
        shared.ingest_line(rest, false).await;
    }
}

/// First position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
