// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idle watchdog: three silent-time thresholds that recover a final
//! message where possible and terminate the child.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{RunShared, StatusToken};

/// Poll the shared idle clock and fire, in order: final-result idle,
/// no-output idle, and post-compaction idle.
pub(crate) async fn idle_watchdog(shared: Arc<RunShared>) {
    let half_compaction = shared.config.context_compaction_idle_timeout_seconds / 2.0;
    let check_interval = Duration::from_secs_f64(half_compaction.clamp(0.1, 1.0));

    loop {
        tokio::select! {
            _ = shared.finished.cancelled() => break,
            _ = tokio::time::sleep(check_interval) => {}
        }
        if shared.finished.is_cancelled() {
            break;
        }
        let idle_for = shared.idle_for().as_secs_f64();
        let config = &shared.config;

        // The agent printed its answer and went quiet: surface the
        // captured final message and stop waiting on the child.
        if config.final_result_idle_timeout_seconds > 0.0
            && idle_for >= config.final_result_idle_timeout_seconds
        {
            let final_message = shared
                .read_last_message_file()
                .or_else(|| shared.fallback_last_assistant_message());
            if let Some(message) = final_message {
                shared.emit_final_if_new(&message).await;
                shared.emit("检测到最终结果已输出，自动结束任务。", false).await;
                shared.mark_forced_done();
                warn!("检测到最终结果空闲，尝试结束进程 pid={}", shared.pid());
                shared.terminate_child();
                break;
            }
        }

        if config.no_output_idle_timeout_seconds > 0.0
            && idle_for >= config.no_output_idle_timeout_seconds
        {
            shared.emit("检测到长时间无输出，已自动结束。", false).await;
            shared.sink.status(StatusToken::Timeout).await;
            shared.mark_forced_done();
            warn!("检测到长时间无输出，尝试结束进程 pid={}", shared.pid());
            shared.terminate_child();
            break;
        }

        // Compaction means no further output may arrive. Only relevant
        // when the rollout stream is not being tailed for this run.
        if !shared.compacted() {
            continue;
        }
        if config.jsonl_stream_events {
            continue;
        }
        if idle_for < config.context_compaction_idle_timeout_seconds {
            continue;
        }
        let last_message = shared
            .read_last_message_file()
            .or_else(|| shared.fallback_last_assistant_message());
        if let Some(message) = last_message {
            shared.emit_final_if_new(&message).await;
        }
        shared.emit("检测到上下文压缩后无输出，已自动结束。", false).await;
        shared.sink.status(StatusToken::Timeout).await;
        shared.mark_forced_done();
        warn!("检测到上下文压缩后无输出，尝试结束进程 pid={}", shared.pid());
        shared.terminate_child();
        break;
    }
}
