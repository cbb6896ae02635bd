// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumption of the agent's rollout stream: the append-only
//! one-JSON-object-per-line session files under `$CODEX_HOME/sessions`
//! whose names carry the resume id.

pub mod tail;

use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use tail::EventTailer;

/// Root of the agent's state directory (`CODEX_HOME`, default
/// `~/.codex`).
pub fn codex_home() -> PathBuf {
    match std::env::var_os("CODEX_HOME") {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".codex"),
    }
}

/// One line of a session file. Unknown record kinds parse fine and are
/// ignored by the classifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct RolloutRecord {
    pub timestamp: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RolloutRecord {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }

    pub fn timestamp_secs(&self) -> Option<f64> {
        parse_timestamp(self.timestamp.as_deref())
    }
}

/// Visible text carried by an `event_msg` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventText {
    /// `agent_message` — emitted verbatim.
    Message(String),
    /// `agent_reasoning` — throttled and hidden or summarized.
    Reasoning(String),
}

/// Classify an `event_msg` record. Everything else yields `None`.
pub fn event_msg_text(record: &RolloutRecord) -> Option<EventText> {
    if record.kind.as_deref() != Some("event_msg") {
        return None;
    }
    let payload_type = record.payload.get("type").and_then(|v| v.as_str());
    match payload_type {
        Some("agent_message") => {
            let message = record.payload.get("message").and_then(|v| v.as_str())?;
            let message = message.trim();
            if message.is_empty() {
                return None;
            }
            Some(EventText::Message(message.to_string()))
        }
        Some("agent_reasoning") => {
            let text = record.payload.get("text").and_then(|v| v.as_str())?;
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            Some(EventText::Reasoning(text.to_string()))
        }
        _ => None,
    }
}

/// Extract the assistant text of a `response_item` message record:
/// every `output_text` content part joined with newlines.
pub fn assistant_message_text(record: &RolloutRecord) -> Option<String> {
    if record.kind.as_deref() != Some("response_item") {
        return None;
    }
    if record.payload.get("type").and_then(|v| v.as_str()) != Some("message") {
        return None;
    }
    if record.payload.get("role").and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let content = record.payload.get("content")?.as_array()?;
    let parts: Vec<&str> = content
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|item| item.get("text").and_then(|v| v.as_str()))
        .filter(|text| !text.is_empty())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n").trim().to_string())
}

/// Parse an ISO-8601 timestamp (`Z` or explicit offset; naive values
/// are taken as UTC) into epoch seconds.
pub fn parse_timestamp(value: Option<&str>) -> Option<f64> {
    let text = value?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_micros() as f64 / 1_000_000.0);
    }
    let naive = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(naive.and_utc().timestamp_micros() as f64 / 1_000_000.0)
}

/// Locate the freshest session file whose name contains the resume id,
/// ranked by modification time.
pub fn find_session_file(codex_home: &Path, resume_id: &str) -> Option<PathBuf> {
    let sessions_dir = codex_home.join("sessions");
    if !sessions_dir.is_dir() {
        return None;
    }
    let mut candidates: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in walkdir::WalkDir::new(&sessions_dir).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.contains(resume_id) || !name.ends_with(".jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(mtime) = meta.modified() else {
            continue;
        };
        candidates.push((mtime, entry.into_path()));
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates.into_iter().next().map(|(_, path)| path)
}

/// Scan a session file for its most recent assistant message, from both
/// `event_msg`/`agent_message` and `response_item` records.
pub fn extract_last_assistant_message_with_ts(path: &Path) -> (Option<String>, Option<f64>) {
    let Ok(raw) = std::fs::read(path) else {
        return (None, None);
    };
    let text = String::from_utf8_lossy(&raw);
    let mut last_message = None;
    let mut last_timestamp = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(record) = RolloutRecord::parse(line) else {
            continue;
        };
        if let Some(EventText::Message(message)) = event_msg_text(&record) {
            last_timestamp = record.timestamp_secs();
            last_message = Some(message);
            continue;
        }
        if let Some(message) = assistant_message_text(&record) {
            last_timestamp = record.timestamp_secs();
            last_message = Some(message);
        }
    }
    (last_message, last_timestamp)
}

/// Most recent assistant message for a resume id, if any.
pub fn last_assistant_message(codex_home: &Path, resume_id: &str) -> Option<String> {
    let path = find_session_file(codex_home, resume_id)?;
    extract_last_assistant_message_with_ts(&path).0
}

/// Like [`last_assistant_message`], but only when its timestamp is at
/// or after `min_timestamp`.
pub fn last_assistant_message_after(
    codex_home: &Path,
    resume_id: &str,
    min_timestamp: f64,
) -> Option<String> {
    let path = find_session_file(codex_home, resume_id)?;
    let (message, timestamp) = extract_last_assistant_message_with_ts(&path);
    let message = message?;
    let timestamp = timestamp?;
    if timestamp < min_timestamp {
        return None;
    }
    Some(message)
}

const REASONING_TAGS: &[(&[&str], &str)] = &[
    (&["plan", "规划", "计划"], "制定计划"),
    (&["analyze", "analysis", "评估", "分析"], "分析需求"),
    (&["config", "配置", "env", "环境"], "检查配置"),
    (&["error", "fail", "失败", "问题"], "排查问题"),
    (&["test", "pytest", "playwright", "测试"], "执行测试"),
    (&["deploy", "systemctl", "service", "服务"], "部署/服务操作"),
    (&["refactor", "重构"], "重构整理"),
    (&["readme", "doc", "文档"], "更新文档"),
    (&["verify", "验证"], "验证结果"),
    (&["final", "summary", "最终", "总结"], "整理最终回复"),
    (&["sqlite", "db", "数据库", "jsonl"], "检查数据与日志"),
];

/// Replace reasoning text with a keyword-derived tag line; the raw text
/// never reaches the chat.
pub fn summarize_reasoning(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut tags: Vec<&str> = Vec::new();
    for (keywords, tag) in REASONING_TAGS {
        if keywords.iter().any(|keyword| lowered.contains(keyword)) {
            tags.push(tag);
        }
    }
    if tags.is_empty() {
        tags.push("整理任务与输出");
    }
    let summary = tags[..tags.len().min(4)].join("；");
    let length = text.trim().chars().count();
    format!("内部推理摘要：{summary}（已隐藏原文，长度{length}字）")
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
