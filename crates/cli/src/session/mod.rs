// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-`(bot, user)` session and per-dispatch run models.

pub mod manager;

use std::collections::VecDeque;

pub use manager::SessionManager;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    WaitingInput,
    Error,
    Canceled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "waiting_input" => Self::WaitingInput,
            "error" => Self::Error,
            "canceled" => Self::Canceled,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal (and initial) status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Done,
    Error,
    Canceled,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mint a prefixed unique id, e.g. `sess_3f2a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Epoch seconds as carried in the store.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Durable per-`(bot, user)` state. The in-memory copy is owned by the
/// [`SessionManager`]; the store holds the mirror.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub bot_id: String,
    pub state: SessionState,
    pub current_run_id: Option<String>,
    pub resume_id: Option<String>,
    pub last_result: Option<String>,
    pub jsonl_last_ts: Option<f64>,
    pub jsonl_last_hash: Option<String>,
    pub last_chat_id: Option<i64>,
    pub queue: VecDeque<String>,
    pub created_at: f64,
    pub last_activity: f64,
}

impl Session {
    pub fn new(user_id: i64, bot_id: &str) -> Self {
        let now = now_ts();
        Self {
            session_id: new_id("sess"),
            user_id,
            bot_id: bot_id.to_string(),
            state: SessionState::Idle,
            current_run_id: None,
            resume_id: None,
            last_result: None,
            jsonl_last_ts: None,
            jsonl_last_hash: None,
            last_chat_id: None,
            queue: VecDeque::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

/// One dispatch of a prompt to the agent.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub session_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub started_at: f64,
    pub finished_at: Option<f64>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(session_id: &str, prompt: &str) -> Self {
        Self {
            run_id: new_id("run"),
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            status: RunStatus::Running,
            started_at: now_ts(),
            finished_at: None,
            error: None,
        }
    }
}
