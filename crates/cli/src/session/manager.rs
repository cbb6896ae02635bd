// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serialises every session mutation behind one lock so the in-memory
//! copy and the store never diverge.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::store::Store;

use super::{now_ts, Session, SessionState};

/// Per-bot cache of sessions with write-through persistence.
pub struct SessionManager {
    store: Arc<Store>,
    bot_id: String,
    sessions: Mutex<HashMap<i64, Session>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, bot_id: impl Into<String>) -> Self {
        Self { store, bot_id: bot_id.into(), sessions: Mutex::new(HashMap::new()) }
    }

    fn get_or_create_locked<'a>(
        &self,
        sessions: &'a mut HashMap<i64, Session>,
        user_id: i64,
    ) -> anyhow::Result<&'a mut Session> {
        if !sessions.contains_key(&user_id) {
            let session = Session::new(user_id, &self.bot_id);
            self.store.record_session(&session)?;
            sessions.insert(user_id, session);
        }
        sessions.get_mut(&user_id).ok_or_else(|| anyhow::anyhow!("session vanished under lock"))
    }

    /// Fetch (creating lazily) the user's session.
    pub async fn get_or_create(&self, user_id: i64) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.last_activity = now_ts();
        Ok(session.clone())
    }

    pub async fn set_state(&self, user_id: i64, state: SessionState) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.state = state;
        session.last_activity = now_ts();
        self.store.update_session_state(&session.session_id, state)?;
        Ok(session.clone())
    }

    pub async fn set_current_run(
        &self,
        user_id: i64,
        run_id: Option<String>,
    ) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.current_run_id = run_id;
        session.last_activity = now_ts();
        Ok(session.clone())
    }

    pub async fn set_resume_id(
        &self,
        user_id: i64,
        resume_id: Option<String>,
    ) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.resume_id = resume_id.clone();
        session.last_activity = now_ts();
        self.store.update_session_resume_id(&session.session_id, resume_id.as_deref())?;
        Ok(session.clone())
    }

    pub async fn set_last_result(
        &self,
        user_id: i64,
        last_result: Option<String>,
    ) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.last_result = last_result.clone();
        session.last_activity = now_ts();
        self.store.update_session_last_result(&session.session_id, last_result.as_deref())?;
        Ok(session.clone())
    }

    pub async fn set_jsonl_state(
        &self,
        user_id: i64,
        last_ts: Option<f64>,
        last_hash: Option<String>,
    ) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.jsonl_last_ts = last_ts;
        session.jsonl_last_hash = last_hash.clone();
        session.last_activity = now_ts();
        self.store.update_session_jsonl_state(&session.session_id, last_ts, last_hash.as_deref())?;
        Ok(session.clone())
    }

    /// Bind the chat for unsolicited pushes. A freshly-bound chat also
    /// seeds the rollout cursor timestamp so the historical backlog is
    /// never replayed into it.
    pub async fn set_chat_id(&self, user_id: i64, chat_id: i64) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.last_chat_id = Some(chat_id);
        session.last_activity = now_ts();
        self.store.update_session_chat_id(&session.session_id, chat_id)?;
        if session.jsonl_last_ts.is_none() && session.jsonl_last_hash.is_none() {
            session.jsonl_last_ts = Some(now_ts());
            self.store.update_session_jsonl_state(
                &session.session_id,
                session.jsonl_last_ts,
                session.jsonl_last_hash.as_deref(),
            )?;
        }
        Ok(session.clone())
    }

    pub async fn enqueue_prompt(&self, user_id: i64, prompt: &str) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        session.queue.push_back(prompt.to_string());
        session.last_activity = now_ts();
        Ok(session.clone())
    }

    pub async fn dequeue_prompt(&self, user_id: i64) -> anyhow::Result<Option<String>> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        if session.queue.is_empty() {
            return Ok(None);
        }
        session.last_activity = now_ts();
        Ok(session.queue.pop_front())
    }

    /// Number of prompts waiting behind the active run.
    pub async fn peek_queue(&self, user_id: i64) -> anyhow::Result<usize> {
        let mut sessions = self.sessions.lock().await;
        let session = self.get_or_create_locked(&mut sessions, user_id)?;
        Ok(session.queue.len())
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
