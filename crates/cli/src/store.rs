// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite persistence for users, sessions, messages, and runs. All
//! mutations serialise through one connection behind a mutex; schema
//! upgrades are additive columns only.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};

use crate::session::{now_ts, Run, RunStatus, Session, SessionState};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open the backing file. Failure here is fatal to startup.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open store {}", path.display()))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow::anyhow!("store mutex poisoned"))
    }

    fn ensure_column(
        conn: &Connection,
        table: &str,
        column: &str,
        definition: &str,
    ) -> anyhow::Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let mut rows = stmt.query([])?;
        let mut present = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == column {
                present = true;
                break;
            }
        }
        if !present {
            conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), [])?;
        }
        Ok(())
    }

    /// Create tables and apply additive migrations.
    pub fn init(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                telegram_id INTEGER PRIMARY KEY,
                role TEXT NOT NULL,
                status TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                bot_id TEXT NOT NULL DEFAULT 'default',
                state TEXT NOT NULL,
                resume_id TEXT,
                last_result TEXT,
                jsonl_last_ts REAL,
                jsonl_last_hash TEXT,
                last_chat_id INTEGER,
                created_at REAL NOT NULL,
                last_activity REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                ts REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                prompt TEXT NOT NULL,
                started_at REAL NOT NULL,
                finished_at REAL,
                error TEXT
            )",
            [],
        )?;
        // Columns added after the first release; upgrades are additive.
        Self::ensure_column(&conn, "sessions", "resume_id", "TEXT")?;
        Self::ensure_column(&conn, "sessions", "last_result", "TEXT")?;
        Self::ensure_column(&conn, "sessions", "jsonl_last_ts", "REAL")?;
        Self::ensure_column(&conn, "sessions", "jsonl_last_hash", "TEXT")?;
        Self::ensure_column(&conn, "sessions", "last_chat_id", "INTEGER")?;
        Self::ensure_column(&conn, "sessions", "bot_id", "TEXT NOT NULL DEFAULT 'default'")?;
        Ok(())
    }

    /// Insert or fully replace a session row.
    pub fn record_session(&self, session: &Session) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sessions
             (session_id, user_id, bot_id, state, resume_id, last_result,
              jsonl_last_ts, jsonl_last_hash, last_chat_id, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.session_id,
                session.user_id,
                session.bot_id,
                session.state.as_str(),
                session.resume_id,
                session.last_result,
                session.jsonl_last_ts,
                session.jsonl_last_hash,
                session.last_chat_id,
                session.created_at,
                session.last_activity,
            ],
        )?;
        Ok(())
    }

    pub fn update_session_state(
        &self,
        session_id: &str,
        state: SessionState,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET state = ?1, last_activity = ?2 WHERE session_id = ?3",
            params![state.as_str(), now_ts(), session_id],
        )?;
        Ok(())
    }

    pub fn update_session_resume_id(
        &self,
        session_id: &str,
        resume_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET resume_id = ?1, last_activity = ?2 WHERE session_id = ?3",
            params![resume_id, now_ts(), session_id],
        )?;
        Ok(())
    }

    pub fn update_session_last_result(
        &self,
        session_id: &str,
        last_result: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET last_result = ?1, last_activity = ?2 WHERE session_id = ?3",
            params![last_result, now_ts(), session_id],
        )?;
        Ok(())
    }

    pub fn update_session_jsonl_state(
        &self,
        session_id: &str,
        last_ts: Option<f64>,
        last_hash: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions
             SET jsonl_last_ts = ?1, jsonl_last_hash = ?2, last_activity = ?3
             WHERE session_id = ?4",
            params![last_ts, last_hash, now_ts(), session_id],
        )?;
        Ok(())
    }

    pub fn update_session_chat_id(&self, session_id: &str, chat_id: i64) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET last_chat_id = ?1, last_activity = ?2 WHERE session_id = ?3",
            params![chat_id, now_ts(), session_id],
        )?;
        Ok(())
    }

    /// Latest non-null last-result for `(user, bot)` by activity.
    pub fn get_last_result_by_user_id(
        &self,
        user_id: i64,
        bot_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT last_result FROM sessions
                 WHERE user_id = ?1 AND bot_id = ?2 AND last_result IS NOT NULL
                 ORDER BY last_activity DESC LIMIT 1",
                params![user_id, bot_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// Latest rollout cursor for `(user, bot)` by activity.
    pub fn get_jsonl_state_by_user_id(
        &self,
        user_id: i64,
        bot_id: &str,
    ) -> anyhow::Result<(Option<f64>, Option<String>)> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT jsonl_last_ts, jsonl_last_hash FROM sessions
                 WHERE user_id = ?1 AND bot_id = ?2
                 ORDER BY last_activity DESC LIMIT 1",
                params![user_id, bot_id],
                |row| {
                    Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, Option<String>>(1)?))
                },
            )
            .optional()?;
        Ok(row.unwrap_or((None, None)))
    }

    pub fn get_last_chat_id_by_user_id(
        &self,
        user_id: i64,
        bot_id: &str,
    ) -> anyhow::Result<Option<i64>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT last_chat_id FROM sessions
                 WHERE user_id = ?1 AND bot_id = ?2 AND last_chat_id IS NOT NULL
                 ORDER BY last_activity DESC LIMIT 1",
                params![user_id, bot_id],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?;
        Ok(row.flatten())
    }

    /// Load a session row (the queue is in-memory only).
    pub fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT session_id, user_id, bot_id, state, resume_id, last_result,
                        jsonl_last_ts, jsonl_last_hash, last_chat_id, created_at, last_activity
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(Session {
                        session_id: row.get(0)?,
                        user_id: row.get(1)?,
                        bot_id: row.get(2)?,
                        state: SessionState::parse(&row.get::<_, String>(3)?),
                        current_run_id: None,
                        resume_id: row.get(4)?,
                        last_result: row.get(5)?,
                        jsonl_last_ts: row.get(6)?,
                        jsonl_last_hash: row.get(7)?,
                        last_chat_id: row.get(8)?,
                        queue: Default::default(),
                        created_at: row.get(9)?,
                        last_activity: row.get(10)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Append one utterance to the audit log.
    pub fn record_message(
        &self,
        session_id: &str,
        sender: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (session_id, sender, content, ts) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, sender, content, now_ts()],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &Run) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, session_id, status, prompt, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.run_id,
                run.session_id,
                run.status.as_str(),
                run.prompt,
                run.started_at,
                run.finished_at,
                run.error,
            ],
        )?;
        Ok(())
    }

    /// Terminal transition: status, finish time, and error set together.
    pub fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: Option<f64>,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, error = ?3 WHERE run_id = ?4",
            params![status.as_str(), finished_at, error, run_id],
        )?;
        Ok(())
    }

    /// Fetch a run row, for status inspection and tests.
    pub fn get_run(&self, run_id: &str) -> anyhow::Result<Option<(RunStatus, Option<f64>, Option<String>)>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT status, finished_at, error FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(status, finished_at, error)| {
            let status = match status.as_str() {
                "done" => RunStatus::Done,
                "error" => RunStatus::Error,
                "canceled" => RunStatus::Canceled,
                "timeout" => RunStatus::Timeout,
                _ => RunStatus::Running,
            };
            (status, finished_at, error)
        }))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
