// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use crate::session::SessionState;
use crate::store::Store;

use super::SessionManager;

fn manager(dir: &std::path::Path) -> anyhow::Result<(SessionManager, Arc<Store>)> {
    let store = Arc::new(Store::open(&dir.join("test.db"))?);
    store.init()?;
    Ok((SessionManager::new(store.clone(), "default"), store))
}

#[tokio::test]
async fn creates_sessions_lazily_and_persists() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, store) = manager(dir.path())?;

    let session = manager.get_or_create(1).await?;
    assert_eq!(session.state, SessionState::Idle);
    assert!(store.get_session(&session.session_id)?.is_some());

    // Same user observes the same session.
    let again = manager.get_or_create(1).await?;
    assert_eq!(again.session_id, session.session_id);
    Ok(())
}

#[tokio::test]
async fn mutators_write_through_to_store() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, store) = manager(dir.path())?;

    let session = manager.set_state(1, SessionState::Running).await?;
    let loaded = store
        .get_session(&session.session_id)?
        .ok_or_else(|| anyhow::anyhow!("missing session"))?;
    assert_eq!(loaded.state, SessionState::Running);

    let session = manager.set_last_result(1, Some("final".to_string())).await?;
    let loaded = store
        .get_session(&session.session_id)?
        .ok_or_else(|| anyhow::anyhow!("missing session"))?;
    assert_eq!(loaded.last_result.as_deref(), Some("final"));

    let session = manager.set_jsonl_state(1, Some(5.0), Some("h".to_string())).await?;
    let loaded = store
        .get_session(&session.session_id)?
        .ok_or_else(|| anyhow::anyhow!("missing session"))?;
    assert_eq!(loaded.jsonl_last_ts, Some(5.0));
    assert_eq!(loaded.jsonl_last_hash.as_deref(), Some("h"));
    Ok(())
}

#[tokio::test]
async fn binding_a_chat_seeds_the_cursor_timestamp() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, store) = manager(dir.path())?;

    let session = manager.set_chat_id(1, 42).await?;
    assert_eq!(session.last_chat_id, Some(42));
    assert!(session.jsonl_last_ts.is_some());
    assert!(session.jsonl_last_hash.is_none());

    let loaded = store
        .get_session(&session.session_id)?
        .ok_or_else(|| anyhow::anyhow!("missing session"))?;
    assert!(loaded.jsonl_last_ts.is_some());

    // Re-binding must not move an established cursor.
    let seeded = session.jsonl_last_ts;
    let session = manager.set_chat_id(1, 43).await?;
    assert_eq!(session.jsonl_last_ts, seeded);
    Ok(())
}

#[tokio::test]
async fn queue_is_fifo() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, _store) = manager(dir.path())?;

    manager.enqueue_prompt(1, "first").await?;
    manager.enqueue_prompt(1, "second").await?;
    assert_eq!(manager.peek_queue(1).await?, 2);

    assert_eq!(manager.dequeue_prompt(1).await?.as_deref(), Some("first"));
    assert_eq!(manager.dequeue_prompt(1).await?.as_deref(), Some("second"));
    assert_eq!(manager.dequeue_prompt(1).await?, None);
    Ok(())
}

#[tokio::test]
async fn users_are_isolated() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (manager, _store) = manager(dir.path())?;

    manager.enqueue_prompt(1, "one").await?;
    assert_eq!(manager.peek_queue(2).await?, 0);

    manager.set_state(2, SessionState::Running).await?;
    let one = manager.get_or_create(1).await?;
    assert_eq!(one.state, SessionState::Idle);
    Ok(())
}
