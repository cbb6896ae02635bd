// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::chat::ChatOutput;

use super::StreamBroker;

#[derive(Default)]
struct Collector {
    streamed: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ChatOutput for Collector {
    async fn status(&self, _text: &str) {}

    async fn stream(&self, text: &str, is_final: bool) {
        self.streamed.lock().push((text.to_string(), is_final));
    }
}

#[tokio::test]
async fn periodic_flush_joins_buffered_lines() -> anyhow::Result<()> {
    let out = Arc::new(Collector::default());
    let broker = StreamBroker::new(out.clone(), 0.02, 100);
    broker.start();

    broker.push("one", false).await;
    broker.push("two", true).await;
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let streamed = out.streamed.lock().clone();
    assert_eq!(streamed, vec![("one\n[stderr] two".to_string(), false)]);
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_performs_a_final_flush_and_empties_the_buffer() -> anyhow::Result<()> {
    let out = Arc::new(Collector::default());
    let broker = StreamBroker::new(out.clone(), 10.0, 100);
    broker.start();

    broker.push("tail", false).await;
    broker.stop().await;

    let streamed = out.streamed.lock().clone();
    assert_eq!(streamed, vec![("tail".to_string(), true)]);
    assert_eq!(broker.buffered().await, 0);
    Ok(())
}

#[tokio::test]
async fn flush_splits_to_the_chunk_limit() -> anyhow::Result<()> {
    let out = Arc::new(Collector::default());
    let broker = StreamBroker::new(out.clone(), 10.0, 4);

    broker.push("abcdef", false).await;
    broker.flush(false).await;

    let streamed = out.streamed.lock().clone();
    assert_eq!(
        streamed,
        vec![("abcd".to_string(), false), ("ef".to_string(), false)]
    );
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn flush_without_content_sends_nothing() -> anyhow::Result<()> {
    let out = Arc::new(Collector::default());
    let broker = StreamBroker::new(out.clone(), 10.0, 4);
    broker.flush(true).await;
    broker.stop().await;
    assert!(out.streamed.lock().is_empty());
    Ok(())
}
