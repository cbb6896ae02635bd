// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::DedupWindow;

#[test]
fn suppresses_repeats_within_the_window() {
    let mut window = DedupWindow::new();
    assert!(window.should_send("result"));
    assert!(!window.should_send("result"));
    // Normalization applies: trailing whitespace is not a new message.
    assert!(!window.should_send("result  \n"));
    assert!(window.should_send("other"));
}

#[test]
fn blank_text_is_always_sendable() {
    let mut window = DedupWindow::new();
    assert!(window.should_send(""));
    assert!(window.should_send("  \n"));
    assert!(window.is_empty());
}

#[test]
fn record_marks_without_testing() {
    let mut window = DedupWindow::new();
    window.record("streamed output");
    assert!(!window.should_send("streamed output"));
}

#[test]
fn expired_entries_are_evicted_first() {
    let mut window = DedupWindow::with_limits(Duration::from_millis(30), 256);
    window.record("short lived");
    std::thread::sleep(Duration::from_millis(60));
    assert!(window.should_send("short lived"));
}

#[test]
fn overflow_evicts_the_oldest_entries() {
    let mut window = DedupWindow::with_limits(Duration::from_secs(3600), 3);
    window.record("a");
    std::thread::sleep(Duration::from_millis(2));
    window.record("b");
    std::thread::sleep(Duration::from_millis(2));
    window.record("c");
    std::thread::sleep(Duration::from_millis(2));
    window.record("d");
    // "a" is the oldest and falls out on the next prune.
    assert!(window.should_send("a"));
    // The most recent entries survive the eviction.
    assert!(!window.should_send("d"));
}

#[test]
fn clear_resets_the_window() {
    let mut window = DedupWindow::new();
    window.record("x");
    window.clear();
    assert!(window.should_send("x"));
}
