//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use vrclog::event::Event;
use vrclog::watcher::WatchConfig;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Time for the background task to open the tailed file.
pub const SETTLE: Duration = Duration::from_millis(400);

pub const POLL: Duration = Duration::from_millis(200);

pub fn join_line(second: u32, name: &str) -> String {
    format!("2024.01.15 12:00:{second:02} Log        -  [Behaviour] OnPlayerJoined {name}\n")
}

pub fn left_line(second: u32, name: &str) -> String {
    format!("2024.01.15 12:00:{second:02} Log        -  [Behaviour] OnPlayerLeft {name}\n")
}

pub fn log_dir_with(name: &str, content: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

pub fn append(path: &Path, text: &str) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
}

pub fn config(dir: &TempDir) -> WatchConfig {
    WatchConfig {
        log_dir: Some(dir.path().to_path_buf()),
        poll_interval: POLL,
        ..WatchConfig::default()
    }
}

pub async fn recv_event(events: &mut mpsc::Receiver<Event>) -> Event {
    match tokio::time::timeout(WAIT, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event channel closed"),
        Err(_) => panic!("timed out waiting for an event"),
    }
}

pub fn player(event: &Event) -> &str {
    event.player_name.as_deref().unwrap_or_default()
}

/// Assert the channel is closed without yielding anything else.
pub async fn assert_closed<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>) {
    match tokio::time::timeout(WAIT, rx.recv()).await {
        Ok(None) => {}
        Ok(Some(item)) => panic!("expected closed channel, got {item:?}"),
        Err(_) => panic!("timed out waiting for channel to close"),
    }
}

/// Assert nothing arrives within `window`.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::Receiver<T>, window: Duration) {
    if let Ok(item) = tokio::time::timeout(window, rx.recv()).await {
        panic!("expected no item, got {item:?}");
    }
}
