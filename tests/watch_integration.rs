//! Integration tests for the watch engine.

mod support;

use std::time::Duration;

use chrono::{Local, TimeZone};
use tokio_util::sync::CancellationToken;
use vrclog::event::EventType;
use vrclog::watcher::{EngineState, ReplayDirective, WatchConfig, WatchEngine, WatchError, WatchOp};

use support::{
    append, assert_closed, assert_quiet, config, join_line, left_line, log_dir_with, player,
    recv_event, SETTLE,
};

#[tokio::test]
async fn test_replay_last_n_then_tail() {
    let content: String = (1..=5).map(|i| join_line(i, &format!("U{i}"))).collect();
    let (dir, path) = log_dir_with("output_log_a.txt", &content);

    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::LastN(2),
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, _errors) = engine.start(&token).unwrap();

    assert_eq!(player(&recv_event(&mut events).await), "U4");
    assert_eq!(player(&recv_event(&mut events).await), "U5");

    tokio::time::sleep(SETTLE).await;
    append(&path, &join_line(6, "U6"));
    assert_eq!(player(&recv_event(&mut events).await), "U6");

    engine.stop().await;
}

#[tokio::test]
async fn test_replay_since_time_filters_earlier_events() {
    let content: String = (0..5).map(|i| join_line(i, &format!("U{i}"))).collect();
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);
    let since = Local.with_ymd_and_hms(2024, 1, 15, 12, 0, 2).unwrap();

    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::SinceTime(since),
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, _errors) = engine.start(&token).unwrap();

    for expected in ["U2", "U3", "U4"] {
        let event = recv_event(&mut events).await;
        assert_eq!(player(&event), expected);
        assert!(event.timestamp >= since);
    }
    assert_quiet(&mut events, Duration::from_millis(300)).await;

    engine.stop().await;
}

#[tokio::test]
async fn test_unrecognized_line_yields_no_event_and_no_error() {
    let content = format!(
        "{}2024.01.15 12:00:01 Log        -  [Behaviour] Initialized PlayerAPI\n{}",
        join_line(0, "A"),
        left_line(2, "A")
    );
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);

    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::FromStart,
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    assert_eq!(recv_event(&mut events).await.event_type, EventType::PlayerJoin);
    assert_eq!(recv_event(&mut events).await.event_type, EventType::PlayerLeft);
    assert_quiet(&mut events, Duration::from_millis(300)).await;
    assert!(errors.try_recv().is_err());

    engine.stop().await;
}

#[tokio::test]
async fn test_start_twice_keeps_first_channels() {
    let (dir, path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();

    let (mut events, _errors) = engine.start(&token).unwrap();
    assert!(matches!(engine.start(&token), Err(WatchError::AlreadyWatching)));

    tokio::time::sleep(SETTLE).await;
    append(&path, &join_line(0, "Still"));
    assert_eq!(player(&recv_event(&mut events).await), "Still");

    engine.stop().await;
}

#[tokio::test]
async fn test_repeated_stop_returns_immediately() {
    let (dir, _path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    tokio::time::timeout(support::WAIT, engine.stop())
        .await
        .expect("first stop");
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_millis(50), engine.stop())
            .await
            .expect("repeated stop");
    }
    assert_eq!(engine.state(), EngineState::Closed);
    assert_closed(&mut events).await;
    assert_closed(&mut errors).await;
}

#[tokio::test]
async fn test_concurrent_stop_calls() {
    let (dir, _path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, _errors) = engine.start(&token).unwrap();

    tokio::time::timeout(support::WAIT, async {
        tokio::join!(engine.stop(), engine.stop(), engine.stop());
    })
    .await
    .expect("concurrent stops");
    assert_closed(&mut events).await;
}

#[tokio::test]
async fn test_cancel_before_any_line_closes_channels() {
    let (dir, _path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    token.cancel();
    assert_closed(&mut events).await;
    assert_closed(&mut errors).await;

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Closed);
}

#[tokio::test]
async fn test_rotation_switches_to_new_file() {
    let (dir, path_a) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, _errors) = engine.start(&token).unwrap();

    tokio::time::sleep(SETTLE).await;
    append(&path_a, &join_line(0, "A1"));
    assert_eq!(player(&recv_event(&mut events).await), "A1");

    // B has history from before the switch; it is read from its start.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let path_b = dir.path().join("output_log_b.txt");
    std::fs::write(&path_b, join_line(1, "B1")).unwrap();
    assert_eq!(player(&recv_event(&mut events).await), "B1");

    append(&path_a, &join_line(2, "A2"));
    tokio::time::sleep(SETTLE).await;
    append(&path_b, &join_line(3, "B2"));
    assert_eq!(player(&recv_event(&mut events).await), "B2");
    assert_quiet(&mut events, Duration::from_millis(300)).await;

    engine.stop().await;
}

#[tokio::test]
async fn test_find_latest_failure_is_fatal_for_run() {
    let (dir, path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    std::fs::remove_file(&path).unwrap();

    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    let err = tokio::time::timeout(support::WAIT, errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(err.op(), Some(WatchOp::FindLatest));
    assert!(err.is_no_log_files());
    assert_closed(&mut events).await;
    assert_closed(&mut errors).await;

    engine.stop().await;
}

#[tokio::test]
async fn test_stop_on_parse_error_ends_run() {
    let content = format!(
        "{}2024.13.45 12:00:01 Log        -  [Behaviour] OnPlayerJoined Broken\n{}",
        join_line(0, "Before"),
        join_line(2, "After")
    );
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);
    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::FromStart,
        stop_on_parse_error: true,
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    assert_eq!(player(&recv_event(&mut events).await), "Before");
    assert_closed(&mut events).await;

    match errors.recv().await {
        Some(WatchError::Parse(e)) => assert!(e.line.contains("Broken")),
        other => panic!("expected parse error, got {other:?}"),
    }
    engine.stop().await;
}

#[tokio::test]
async fn test_parse_error_reported_and_skipped_by_default() {
    let content = format!(
        "{}2024.13.45 12:00:01 Log        -  [Behaviour] OnPlayerJoined Broken\n{}",
        join_line(0, "Before"),
        join_line(2, "After")
    );
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);
    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::FromStart,
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();

    assert_eq!(player(&recv_event(&mut events).await), "Before");
    assert_eq!(player(&recv_event(&mut events).await), "After");
    assert!(matches!(errors.recv().await, Some(WatchError::Parse(_))));

    engine.stop().await;
}

#[tokio::test]
async fn test_type_filter_and_raw_line() {
    let content = format!("{}{}", join_line(0, "A"), left_line(1, "A"));
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);
    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::FromStart,
        include_raw_line: true,
        exclude_types: vec![EventType::PlayerJoin],
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (mut events, _errors) = engine.start(&token).unwrap();

    let event = recv_event(&mut events).await;
    assert_eq!(event.event_type, EventType::PlayerLeft);
    assert_eq!(event.raw_line.as_deref(), Some(left_line(1, "A").trim_end()));

    engine.stop().await;
}

#[tokio::test]
async fn test_dropping_event_receiver_ends_run() {
    let content: String = (0..5).map(|i| join_line(i, &format!("U{i}"))).collect();
    let (dir, _path) = log_dir_with("output_log_a.txt", &content);
    let engine = WatchEngine::new(WatchConfig {
        replay: ReplayDirective::FromStart,
        ..config(&dir)
    })
    .unwrap();
    let token = CancellationToken::new();
    let (events, mut errors) = engine.start(&token).unwrap();

    drop(events);
    assert_closed(&mut errors).await;
    tokio::time::timeout(support::WAIT, engine.stop())
        .await
        .expect("stop after consumer left");
}

#[tokio::test]
async fn test_watch_convenience() {
    let (dir, path) = log_dir_with("output_log_a.txt", "");
    let token = CancellationToken::new();
    let (engine, mut events, _errors) = WatchEngine::watch(config(&dir), &token).unwrap();
    assert_eq!(engine.state(), EngineState::Watching);

    tokio::time::sleep(SETTLE).await;
    append(&path, &join_line(0, "Hello"));
    assert_eq!(player(&recv_event(&mut events).await), "Hello");

    token.cancel();
    assert_closed(&mut events).await;
    engine.stop().await;
}

async fn recv_error_with_op(
    errors: &mut tokio::sync::mpsc::Receiver<WatchError>,
    op: WatchOp,
) -> WatchError {
    loop {
        match tokio::time::timeout(support::WAIT, errors.recv()).await {
            Ok(Some(err)) if err.op() == Some(op) => return err,
            Ok(Some(_)) => {}
            Ok(None) => panic!("error channel closed"),
            Err(_) => panic!("timed out waiting for a {op} error"),
        }
    }
}

#[tokio::test]
async fn test_rotation_poll_failure_keeps_tailing() {
    let (dir, path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();
    tokio::time::sleep(SETTLE).await;

    let moved = dir.path().join("moved.txt");
    std::fs::rename(&path, &moved).unwrap();
    let err = recv_error_with_op(&mut errors, WatchOp::Rotation).await;
    assert!(err.is_no_log_files());

    std::fs::rename(&moved, &path).unwrap();
    append(&path, &join_line(0, "Still"));
    assert_eq!(player(&recv_event(&mut events).await), "Still");
    assert_eq!(engine.state(), EngineState::Watching);

    engine.stop().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_tail_read_failure_reported_and_recovered() {
    let (dir, path) = log_dir_with("output_log_a.txt", "");
    let engine = WatchEngine::new(config(&dir)).unwrap();
    let token = CancellationToken::new();
    let (mut events, mut errors) = engine.start(&token).unwrap();
    tokio::time::sleep(SETTLE).await;

    // A directory at the tailed path opens but cannot be read.
    std::fs::rename(&path, dir.path().join("moved.txt")).unwrap();
    std::fs::create_dir(&path).unwrap();
    let err = recv_error_with_op(&mut errors, WatchOp::Tail).await;
    assert!(err.to_string().contains("output_log_a.txt"));

    std::fs::remove_dir(&path).unwrap();
    std::fs::write(&path, join_line(0, "Back")).unwrap();
    assert_eq!(player(&recv_event(&mut events).await), "Back");

    engine.stop().await;
}
