#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Process bridge against real child processes.
//!
//! Uses `cat`, `sh` and `sleep` from the host system.

use std::sync::Arc;
use std::time::Duration;

use pipebridge_core::{FanoutPolicy, Message, OverflowPolicy};
use pipebridge_daemon::subprocess::{BridgeConfig, BridgeError, BridgeState, ProcessBridge, Pushed};

const STEP: Duration = Duration::from_secs(5);

fn sh(script: &str) -> BridgeConfig {
    BridgeConfig::new("sh").with_args(["-c", script])
}

/// Read output until the bridge reports end-of-stream.
async fn drain(bridge: &ProcessBridge) -> Vec<Message> {
    let mut out = Vec::new();
    while let Some(message) = tokio::time::timeout(STEP, bridge.next_output())
        .await
        .expect("output stalled")
    {
        out.push(message);
    }
    out
}

/// A child that never reads stdin, with the stdin writer parked on a full
/// pipe so the input queue fills deterministically.
async fn stalled_bridge(capacity: usize, overflow: OverflowPolicy) -> Arc<ProcessBridge> {
    let config = BridgeConfig::new("sleep")
        .with_args(["30"])
        .with_input_capacity(capacity, overflow)
        .with_terminate_timeout(Duration::from_millis(200));
    let bridge = Arc::new(ProcessBridge::start(config).unwrap());

    bridge.submit(vec![b'x'; 1024 * 1024]).await.unwrap();
    tokio::time::timeout(STEP, async {
        while bridge.pending_input() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("writer never picked up the first line");
    bridge
}

#[tokio::test]
async fn output_preserves_submission_order() {
    let bridge = ProcessBridge::start(BridgeConfig::new("cat")).unwrap();
    for i in 0..50 {
        bridge.submit(format!("line {i}")).await.unwrap();
    }
    for i in 0..50 {
        let message = tokio::time::timeout(STEP, bridge.next_output()).await.unwrap();
        assert_eq!(message, Some(Message::Info(format!("line {i}").into_bytes())));
    }
    bridge.stop().await;
}

#[tokio::test]
async fn stderr_is_tagged_as_error() {
    let bridge = ProcessBridge::start(sh("echo out; echo err >&2")).unwrap();
    let out = drain(&bridge).await;

    assert!(out.contains(&Message::Info(b"out".to_vec())));
    assert!(out.contains(&Message::Error(b"err".to_vec())));
    assert_eq!(out.last(), Some(&Message::Raw("EXIT: 0".into())));
}

#[tokio::test]
async fn exit_is_terminal() {
    let bridge = ProcessBridge::start(sh("exit 3")).unwrap();

    let state = tokio::time::timeout(STEP, bridge.wait_terminated()).await.unwrap();
    assert_eq!(state, BridgeState::Terminated { exit_code: Some(3) });
    assert!(bridge.is_terminated());

    let result = bridge.submit("too late").await;
    assert!(matches!(result, Err(BridgeError::ProcessUnavailable)));

    assert_eq!(drain(&bridge).await, vec![Message::Raw("EXIT: 3".into())]);
    assert_eq!(bridge.next_output().await, None);
}

#[tokio::test]
async fn long_lines_are_split() {
    let config = sh("printf 'abcdef\\n'").with_max_line_bytes(4);
    let bridge = ProcessBridge::start(config).unwrap();
    let out = drain(&bridge).await;
    assert_eq!(
        out,
        vec![
            Message::Info(b"abcd".to_vec()),
            Message::Info(b"ef".to_vec()),
            Message::Raw("EXIT: 0".into()),
        ]
    );
}

#[tokio::test]
async fn reject_policy_refuses_when_full() {
    let bridge = stalled_bridge(1, OverflowPolicy::Reject).await;

    assert_eq!(bridge.submit("a").await.unwrap(), Pushed::Queued);
    let result = bridge.submit("b").await;
    assert!(matches!(result, Err(BridgeError::QueueFull { capacity: 1 })));
    assert_eq!(bridge.pending_input(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn drop_oldest_policy_keeps_newest() {
    let bridge = stalled_bridge(1, OverflowPolicy::DropOldest).await;

    assert_eq!(bridge.submit("a").await.unwrap(), Pushed::Queued);
    assert_eq!(bridge.submit("b").await.unwrap(), Pushed::DroppedOldest);
    assert_eq!(bridge.pending_input(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn block_policy_suspends_until_stop() {
    let bridge = stalled_bridge(1, OverflowPolicy::Block).await;
    bridge.submit("a").await.unwrap();

    let blocked = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.submit("b").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let state = tokio::time::timeout(STEP, bridge.stop()).await.unwrap();
    assert!(state.is_terminated());
    let result = tokio::time::timeout(STEP, blocked).await.unwrap().unwrap();
    assert!(matches!(result, Err(BridgeError::ProcessUnavailable)));
}

#[tokio::test]
async fn stop_delivers_queued_input_first() {
    let bridge = ProcessBridge::start(BridgeConfig::new("cat")).unwrap();
    for line in ["one", "two", "three"] {
        bridge.submit(line).await.unwrap();
    }

    let state = tokio::time::timeout(STEP, bridge.stop()).await.unwrap();
    assert_eq!(state, BridgeState::Terminated { exit_code: Some(0) });

    let out = drain(&bridge).await;
    assert_eq!(
        out,
        vec![
            Message::Info(b"one".to_vec()),
            Message::Info(b"two".to_vec()),
            Message::Info(b"three".to_vec()),
            Message::Raw("EXIT: 0".into()),
        ]
    );
}

#[tokio::test]
async fn stop_escalates_to_kill() {
    let config = sh("trap '' INT; exec sleep 30").with_terminate_timeout(Duration::from_millis(100));
    let bridge = ProcessBridge::start(config).unwrap();

    let state = tokio::time::timeout(STEP, bridge.stop()).await.unwrap();
    assert_eq!(state, BridgeState::Terminated { exit_code: None });
    assert_eq!(drain(&bridge).await, vec![Message::Raw("EXIT: signal".into())]);
}

#[tokio::test]
async fn single_consumer_delivers_once() {
    let bridge = ProcessBridge::start(BridgeConfig::new("cat")).unwrap();
    let mut first = bridge.subscribe();
    let mut second = bridge.subscribe();

    bridge.submit("only once").await.unwrap();
    let got = tokio::time::timeout(STEP, first.recv()).await.unwrap();
    assert_eq!(got, Some(Message::Info(b"only once".to_vec())));

    let other = tokio::time::timeout(Duration::from_millis(200), second.recv()).await;
    assert!(other.is_err(), "second consumer must not see the same message");

    bridge.stop().await;
}

#[tokio::test]
async fn broadcast_delivers_to_every_subscriber() {
    let config = BridgeConfig::new("cat").with_fanout(FanoutPolicy::Broadcast);
    let bridge = ProcessBridge::start(config).unwrap();
    let mut first = bridge.subscribe();
    let mut second = bridge.subscribe();

    bridge.submit("hello all").await.unwrap();
    let expected = Some(Message::Info(b"hello all".to_vec()));
    assert_eq!(tokio::time::timeout(STEP, first.recv()).await.unwrap(), expected);
    assert_eq!(tokio::time::timeout(STEP, second.recv()).await.unwrap(), expected);

    bridge.stop().await;
    assert_eq!(
        tokio::time::timeout(STEP, first.recv()).await.unwrap(),
        Some(Message::Raw("EXIT: 0".into()))
    );
    assert_eq!(tokio::time::timeout(STEP, first.recv()).await.unwrap(), None);
}
