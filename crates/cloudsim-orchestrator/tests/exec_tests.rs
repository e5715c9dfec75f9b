//! Exec gateway behavior: session policy, lifecycle coupling, streaming.

mod common;

use std::time::Duration;

use cloudsim_orchestrator::{Error, ManagerConfig};
use common::{harness, harness_with, params};

fn shell() -> Option<Vec<String>> {
    Some(vec!["/bin/sh".to_string()])
}

#[tokio::test]
async fn test_session_streams_bytes_both_ways() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let mut session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    session.send(b"echo hello\n").await.unwrap();

    let mut collected = Vec::new();
    while !String::from_utf8_lossy(&collected).contains("echo hello") {
        let chunk = session.recv().await.expect("stream ended early").unwrap();
        collected.extend(chunk);
    }
    session.close().await;
    assert!(!h.gateway.has_session(&record.id));
}

#[tokio::test]
async fn test_session_requires_running_instance() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();
    h.manager.stop(&record.id).await.unwrap();

    assert!(matches!(
        h.gateway.open_session(&record.id, shell()).await,
        Err(Error::InstanceNotRunning(_))
    ));
}

#[tokio::test]
async fn test_second_session_is_rejected() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    assert!(matches!(
        h.gateway.open_session(&record.id, shell()).await,
        Err(Error::SessionAlreadyOpen(_))
    ));
    // One-shot commands go through the same policy.
    assert!(matches!(
        h.gateway
            .run_command(&record.id, vec!["ls".to_string()])
            .await,
        Err(Error::SessionAlreadyOpen(_))
    ));

    // Closing releases the slot for the next caller.
    session.close().await;
    let session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    drop(session);
    assert!(!h.gateway.has_session(&record.id));
}

#[tokio::test]
async fn test_dropped_session_releases_slot() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    assert_eq!(h.gateway.active_sessions(), 1);
    drop(session);
    assert_eq!(h.gateway.active_sessions(), 0);

    assert!(h.gateway.open_session(&record.id, shell()).await.is_ok());
}

#[tokio::test]
async fn test_stop_force_closes_session() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let mut session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    h.manager.stop(&record.id).await.unwrap();
    assert!(!h.gateway.has_session(&record.id));

    // Drain: the stream ends instead of hanging on a dead container.
    while let Some(chunk) = session.recv().await {
        chunk.unwrap();
    }
    assert!(session.send(b"anyone there?\n").await.is_err());
}

#[tokio::test]
async fn test_terminate_force_closes_session_and_blocks_new_ones() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let _session = h.gateway.open_session(&record.id, shell()).await.unwrap();
    h.manager.terminate(&record.id).await.unwrap();
    assert!(!h.gateway.has_session(&record.id));

    assert!(matches!(
        h.gateway.open_session(&record.id, shell()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_run_command_collects_output() {
    let h = harness().await;
    let record = h.manager.create(params("base")).await.unwrap();

    let output = h
        .gateway
        .run_command(&record.id, vec!["uname".to_string(), "-a".to_string()])
        .await
        .unwrap();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("uname -a"));

    // The one-shot session released its slot.
    assert!(!h.gateway.has_session(&record.id));
}

#[tokio::test]
async fn test_slow_exec_setup_times_out_and_releases_slot() {
    let h = harness_with(ManagerConfig {
        op_timeout: Duration::from_millis(50),
        stop_timeout_secs: 1,
    })
    .await;
    let record = h.manager.create(params("base")).await.unwrap();

    h.engine.set_latency(Duration::from_millis(200)).await;
    let err = h
        .gateway
        .open_session(&record.id, shell())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeFailed(_)));
    assert!(!h.gateway.has_session(&record.id));

    // The reserved slot was released; a later open succeeds.
    h.engine.set_latency(Duration::ZERO).await;
    assert!(h.gateway.open_session(&record.id, shell()).await.is_ok());
}

#[tokio::test]
async fn test_session_on_unknown_instance_is_not_found() {
    let h = harness().await;
    assert!(matches!(
        h.gateway.open_session("i-doesnotexist", shell()).await,
        Err(Error::NotFound(_))
    ));
}
