//! Log tailer supervision tests

use std::time::Duration;

use fleetroll::deploy::LogTailer;
use fleetroll::remote::{OutputChunk, Stream};

use crate::support::{deploy_file, instance, registry_from, with_app, FakeTransport};

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_one_task_per_instance() {
    let transport = FakeTransport::new();
    transport.state().stream_output = vec![
        OutputChunk {
            stream: Stream::Stdout,
            data: b"GET /up 200\npartial".to_vec(),
        },
        OutputChunk {
            stream: Stream::Stderr,
            data: b"warn: slow\n".to_vec(),
        },
    ];
    let registry = registry_from(deploy_file());
    let deploy = registry.deploy("app").unwrap();
    let tailer = LogTailer::new(transport.clone());

    tailer.start(&deploy, &instance("i-a"));
    tailer.start(&deploy, &instance("i-a"));
    tailer.start(&deploy, &instance("i-b"));
    settle().await;

    assert_eq!(tailer.len(), 2);
    assert!(tailer.is_tailing("i-a"));
    {
        let state = transport.state();
        assert_eq!(state.streams_started, 2);
        assert_eq!(state.streams_open, 2);
        assert!(state
            .exec_log
            .iter()
            .all(|(_, c)| c == "tail -n 0 -F /var/log/app.log"));
    }

    tailer.stop_all().await;
    assert!(tailer.is_empty());
    let state = transport.state();
    assert_eq!(state.streams_open, 0);
    assert_eq!(state.sessions_closed, 2);
}

#[tokio::test]
async fn test_disabled_tailing_starts_nothing() {
    let transport = FakeTransport::new();
    let registry = registry_from(with_app(|app| app["tail_logs"] = false.into()));
    let deploy = registry.deploy("app").unwrap();
    let tailer = LogTailer::new(transport.clone());

    tailer.start(&deploy, &instance("i-a"));
    assert!(tailer.is_empty());

    let registry = registry_from(with_app(|app| app["log_files"] = serde_json::json!([])));
    let deploy = registry.deploy("app").unwrap();
    tailer.start(&deploy, &instance("i-a"));
    assert!(tailer.is_empty());
}

#[tokio::test]
async fn test_finished_task_is_replaced() {
    let transport = FakeTransport::new();
    transport.state().unreachable.insert(crate::support::host("i-a"));
    let registry = registry_from(deploy_file());
    let deploy = registry.deploy("app").unwrap();
    let tailer = LogTailer::new(transport.clone());

    tailer.start(&deploy, &instance("i-a"));
    settle().await;
    assert!(!tailer.is_tailing("i-a"));

    transport.state().unreachable.clear();
    tailer.start(&deploy, &instance("i-a"));
    settle().await;
    assert!(tailer.is_tailing("i-a"));
    assert_eq!(tailer.len(), 1);
    assert_eq!(transport.state().streams_started, 1);

    tailer.stop_all().await;
}

#[tokio::test]
async fn test_drop_aborts_tasks() {
    let transport = FakeTransport::new();
    let registry = registry_from(deploy_file());
    let deploy = registry.deploy("app").unwrap();

    let tailer = LogTailer::new(transport.clone());
    tailer.start(&deploy, &instance("i-a"));
    settle().await;
    assert_eq!(transport.state().streams_open, 1);

    drop(tailer);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.state().streams_open, 0);
}

#[tokio::test]
async fn test_dropped_scope_aborts_tasks_tailer_keeps_running() {
    let transport = FakeTransport::new();
    let registry = registry_from(deploy_file());
    let deploy = registry.deploy("app").unwrap();
    let tailer = LogTailer::new(transport.clone());

    {
        let _scope = tailer.scope();
        tailer.start(&deploy, &instance("i-a"));
        tailer.start(&deploy, &instance("i-b"));
        settle().await;
        assert_eq!(transport.state().streams_open, 2);
    }

    assert!(tailer.is_empty());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.state().streams_open, 0);

    tailer.start(&deploy, &instance("i-a"));
    settle().await;
    assert!(tailer.is_tailing("i-a"));
    tailer.scope().stop().await;
    assert!(tailer.is_empty());
    assert_eq!(transport.state().streams_open, 0);
}
