mod common;

use helmsman::core::environment::{EnvironmentStats, PowerPhase};
use helmsman::core::events::{sink_pair, topic};
use helmsman::core::server::PowerAction;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn started(server: &std::sync::Arc<helmsman::core::server::Server>) {
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.phase(), PowerPhase::Running);
}

#[tokio::test]
async fn test_unexpected_exit_triggers_restart() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    started(&server).await;

    let (sink, mut rx) = sink_pair(64);
    server.events().subscribe(sink, &[topic::DAEMON_MESSAGE]);

    env.simulate_exit(137);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The crash was announced with its exit details.
    let banner = rx.recv().await.unwrap();
    assert!(banner.payload_string().contains("crashed state"));
    let code = rx.recv().await.unwrap();
    assert_eq!(code.payload_string(), "Exit code: 137");
    let oom = rx.recv().await.unwrap();
    assert_eq!(oom.payload_string(), "Out of memory: false");

    // And an automatic restart happened.
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.phase(), PowerPhase::Running);
}

#[tokio::test]
async fn test_second_crash_within_window_is_not_restarted() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    started(&server).await;

    env.simulate_exit(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 2);

    let (sink, mut rx) = sink_pair(64);
    server.events().subscribe(sink, &[topic::DAEMON_MESSAGE]);

    // Crash again inside the 60 second window: supervision gives up.
    env.simulate_exit(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.phase(), PowerPhase::Offline);

    let mut saw_abort = false;
    while let Ok(event) = rx.try_recv() {
        if event.payload_string().contains("Aborting automatic restart") {
            saw_abort = true;
        }
    }
    assert!(saw_abort);
}

#[tokio::test]
async fn test_requested_stop_is_not_a_crash() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    started(&server).await;

    server
        .handle_power_action(PowerAction::Stop, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.phase(), PowerPhase::Offline);
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_crash_detection_disabled_leaves_server_offline() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());

    let mut configuration = (*server.configuration()).clone();
    configuration.crash_detection_enabled = false;
    server.update_configuration(configuration).await;
    started(&server).await;

    env.simulate_exit(1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.phase(), PowerPhase::Offline);
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stats_samples_become_stats_events() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    started(&server).await;

    let (sink, mut rx) = sink_pair(16);
    server.events().subscribe(sink, &[topic::STATS]);

    env.emit_stats(EnvironmentStats {
        memory_bytes: 1024,
        memory_limit_bytes: 4096,
        cpu_absolute: 42.123,
        network_rx_bytes: 10,
        network_tx_bytes: 20,
        uptime_ms: 5000,
    });

    let event = rx.recv().await.unwrap();
    let payload: serde_json::Value = event.payload;
    assert_eq!(payload["memory_bytes"], 1024);
    assert_eq!(payload["cpu_absolute"], 42.123);
    assert_eq!(payload["state"], "running");

    let usage = server.last_resource_usage();
    assert_eq!(usage.memory_bytes, 1024);
    assert_eq!(usage.network.rx_bytes, 10);
}

#[tokio::test]
async fn test_background_panic_surfaces_as_daemon_error() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    env.panic_on_poll.store(true, Ordering::SeqCst);

    let (sink, mut rx) = sink_pair(16);
    server.events().subscribe(sink, &[topic::DAEMON_ERROR]);

    // Starting spawns the resource poller, which blows up immediately;
    // the panic must be recovered and announced, not swallowed.
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.topic, topic::DAEMON_ERROR);
    assert!(
        event
            .payload_string()
            .contains("an unexpected error was encountered")
    );
    // The server itself is unharmed.
    assert_eq!(server.phase(), PowerPhase::Running);
}

#[tokio::test]
async fn test_console_lines_are_buffered_and_published() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());

    let (sink, mut rx) = sink_pair(16);
    server.events().subscribe(sink, &[topic::CONSOLE_OUTPUT]);

    let hooks = env.hooks.lock().as_ref().unwrap().clone();
    (hooks.on_output)("[Server] Starting".to_string());
    (hooks.on_output)("[Server] Done".to_string());

    assert_eq!(rx.recv().await.unwrap().payload_string(), "[Server] Starting");
    assert_eq!(rx.recv().await.unwrap().payload_string(), "[Server] Done");
    assert_eq!(
        server.recent_logs(),
        vec!["[Server] Starting".to_string(), "[Server] Done".to_string()]
    );
}
