mod common;

use helmsman::core::environment::PowerPhase;
use helmsman::core::errors::HelmsmanError;
use helmsman::core::events::{sink_pair, topic};
use helmsman::core::server::PowerAction;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_start_transitions_offline_starting_running() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());

    let (sink, mut rx) = sink_pair(16);
    server.events().subscribe(sink, &[topic::STATUS]);

    assert_eq!(server.phase(), PowerPhase::Offline);
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();

    // `running` is reported by the environment hook on a spawned task.
    let starting = rx.recv().await.unwrap();
    assert_eq!(starting.payload_string(), "starting");
    let running = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.payload_string(), "running");
    assert_eq!(server.phase(), PowerPhase::Running);
}

#[tokio::test]
async fn test_start_while_running_is_rejected() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());

    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    let err = server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HelmsmanError::IsRunning));
}

#[tokio::test]
async fn test_concurrent_power_actions_are_mutually_exclusive() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    env.set_start_delay(Duration::from_millis(500));

    let first = server.clone();
    let task = tokio::spawn(async move {
        first.handle_power_action(PowerAction::Start, None).await
    });

    // Give the first caller time to take the lock.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = server
        .handle_power_action(PowerAction::Start, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, HelmsmanError::PowerActionInProgress));
    assert_eq!(
        err.to_string(),
        "another power action is currently being processed for this server, please try again later"
    );

    task.await.unwrap().unwrap();
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_and_kill_require_a_running_server() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());

    for action in [PowerAction::Stop, PowerAction::Restart, PowerAction::Kill] {
        let err = server.handle_power_action(action, None).await.unwrap_err();
        assert!(matches!(err, HelmsmanError::IsOffline), "{action} should be rejected");
    }
}

#[tokio::test]
async fn test_stop_publishes_stopping_then_offline() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (sink, mut rx) = sink_pair(16);
    server.events().subscribe(sink, &[topic::STATUS]);

    server
        .handle_power_action(PowerAction::Stop, None)
        .await
        .unwrap();

    let stopping = rx.recv().await.unwrap();
    assert_eq!(stopping.payload_string(), "stopping");
    let offline = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(offline.payload_string(), "offline");
}

#[tokio::test]
async fn test_restart_cycles_back_to_running() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());
    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server
        .handle_power_action(PowerAction::Restart, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.phase(), PowerPhase::Running);
    assert_eq!(env.start_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_suspended_server_cannot_start() {
    let base = tempfile::tempdir().unwrap();
    let (server, _env) = common::build_server(base.path());

    let mut configuration = (*server.configuration()).clone();
    configuration.suspended = true;
    server.update_configuration(configuration).await;

    let err = server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HelmsmanError::Suspended));
}

#[tokio::test]
async fn test_send_command_requires_running_server() {
    let base = tempfile::tempdir().unwrap();
    let (server, env) = common::build_server(base.path());

    let err = server.send_command("say hi").await.unwrap_err();
    assert!(matches!(err, HelmsmanError::IsOffline));

    server
        .handle_power_action(PowerAction::Start, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.send_command("say hi").await.unwrap();
    assert_eq!(env.sent_commands.lock().as_slice(), ["say hi".to_string()]);
}
