//! RPC client against a scripted `/bin/sh` assistant.
//!
//! Requests serialize with sorted keys, so every request line starts with
//! `{"id":N,`; the scripts pull the id out with sed and answer by id.

use std::time::Duration;

use serde_json::json;
use switchboard::rpc::{ConnectionState, RpcClient, RpcConfig, RpcError, RpcEvent};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

/// Shell prelude: `respond LINE RESULT_JSON` answers the request in LINE,
/// `handshake` answers `initialize` and consumes `initialized`.
const PRELUDE: &str = r#"
respond() {
  id=$(printf '%s\n' "$1" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  printf '{"id":%s,"result":%s}\n' "$id" "$2"
}
handshake() {
  read -r init
  respond "$init" '{"serverInfo":"fake"}'
  read -r initialized
}
"#;

fn client_for(script: &str) -> RpcClient {
    RpcClient::new(RpcConfig {
        args: vec!["-c".to_string(), format!("{PRELUDE}\n{script}")],
        ..RpcConfig::new("/bin/sh")
    })
}

async fn next_event(events: &mut broadcast::Receiver<RpcEvent>) -> RpcEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

async fn wait_for_pending(client: &RpcClient, count: usize) {
    tokio::time::timeout(WAIT, async {
        while client.pending_requests() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("requests registered");
}

#[tokio::test]
async fn test_start_reaches_initialized_and_serves_requests() {
    let client = client_for(
        r#"handshake
while read -r line; do respond "$line" '"pong"'; done"#,
    );
    let mut events = client.subscribe();

    tokio::time::timeout(WAIT, client.start()).await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Initialized);

    let mut states = Vec::new();
    while states.last() != Some(&ConnectionState::Initialized) {
        if let RpcEvent::StateChanged { state, .. } = next_event(&mut events).await {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Spawning,
            ConnectionState::Connected,
            ConnectionState::Initialized
        ]
    );

    let result = client.send_request("ping", None, None).await.unwrap();
    assert_eq!(result, json!("pong"));

    // start() is idempotent once initialized.
    client.start().await.unwrap();
    client.stop();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_start_spawns_once() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("spawns");
    let client = client_for(&format!(
        r#"echo spawned >> '{}'
handshake
cat > /dev/null"#,
        marker.display()
    ));

    let (a, b, c) = tokio::join!(client.start(), client.start(), client.start());
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let spawns = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(spawns.lines().count(), 1);
    client.stop();
}

#[tokio::test]
async fn test_process_exit_rejects_all_pending() {
    let client = client_for(
        r#"handshake
read -r a; read -r b; read -r c
exit 7"#,
    );
    client.start().await.unwrap();
    let mut events = client.subscribe();

    let (a, b, c) = tokio::join!(
        client.send_request("one", None, None),
        client.send_request("two", None, None),
        client.send_request("three", None, None),
    );
    for result in [a, b, c] {
        assert!(matches!(result, Err(RpcError::ProcessExited { code: Some(7) })));
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(
        next_event(&mut events).await,
        RpcEvent::StateChanged {
            state: ConnectionState::Disconnected,
            exit_code: Some(7)
        }
    );

    // No implicit restart.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_stop_rejects_pending_exactly_once() {
    let client = client_for("handshake\ncat > /dev/null");
    client.start().await.unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send_request("never", None, None).await }
    });
    wait_for_pending(&client, 1).await;

    client.stop();
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(RpcError::Stopped)));
    assert_eq!(client.pending_requests(), 0);

    client.stop();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.send_request("after-stop", None, None).await,
        Err(RpcError::NotRunning)
    ));
}

#[tokio::test]
async fn test_timeout_then_late_response_is_dropped() {
    let client = client_for(
        r#"handshake
read -r slow
sleep 0.3
respond "$slow" '"late"'
while read -r line; do respond "$line" '"fresh"'; done"#,
    );
    client.start().await.unwrap();

    let result = client
        .send_request("slow", None, Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(
        result,
        Err(RpcError::Timeout { ref method, timeout_ms: 50 }) if method == "slow"
    ));
    assert_eq!(client.pending_requests(), 0);

    let fresh = client.send_request("next", None, None).await.unwrap();
    assert_eq!(fresh, json!("fresh"));
    client.stop();
}

#[tokio::test]
async fn test_invalid_lines_do_not_break_the_stream() {
    let client = client_for(
        r#"handshake
echo 'this is not json'
echo '{"broken":'
while read -r line; do respond "$line" '{"ok":true}'; done"#,
    );
    client.start().await.unwrap();
    let result = client.send_request("check", None, None).await.unwrap();
    assert_eq!(result, json!({"ok": true}));
    client.stop();
}

#[tokio::test]
async fn test_notifications_and_peer_requests_are_events() {
    let client = client_for(
        r#"handshake
read -r go
printf '{"method":"thread/started","params":{"thread":"t1"}}\n'
printf '{"id":99,"method":"exec/approve","params":{"cmd":"ls"}}\n'
read -r reply
printf '{"method":"echo","params":%s}\n' "$reply"
cat > /dev/null"#,
    );
    client.start().await.unwrap();
    let mut events = client.subscribe();
    client.send_notification("go", None).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        RpcEvent::Notification {
            method: "thread/started".to_string(),
            params: json!({"thread": "t1"})
        }
    );
    let RpcEvent::Request { id, method, params } = next_event(&mut events).await else {
        panic!("expected a peer request");
    };
    assert_eq!(id, json!(99));
    assert_eq!(method, "exec/approve");
    assert_eq!(params["cmd"], "ls");

    client.respond(&id, Ok(json!({"decision": "approved"}))).unwrap();
    let RpcEvent::Notification { method, params } = next_event(&mut events).await else {
        panic!("expected echo notification");
    };
    assert_eq!(method, "echo");
    assert_eq!(params, json!({"id": 99, "result": {"decision": "approved"}}));
    client.stop();
}

#[tokio::test]
async fn test_error_response_is_application_error() {
    let client = client_for(
        r#"handshake
read -r line
id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
printf '{"id":%s,"error":{"code":-32601,"message":"unknown method"}}\n' "$id"
cat > /dev/null"#,
    );
    client.start().await.unwrap();
    let err = client.send_request("nope", None, None).await.unwrap_err();
    match err {
        RpcError::Application(value) => assert_eq!(value["message"], "unknown method"),
        other => panic!("unexpected error: {other:?}"),
    }
    client.stop();
}

#[tokio::test]
async fn test_response_without_result_or_error_is_protocol_error() {
    let client = client_for(
        r#"handshake
read -r line
id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
printf '{"id":%s}\n' "$id"
cat > /dev/null"#,
    );
    client.start().await.unwrap();
    let err = client.send_request("bare", None, None).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)), "unexpected error: {err:?}");
    assert_eq!(client.pending_requests(), 0);
    client.stop();
}

#[tokio::test]
async fn test_initialize_failure_resets_to_disconnected() {
    // Stays alive after refusing, so only the client can clear the state.
    let client = client_for(
        r#"read -r init
id=$(printf '%s\n' "$init" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
printf '{"id":%s,"error":{"code":-32002,"message":"not ready"}}\n' "$id"
cat > /dev/null"#,
    );
    let mut events = client.subscribe();

    let err = tokio::time::timeout(WAIT, client.start()).await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Application(_)), "unexpected error: {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        if let RpcEvent::StateChanged { state, .. } = event {
            last = Some(state);
        }
    }
    assert_eq!(last, Some(ConnectionState::Disconnected));

    // The next attempt spawns a fresh process and gets its own refusal.
    let again = tokio::time::timeout(WAIT, client.start()).await.unwrap();
    assert!(matches!(again, Err(RpcError::Application(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_dropped_caller_does_not_leak_pending_entry() {
    let client = client_for("handshake\ncat > /dev/null");
    client.start().await.unwrap();

    let outer = tokio::time::timeout(
        Duration::from_millis(50),
        client.send_request("abandoned", None, Some(Duration::from_secs(30))),
    )
    .await;
    assert!(outer.is_err());
    assert_eq!(client.pending_requests(), 0);
    client.stop();
}

#[tokio::test]
async fn test_spawn_failure_returns_to_disconnected() {
    let client = RpcClient::new(RpcConfig::new("/nonexistent/assistant-binary"));
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RpcError::Spawn(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    // A failed attempt does not wedge later ones.
    assert!(matches!(client.start().await, Err(RpcError::Spawn(_))));
}
