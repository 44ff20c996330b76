//! Integration tests for the CDP transport and client.
//!
//! Each test spins up a mock WebSocket endpoint with configurable behavior,
//! connects a `CdpClient`, and verifies the wire contract: correlation,
//! timeouts, event routing, and the no-retry failure semantics.

#![allow(clippy::needless_pass_by_value)]

use std::net::SocketAddr;
use std::time::Duration;

use chromepilot::cdp::{CdpClient, CdpConfig, CdpError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Mock endpoint helpers
// =============================================================================

/// Echo `{"id": N, "result": {}}` for every command, preserving sessionId.
async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(Message::Text(text))) = source.next().await {
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let mut response = json!({"id": cmd["id"], "result": {}});
                    if let Some(sid) = cmd.get("sessionId") {
                        response["sessionId"] = sid.clone();
                    }
                    sink.send(Message::Text(response.to_string().into()))
                        .await
                        .unwrap();
                }
            });
        }
    });
    addr
}

/// Accept commands but never respond.
async fn start_silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (_sink, mut source) = ws.split();
                while source.next().await.is_some() {}
            });
        }
    });
    addr
}

/// Return a protocol error for every command.
async fn start_protocol_error_server(code: i64, message: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(Message::Text(text))) = source.next().await {
                    let cmd: Value = serde_json::from_str(&text).unwrap();
                    let response = json!({
                        "id": cmd["id"],
                        "error": {"code": code, "message": message}
                    });
                    sink.send(Message::Text(response.to_string().into()))
                        .await
                        .unwrap();
                }
            });
        }
    });
    addr
}

/// Close the connection without responding to the first command.
async fn start_hangup_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (sink, mut source) = ws.split();
                let _ = source.next().await;
                drop(sink);
            });
        }
    });
    addr
}

/// Send one unparseable frame in response to the first command.
async fn start_garbage_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut source) = ws.split();
                let _ = source.next().await;
                sink.send(Message::Text("this is not CDP json{".into()))
                    .await
                    .unwrap();
                // Keep the socket open; poisoning must come from the frame,
                // not from a close.
                while source.next().await.is_some() {}
            });
        }
    });
    addr
}

/// Echo commands and emit test-driven events.
async fn start_event_server() -> (SocketAddr, mpsc::Sender<Value>) {
    let (event_tx, mut event_rx) = mpsc::channel::<Value>(32);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    msg = source.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let cmd: Value = serde_json::from_str(&text).unwrap();
                                let mut response = json!({"id": cmd["id"], "result": {}});
                                if cmd["method"] == "Target.attachToTarget" {
                                    response["result"] = json!({"sessionId": "sess-1"});
                                }
                                if let Some(sid) = cmd.get("sessionId") {
                                    response["sessionId"] = sid.clone();
                                }
                                sink.send(Message::Text(response.to_string().into()))
                                    .await
                                    .unwrap();
                            }
                            None | Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        sink.send(Message::Text(event.to_string().into()))
                            .await
                            .unwrap();
                    }
                }
            }
        }
    });
    (addr, event_tx)
}

/// Respond out of order: buffer the first command, answer the second first.
async fn start_reordering_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            let mut held: Option<Value> = None;
            while let Some(Ok(Message::Text(text))) = source.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                if held.is_none() {
                    held = Some(cmd);
                    continue;
                }
                let second = json!({"id": cmd["id"], "result": {"order": "second-first"}});
                sink.send(Message::Text(second.to_string().into()))
                    .await
                    .unwrap();
                let first = held.take().unwrap();
                let response = json!({"id": first["id"], "result": {"order": "first-second"}});
                sink.send(Message::Text(response.to_string().into()))
                    .await
                    .unwrap();
            }
        }
    });
    addr
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

fn quick_config() -> CdpConfig {
    CdpConfig {
        connect_timeout: Duration::from_secs(5),
        command_timeout: Duration::from_millis(500),
        channel_capacity: 256,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn connect_and_send_command() {
    let addr = start_echo_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();
    assert!(client.is_connected());

    let result = client.send_command("Browser.getVersion", None).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn connect_refused_is_a_connection_error() {
    // Bind-then-drop yields a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = CdpClient::connect(&ws_url(addr), quick_config()).await;
    assert!(matches!(
        result,
        Err(CdpError::Connection(_) | CdpError::ConnectionTimeout)
    ));
}

#[tokio::test]
async fn command_timeout_names_the_method() {
    let addr = start_silent_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let result = client.send_command("Page.navigate", None).await;
    match result {
        Err(CdpError::CommandTimeout { method }) => assert_eq!(method, "Page.navigate"),
        other => panic!("expected CommandTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn protocol_error_carries_code_and_message() {
    let addr = start_protocol_error_server(-32000, "No target with given id found").await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let result = client
        .send_command("Target.attachToTarget", Some(json!({"targetId": "nope"})))
        .await;
    match result {
        Err(CdpError::Protocol { code, message }) => {
            assert_eq!(code, -32000);
            assert!(message.contains("No target"));
        }
        other => panic!("expected Protocol, got {other:?}"),
    }
}

#[tokio::test]
async fn hangup_fails_inflight_command_with_transport_gone() {
    let addr = start_hangup_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let result = client.send_command("Browser.getVersion", None).await;
    assert!(matches!(result, Err(CdpError::TransportGone)));

    // The transport task has exited; further sends fail fast without retry.
    let result = client.send_command("Browser.getVersion", None).await;
    assert!(result.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn malformed_frame_poisons_the_connection() {
    let addr = start_garbage_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let result = client.send_command("Browser.getVersion", None).await;
    assert!(matches!(result, Err(CdpError::Poisoned(_))));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn out_of_order_replies_are_correlated() {
    let addr = start_reordering_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let (first, second) = tokio::join!(
        client.send_command("First.method", None),
        client.send_command("Second.method", None),
    );
    assert_eq!(first.unwrap()["order"], "first-second");
    assert_eq!(second.unwrap()["order"], "second-first");
}

#[tokio::test]
async fn events_reach_browser_level_subscribers() {
    let (addr, event_tx) = start_event_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();

    let mut rx = client.subscribe("Target.targetCreated").await.unwrap();
    event_tx
        .send(json!({
            "method": "Target.targetCreated",
            "params": {"targetInfo": {"targetId": "T1", "type": "page", "url": "about:blank", "title": ""}}
        }))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.method, "Target.targetCreated");
    assert_eq!(event.params["targetInfo"]["targetId"], "T1");
}

#[tokio::test]
async fn session_scoped_events_are_routed_by_session_id() {
    let (addr, event_tx) = start_event_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();
    let session = client.attach("tab-1").await.unwrap();
    assert_eq!(session.session_id(), "sess-1");

    let mut session_rx = session.subscribe("Fetch.requestPaused").await.unwrap();
    let mut browser_rx = client.subscribe("Fetch.requestPaused").await.unwrap();

    event_tx
        .send(json!({
            "method": "Fetch.requestPaused",
            "sessionId": "sess-1",
            "params": {"requestId": "r1"}
        }))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), session_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.params["requestId"], "r1");

    // The browser-level subscriber must not see the session-scoped event.
    let stray = tokio::time::timeout(Duration::from_millis(200), browser_rx.recv()).await;
    assert!(stray.is_err());
}

#[tokio::test]
async fn attach_without_session_id_is_invalid_response() {
    let addr = start_echo_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();
    // The echo server answers attachToTarget with an empty result; the
    // client must reject the missing sessionId rather than fabricate one.
    let attach = client.attach("t").await;
    assert!(matches!(attach, Err(CdpError::InvalidResponse(_))));
}

#[tokio::test]
async fn subscribers_observe_closure_on_hangup() {
    let addr = start_hangup_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();
    let mut rx = client.subscribe("Network.requestWillBeSent").await.unwrap();

    // Trigger the hangup.
    let _ = client.send_command("Browser.getVersion", None).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert!(closed.is_none(), "stream should close when transport dies");
}

#[tokio::test]
async fn close_shuts_down_cleanly() {
    let addr = start_echo_server().await;
    let client = CdpClient::connect(&ws_url(addr), quick_config()).await.unwrap();
    client.close().await.unwrap();

    // Allow the shutdown to propagate, then verify the flag.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.is_connected());
}
