//! Socket lifecycle tests: connect, heartbeat, reconnect, routing.
//!
//! All tests run on a paused clock against the in-memory transport in
//! `common`, so heartbeat and backoff timers fire deterministically.

mod common;

use std::time::Duration;

use common::{connected_socket, joined_channel, mock, recorder, settle, test_config};
use phoenix_client::{ChannelState, ConnectionState, Event, PhoenixError, Socket};
use serde_json::json;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_connect_url_carries_params_and_vsn() {
    let (transport, mut server) = mock();
    let config = test_config().param("token", "abc");
    let socket = Socket::with_transport(config, transport).unwrap();
    assert_eq!(socket.state(), ConnectionState::Closed);

    socket.connect().unwrap();
    let _conn = server.accept().await;
    socket.wait_for_state(|s| s.is_open()).await.unwrap();

    let url = &server.urls()[0];
    assert_eq!(url.path(), "/socket/websocket");
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert!(query.contains(&("token".to_string(), "abc".to_string())));
    assert!(query.contains(&("vsn".to_string(), "2.0.0".to_string())));
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_noop_while_open() {
    let (socket, server, _conn) = connected_socket(test_config()).await;
    socket.connect().unwrap();
    settle().await;
    assert_eq!(server.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_sent_and_answered_keeps_connection_open() {
    let config = test_config().heartbeat_interval(Duration::from_secs(30));
    let (socket, server, mut conn) = connected_socket(config).await;

    for _ in 0..3 {
        let heartbeat = conn.recv().await.unwrap();
        assert_eq!(heartbeat.topic, "phoenix");
        assert_eq!(heartbeat.event, Event::Heartbeat);
        assert_eq!(heartbeat.join_ref, None);
        assert!(heartbeat.msg_ref.is_some());
        assert_eq!(heartbeat.payload, json!({}));
        conn.reply(&heartbeat, "ok", json!({}));
    }

    settle().await;
    assert_eq!(socket.state(), ConnectionState::Open);
    assert_eq!(server.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_heartbeat_reconnects_within_two_intervals() {
    let start = Instant::now();
    let config = test_config().heartbeat_interval(Duration::from_secs(30));
    let (socket, mut server, mut conn) = connected_socket(config).await;

    let heartbeat = conn.recv().await.unwrap();
    assert_eq!(heartbeat.event, Event::Heartbeat);

    socket
        .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();
    assert!(start.elapsed() <= Duration::from_secs(60));

    // Old connection is gone; a new one is opened after the backoff.
    assert!(conn.recv().await.is_none());
    let _conn = server.accept().await;
    socket.wait_for_state(|s| s.is_open()).await.unwrap();
    assert_eq!(server.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connects_back_off_then_succeed() {
    let (transport, mut server) = mock();
    server.fail_next(2);
    let socket = Socket::with_transport(test_config(), transport).unwrap();
    socket.connect().unwrap();

    let state = socket
        .wait_for_state(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();
    assert_eq!(
        state,
        ConnectionState::Reconnecting {
            attempt: 1,
            next_retry_ms: 100
        }
    );

    let _conn = server.accept().await;
    socket.wait_for_state(|s| s.is_open()).await.unwrap();
    assert_eq!(server.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_reconnect() {
    let (socket, mut server, mut conn) = connected_socket(test_config()).await;
    let (lobby, _join) = joined_channel(&socket, &mut conn, "room:lobby").await;

    socket.disconnect().await.unwrap();
    assert_eq!(socket.state(), ConnectionState::Closed);
    assert_eq!(lobby.state(), ChannelState::Errored);
    assert!(conn.recv().await.is_none());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(server.attempts(), 1);
    assert_eq!(socket.state(), ConnectionState::Closed);
    assert_eq!(lobby.state(), ChannelState::Errored);

    // An explicit connect resumes and rejoins.
    socket.connect().unwrap();
    let mut conn = server.accept().await;
    conn.accept_join("room:lobby").await;
    lobby.wait_for_state(ChannelState::Joined).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_server_close_triggers_reconnect_and_rejoin() {
    let (socket, mut server, mut conn) = connected_socket(test_config()).await;
    let lobby = socket.channel("room:lobby").await.unwrap();
    lobby.join(json!({"user": "alice"})).send().await.unwrap();
    let first = conn.accept_join("room:lobby").await;
    lobby.wait_for_state(ChannelState::Joined).await.unwrap();

    conn.close(1001, "going away");
    lobby.wait_for_state(ChannelState::Errored).await.unwrap();

    let mut conn = server.accept().await;
    let second = conn.accept_join("room:lobby").await;
    lobby.wait_for_state(ChannelState::Joined).await.unwrap();

    assert_eq!(second.payload, json!({"user": "alice"}));
    assert_ne!(second.msg_ref, first.msg_ref);
    assert_eq!(second.join_ref, second.msg_ref);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_ignored() {
    let (socket, _server, mut conn) = connected_socket(test_config()).await;
    let (lobby, _join) = joined_channel(&socket, &mut conn, "room:lobby").await;
    let (rec, mut recording) = recorder();
    lobby.on("shout", rec.callback("shout")).unwrap();
    settle().await;

    conn.send_raw("not json");
    conn.send_raw(r#"["1","2"]"#);
    conn.send_raw(r#"{"topic":"room:lobby"}"#);
    conn.broadcast("room:lobby", "shout", json!({"id": 1}));

    let (tag, payload) = recording.next().await;
    assert_eq!(tag, "shout");
    assert_eq!(payload, json!({"id": 1}));
    assert_eq!(socket.state(), ConnectionState::Open);
    assert_eq!(lobby.state(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_topic_is_dropped() {
    let (socket, _server, mut conn) = connected_socket(test_config()).await;
    let (lobby, _join) = joined_channel(&socket, &mut conn, "room:lobby").await;
    let (rec, mut recording) = recorder();
    lobby.on("shout", rec.callback("shout")).unwrap();
    settle().await;

    conn.broadcast("room:other", "shout", json!({"id": 1}));
    settle().await;

    assert!(recording.drain().is_empty());
    assert_eq!(socket.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_resolves_buffered_pushes_with_error() {
    let (transport, _server) = mock();
    let socket = Socket::with_transport(test_config(), transport).unwrap();
    let lobby = socket.channel("room:lobby").await.unwrap();
    let (rec, mut recording) = recorder();

    lobby.join(json!({})).send().await.unwrap();
    lobby
        .push("shout", json!({}))
        .receive("error", rec.callback("error"))
        .send()
        .await
        .unwrap();

    socket.shutdown().await;

    let (tag, payload) = recording.next().await;
    assert_eq!(tag, "error");
    assert_eq!(payload, json!({"reason": "socket shut down"}));
    assert_eq!(lobby.state(), ChannelState::Closed);
    assert!(matches!(socket.connect(), Err(PhoenixError::SocketClosed)));
    assert!(matches!(
        lobby.wait_for_state(ChannelState::Joined).await,
        Err(PhoenixError::SocketClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_all_handles_stops_driver() {
    let (transport, mut server) = mock();
    let socket = Socket::with_transport(test_config(), transport).unwrap();
    socket.connect().unwrap();
    let mut conn = server.accept().await;
    socket.wait_for_state(|s| s.is_open()).await.unwrap();

    drop(socket);
    assert!(conn.recv().await.is_none());
}
