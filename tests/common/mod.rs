//! In-memory transport for driving a `Socket` from tests.
//!
//! Every successful `connect` hands a [`ServerConn`] (the server's end of
//! the connection) to the test through [`MockServer::accept`].

#![allow(dead_code, reason = "each test binary uses a different subset of helpers")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use phoenix_client::message::{self, Message};
use phoenix_client::transport::{Connection, Inbound, Transport, TransportReader, TransportWriter};
use phoenix_client::{Backoff, ChannelHandle, ChannelState, Event, Socket, SocketConfig};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

/// Client-side transport handed to `Socket::with_transport`.
pub struct MockTransport {
    connections: mpsc::UnboundedSender<ServerConn>,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<Url>>>,
}

/// Test-side controller for a [`MockTransport`].
pub struct MockServer {
    connections: mpsc::UnboundedReceiver<ServerConn>,
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    urls: Arc<Mutex<Vec<Url>>>,
}

/// Create a connected transport/server pair.
pub fn mock() -> (MockTransport, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let failures = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let urls = Arc::new(Mutex::new(Vec::new()));
    (
        MockTransport {
            connections: tx,
            failures: Arc::clone(&failures),
            attempts: Arc::clone(&attempts),
            urls: Arc::clone(&urls),
        },
        MockServer {
            connections: rx,
            failures,
            attempts,
            urls,
        },
    )
}

/// Config with timings suited to paused-clock tests.
///
/// Heartbeats are effectively off unless a test sets its own interval.
pub fn test_config() -> SocketConfig {
    SocketConfig::new("ws://localhost:4000/socket")
        .heartbeat_interval(Duration::from_secs(3600))
        .timeout(Duration::from_secs(10))
        .reconnect_after(Backoff::fixed(Duration::from_millis(100)))
        .rejoin_after(Backoff::fixed(Duration::from_secs(1)))
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &Url) -> anyhow::Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.clone());

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("connection refused");
        }

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.connections
            .send(ServerConn {
                from_client: client_rx,
                to_client: Some(server_tx),
            })
            .map_err(|_| anyhow::anyhow!("mock server dropped"))?;

        Ok((
            Box::new(MockWriter {
                tx: Some(client_tx),
            }),
            Box::new(MockReader { rx: server_rx }),
        ))
    }
}

struct MockWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            anyhow::bail!("writer closed");
        };
        tx.send(text.to_string())
            .map_err(|_| anyhow::anyhow!("connection reset"))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl TransportReader for MockReader {
    async fn recv(&mut self) -> Option<anyhow::Result<Inbound>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MockServer {
    /// Wait for the client's next successful connect.
    pub async fn accept(&mut self) -> ServerConn {
        self.connections
            .recv()
            .await
            .expect("transport dropped before connecting")
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Total connect attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// URLs passed to `connect`.
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    /// Whether another connection is waiting to be accepted.
    pub fn has_pending_connection(&mut self) -> bool {
        !self.connections.is_empty()
    }
}

/// Server end of one mock connection.
pub struct ServerConn {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<Inbound>>,
}

impl ServerConn {
    /// Next frame from the client, or `None` once the client dropped the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        let text = self.from_client.recv().await?;
        Some(message::decode(&text).expect("client sent a malformed frame"))
    }

    /// Next non-heartbeat frame. Panics if the connection closes.
    pub async fn next_frame(&mut self) -> Message {
        loop {
            let frame = self.recv().await.expect("connection closed");
            if frame.event != Event::Heartbeat {
                return frame;
            }
        }
    }

    /// Next non-heartbeat frame if one arrives within `within`.
    pub async fn try_next_frame(&mut self, within: Duration) -> Option<Message> {
        tokio::time::timeout(within, async {
            loop {
                let frame = self.recv().await?;
                if frame.event != Event::Heartbeat {
                    return Some(frame);
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Send a frame to the client.
    pub fn send(&self, message: &Message) {
        self.send_raw(&message::encode(message).unwrap());
    }

    /// Send raw text to the client.
    pub fn send_raw(&self, text: &str) {
        if let Some(tx) = self.to_client.as_ref() {
            let _ = tx.send(Inbound::Text(text.to_string()));
        }
    }

    /// Reply to `request` with `status` and `response`.
    pub fn reply(&self, request: &Message, status: &str, response: Value) {
        self.send(&Message::reply(
            request.join_ref.clone(),
            request.msg_ref.clone(),
            request.topic.clone(),
            status,
            response,
        ));
    }

    /// Broadcast `event` on `topic` (no refs, like a server-side broadcast).
    pub fn broadcast(&self, topic: &str, event: &str, payload: Value) {
        self.send(&Message::new(topic, event, payload));
    }

    /// Read the next frame, check it is a `phx_join` for `topic`, and accept it.
    pub async fn accept_join(&mut self, topic: &str) -> Message {
        let join = self.next_frame().await;
        assert_eq!(join.event, Event::Join, "expected phx_join, got {join:?}");
        assert_eq!(join.topic, topic);
        self.reply(&join, "ok", serde_json::json!({}));
        join
    }

    /// Send a close frame, as a server shutting the socket down would.
    pub fn close(&self, code: u16, reason: &str) {
        if let Some(tx) = self.to_client.as_ref() {
            let _ = tx.send(Inbound::Closed {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Drop the server side; the client's reader sees end of stream.
    pub fn drop_connection(&mut self) {
        self.to_client = None;
    }
}

/// Let the driver process everything already queued.
///
/// Under a paused clock the runtime only advances time once every task is
/// idle, so a short sleep returns after the driver has caught up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Socket over a fresh mock transport, already open.
pub async fn connected_socket(config: SocketConfig) -> (Socket, MockServer, ServerConn) {
    let (transport, mut server) = mock();
    let socket = Socket::with_transport(config, transport).unwrap();
    socket.connect().unwrap();
    let conn = server.accept().await;
    socket.wait_for_state(|s| s.is_open()).await.unwrap();
    (socket, server, conn)
}

/// Join `topic` with an empty payload and accept the join on `conn`.
///
/// Returns the handle and the join frame the client sent.
pub async fn joined_channel(socket: &Socket, conn: &mut ServerConn, topic: &str) -> (ChannelHandle, Message) {
    let channel = socket.channel(topic).await.unwrap();
    channel.join(serde_json::json!({})).send().await.unwrap();
    let join = conn.accept_join(topic).await;
    channel.wait_for_state(ChannelState::Joined).await.unwrap();
    (channel, join)
}

/// Collects callback invocations as `(tag, payload)` pairs.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<(String, Value)>,
}

/// Receiving side of a [`Recorder`].
pub struct Recording {
    rx: mpsc::UnboundedReceiver<(String, Value)>,
}

pub fn recorder() -> (Recorder, Recording) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder { tx }, Recording { rx })
}

impl Recorder {
    /// Callback that records its payload under `tag`.
    pub fn callback(&self, tag: &str) -> impl FnMut(&Value) + Send + 'static {
        let tx = self.tx.clone();
        let tag = tag.to_string();
        move |payload: &Value| {
            let _ = tx.send((tag.clone(), payload.clone()));
        }
    }
}

impl Recording {
    /// Wait for the next invocation.
    pub async fn next(&mut self) -> (String, Value) {
        self.rx.recv().await.expect("all recorders dropped")
    }

    /// Invocations recorded so far, without waiting.
    pub fn drain(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            out.push(item);
        }
        out
    }

    /// Tags recorded so far, without waiting.
    pub fn tags(&mut self) -> Vec<String> {
        self.drain().into_iter().map(|(tag, _)| tag).collect()
    }
}
