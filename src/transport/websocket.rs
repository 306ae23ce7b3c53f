//! WebSocket transport over `tokio-tungstenite`.
//!
//! Ping frames are answered by tungstenite itself on the next write; binary
//! and pong frames carry nothing for the Phoenix JSON serializer and are
//! skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use url::Url;

use super::{Connection, Inbound, Transport, TransportReader, TransportWriter};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// [`Transport`] that opens WebSocket connections, with optional extra
/// handshake headers.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    headers: Vec<(String, String)>,
}

impl WebSocketTransport {
    /// Transport with no extra headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with the upgrade request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> Result<Connection> {
        use tungstenite::client::IntoClientRequest;

        let mut request = url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {url}"))?;

        for (name, value) in &self.headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?;
            let header_value = tungstenite::http::HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {name}"))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;

        let (sink, stream) = ws_stream.split();
        Ok((Box::new(WsWriter { sink }), Box::new(WsReader { stream })))
    }
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn recv(&mut self) -> Option<Result<Inbound>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(Inbound::Text(text)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(Inbound::Closed { code, reason }));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    log::debug!("[Transport] Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {
                    // Ping/pong/raw frames
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}
