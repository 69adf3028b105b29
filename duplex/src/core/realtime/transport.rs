//! Persistent message transport.
//!
//! A [`Connector`] opens one connection and hands back a [`TransportLink`]: an
//! outbound text sender and an inbound event receiver. The WebSocket connector
//! pumps both directions from a single spawned task so the protocol client
//! never touches the socket directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::base::{ConnectionConfig, RealtimeError, RealtimeResult};

/// Inbound signal from an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One text frame
    Message(String),
    /// The connection ended; no further events follow
    Closed { reason: String },
}

/// Both directions of one open connection.
///
/// Dropping `outbound` closes the connection.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Create a linked pair: the link for the client and the far ends for the
    /// transport implementation.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens transports for the protocol client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> RealtimeResult<TransportLink>;
}

// =============================================================================
// WebSocket
// =============================================================================

/// tokio-tungstenite connector.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &ConnectionConfig) -> RealtimeResult<TransportLink> {
        let url = config.endpoint()?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("request: {e}")))?;
        if !config.api_key.is_empty() {
            let value = format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|_| RealtimeError::InvalidConfiguration("api key".to_string()))?;
            request.headers_mut().insert(http::header::AUTHORIZATION, value);
        }

        tracing::debug!(url = %url, "opening websocket");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        tracing::info!(url = %url, "websocket connected");

        let (link, mut outbound, inbound) = TransportLink::pair();
        let (mut sink, mut stream) = ws_stream.split();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    next = outbound.recv() => match next {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                break format!("send failed: {e}");
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break "closed by client".to_string();
                        }
                    },

                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if inbound.send(TransportEvent::Message(text.to_string())).is_err() {
                                let _ = sink.send(Message::Close(None)).await;
                                break "receiver dropped".to_string();
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = sink.send(Message::Pong(data)).await {
                                break format!("pong failed: {e}");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("websocket error: {e}"),
                        None => break "stream ended".to_string(),
                    },
                }
            };

            tracing::debug!(%reason, "websocket pump finished");
            let _ = inbound.send(TransportEvent::Closed { reason });
        });

        Ok(link)
    }
}
