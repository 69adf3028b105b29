//! Realtime session protocol.
//!
//! A persistent JSON-over-WebSocket conversation with a speech model: session
//! configuration, streamed input audio, server-side turn detection, streamed
//! response audio and transcripts, interruption and reconnection.
//!
//! # Layers
//!
//! - [`messages`] - wire types (`ClientEvent`, `ServerEvent`, `SessionConfig`)
//! - [`machine`] - synchronous [`ProtocolMachine`] returning ordered effects
//! - [`transport`] - [`Connector`] trait and the WebSocket implementation
//! - [`client`] - [`SessionProtocolClient`] driving the machine from one task
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_duplex::core::realtime::{ConnectionConfig, SessionConfig, SessionProtocolClient};
//! use std::sync::Arc;
//!
//! let client = SessionProtocolClient::new(ConnectionConfig {
//!     api_key: "sk-...".to_string(),
//!     ..Default::default()
//! });
//! client.on_event(Arc::new(|event| println!("{event:?}")));
//! client.update_session(SessionConfig::default())?;
//! client.connect().await?;
//! client.send_audio_frame(&pcm16_frame)?;
//! ```

mod base;
pub mod client;
pub mod machine;
pub mod messages;
pub mod transport;

pub use base::{
    ConnectionConfig, DEFAULT_MODEL, DEFAULT_URL, InterruptSource, ProtocolEvent,
    ProtocolEventCallback, ProtocolState, RealtimeError, RealtimeErrorCallback, RealtimeResult,
    ReconnectionConfig, TranscriptChannel, TranscriptRole,
};
pub use client::{ConnectionStatus, FINISH_TIMEOUT, SessionProtocolClient};
pub use machine::{Effect, ProtocolMachine};
pub use messages::{
    ClientEvent, InputAudioTranscription, MaxTokens, ServerEvent, SessionConfig, TurnDetection,
};
pub use transport::{Connector, TransportEvent, TransportLink, WebSocketConnector};
