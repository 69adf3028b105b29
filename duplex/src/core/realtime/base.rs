//! Base types for the duplex session protocol.
//!
//! Errors, connection configuration, protocol states and the event stream the
//! client exposes to the rest of the engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RealtimeError {
    /// Opening the connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The open connection failed or dropped
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server reported an error or broke protocol rules
    #[error("Protocol error{}: {message}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Protocol {
        code: Option<String>,
        message: String,
    },

    /// The connection dropped and reconnection is disabled
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Reconnection gave up
    #[error("Reconnection failed after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Operation not valid in the current protocol state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RealtimeError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RealtimeError::Protocol {
            code: None,
            message: message.into(),
        }
    }
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Automatic reconnection policy.
///
/// The delay before attempt `n` is `n * base_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Enable automatic reconnection on connection loss.
    pub enabled: bool,

    /// Maximum number of reconnection attempts before giving up.
    /// Set to 0 for unlimited attempts.
    pub max_attempts: u32,

    /// Delay unit between attempts (milliseconds).
    pub base_delay_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}

impl ReconnectionConfig {
    /// Create a config with reconnection disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before the given (1-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// Check if another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

/// Default endpoint.
pub const DEFAULT_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default model.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Connection settings for the session protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint
    pub url: String,

    /// Bearer token; empty sends no authorization header
    pub api_key: String,

    /// Model appended as the `model` query parameter when set
    pub model: Option<String>,

    /// Bound on the initial connection attempt (milliseconds)
    pub connect_timeout_ms: u64,

    /// Keep-alive interval (milliseconds); 0 disables heartbeats
    pub heartbeat_interval_ms: u64,

    /// Reconnection policy
    pub reconnection: ReconnectionConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            model: Some(DEFAULT_MODEL.to_string()),
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnection: ReconnectionConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Endpoint with the model query parameter applied.
    pub fn endpoint(&self) -> RealtimeResult<url::Url> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| RealtimeError::InvalidConfiguration(format!("url: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RealtimeError::InvalidConfiguration(format!(
                    "url scheme must be ws or wss, got {other}"
                )));
            }
        }
        if let Some(model) = self.model.as_deref().filter(|m| !m.is_empty())
            && !url.query_pairs().any(|(k, _)| k == "model")
        {
            url.query_pairs_mut().append_pair("model", model);
        }
        Ok(url)
    }
}

// =============================================================================
// Protocol State
// =============================================================================

/// Protocol lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ProtocolState {
    #[default]
    Disconnected,
    Connecting,
    /// Transport open, no session configuration sent yet
    Connected,
    /// Session configuration sent, waiting for the server
    SessionPending,
    ResponseIdle,
    ResponseActive,
    /// `session.finish` sent, waiting for the server to close
    Closing,
}

impl ProtocolState {
    /// Whether a transport is open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ProtocolState::Connected
                | ProtocolState::SessionPending
                | ProtocolState::ResponseIdle
                | ProtocolState::ResponseActive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolState::Disconnected => "disconnected",
            ProtocolState::Connecting => "connecting",
            ProtocolState::Connected => "connected",
            ProtocolState::SessionPending => "session_pending",
            ProtocolState::ResponseIdle => "response_idle",
            ProtocolState::ResponseActive => "response_active",
            ProtocolState::Closing => "closing",
        }
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Events
// =============================================================================

/// Role of the speaker in a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    /// User speech transcript
    User,
    /// Assistant output
    Assistant,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Which text stream a transcript update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TranscriptChannel {
    /// Transcription of the user's input audio
    Input,
    /// Transcript of the assistant's spoken audio
    Speech,
    /// Assistant text output
    Text,
}

impl TranscriptChannel {
    pub fn role(&self) -> TranscriptRole {
        match self {
            TranscriptChannel::Input => TranscriptRole::User,
            TranscriptChannel::Speech | TranscriptChannel::Text => TranscriptRole::Assistant,
        }
    }
}

/// Who interrupted a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterruptSource {
    /// Server turn detection reported speech
    ServerVad,
    /// Local capture detected speech
    LocalVad,
    /// Explicit `cancel_response()`
    Client,
}

/// Events emitted by the session protocol client.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Transport opened
    Connected { reconnected: bool },
    /// Transport gone; no further events until the next connect
    Disconnected { reason: String },
    /// Connection lost, retrying after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    SessionCreated { session_id: String },
    SessionUpdated,
    SpeechStarted {
        audio_start_ms: u64,
        item_id: Option<String>,
    },
    SpeechStopped {
        audio_end_ms: u64,
        item_id: Option<String>,
    },
    InputCommitted { item_id: Option<String> },
    InputCleared,
    ResponseStarted { response_id: String },
    ResponseDone {
        response_id: String,
        status: Option<String>,
    },
    /// A newer response replaced this one before it finished
    ResponseSuperseded { response_id: String },
    /// Base64 audio for the current response
    AudioDelta { response_id: String, delta: String },
    AudioDone { response_id: String },
    /// Transcript update; `text` is the accumulated text so far
    Transcript {
        channel: TranscriptChannel,
        response_id: Option<String>,
        delta: String,
        text: String,
        is_final: bool,
    },
    /// The current response was cancelled and must be silenced
    BargeIn {
        response_id: String,
        source: InterruptSource,
    },
}

// =============================================================================
// Callback Types
// =============================================================================

/// Callback type for protocol events.
///
/// Invoked from the connection task in arrival order; must not block.
pub type ProtocolEventCallback = Arc<dyn Fn(ProtocolEvent) + Send + Sync>;

/// Callback type for error events.
pub type RealtimeErrorCallback = Arc<dyn Fn(RealtimeError) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_state_display() {
        assert_eq!(ProtocolState::ResponseActive.to_string(), "response_active");
        assert_eq!(ProtocolState::Disconnected.to_string(), "disconnected");
        assert!(ProtocolState::SessionPending.is_connected());
        assert!(!ProtocolState::Closing.is_connected());
    }

    #[test]
    fn test_transcript_role_display() {
        assert_eq!(TranscriptRole::User.to_string(), "user");
        assert_eq!(TranscriptChannel::Text.role(), TranscriptRole::Assistant);
    }

    #[test]
    fn test_error_display() {
        let err = RealtimeError::ConnectionFailed("test".to_string());
        assert!(err.to_string().contains("Connection failed"));

        let err = RealtimeError::Protocol {
            code: Some("bad_event".to_string()),
            message: "oops".to_string(),
        };
        assert_eq!(err.to_string(), "Protocol error [bad_event]: oops");

        let err = RealtimeError::NotConnected;
        assert_eq!(err.to_string(), "Not connected");
    }

    #[test]
    fn test_reconnection_config_default() {
        let config = ReconnectionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 1000);
    }

    #[test]
    fn test_reconnection_delay_is_linear() {
        let config = ReconnectionConfig {
            base_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.delay(1), Duration::from_millis(250));
        assert_eq!(config.delay(2), Duration::from_millis(500));
        assert_eq!(config.delay(4), Duration::from_millis(1000));
    }

    #[test]
    fn test_reconnection_should_retry() {
        let config = ReconnectionConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));

        let disabled = ReconnectionConfig::disabled();
        assert!(!disabled.should_retry(0));

        let unlimited = ReconnectionConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(unlimited.should_retry(u32::MAX));
    }

    #[test]
    fn test_endpoint_appends_model() {
        let config = ConnectionConfig {
            url: "wss://example.com/v1/realtime".to_string(),
            model: Some("m1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://example.com/v1/realtime?model=m1"
        );

        let config = ConnectionConfig {
            url: "wss://example.com/rt?model=custom".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://example.com/rt?model=custom"
        );
    }

    #[test]
    fn test_endpoint_rejects_http() {
        let config = ConnectionConfig {
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        match config.endpoint() {
            Err(RealtimeError::InvalidConfiguration(_)) => {}
            _ => panic!("Expected InvalidConfiguration"),
        }
    }
}
