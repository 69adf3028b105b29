//! Wire message types for the duplex session protocol.
//!
//! Every message is a JSON object with a `type` discriminator. Outbound
//! messages also carry a unique `event_id`.
//!
//! # Protocol Overview
//!
//! Client events (sent to server):
//! - session.update - Push session configuration
//! - input_audio_buffer.append - Append base64 PCM16 audio
//! - input_audio_buffer.commit - Commit audio buffer (manual turn detection)
//! - response.cancel - Cancel the in-flight response
//! - session.finish - Ask the server to end the session
//! - ping - Keep-alive
//!
//! Server events (received from server):
//! - session.created / session.updated
//! - input_audio_buffer.speech_started / speech_stopped / committed / cleared
//! - conversation.item.created
//! - conversation.item.input_audio_transcription.delta / completed / failed
//! - response.created / response.done
//! - response.output_item.added / done, response.content_part.added / done
//! - response.audio.delta / done
//! - response.audio_transcript.delta / done
//! - response.text.delta / done
//! - error
//!
//! Unrecognized server types deserialize to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};

use super::base::{RealtimeError, RealtimeResult};
use crate::core::codec;

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration pushed with `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format (`pcm16`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format (`pcm16`, `pcm24`, `pcm32`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection configuration; `None` keeps the server default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    /// Maximum response output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: None,
            voice: Some("alloy".to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: None,
            turn_detection: Some(TurnDetection::default()),
            temperature: None,
            top_p: None,
            top_k: None,
            max_response_output_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            repetition_penalty: None,
            seed: None,
        }
    }
}

impl SessionConfig {
    /// Whether the server decides turn boundaries.
    ///
    /// An unset turn detection means the server default, which is server VAD.
    pub fn is_server_vad(&self) -> bool {
        !matches!(self.turn_detection, Some(TurnDetection::None))
    }
}

/// Maximum tokens configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(u32),
    /// Infinite tokens
    Infinite(String), // "inf"
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side VAD
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio included before detected speech (ms)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence before end of turn (ms)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// Manual turn detection via `commit()`
    #[serde(rename = "none")]
    None,
}

impl Default for TurnDetection {
    fn default() -> Self {
        TurnDetection::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

// =============================================================================
// Client Events (sent to server)
// =============================================================================

/// Client events sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionConfig,
    },

    /// Append audio to input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded PCM16 audio
        audio: String,
    },

    /// Commit the input audio buffer
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Cancel a response
    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },

    /// End the session
    #[serde(rename = "session.finish")]
    SessionFinish,

    /// Keep-alive
    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    /// Create an audio append event from raw PCM bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: codec::encode_base64(data),
        }
    }

    /// Wire type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCancel { .. } => "response.cancel",
            ClientEvent::SessionFinish => "session.finish",
            ClientEvent::Ping => "ping",
        }
    }

    /// Serialize with a fresh `event_id`.
    pub fn to_message(&self) -> RealtimeResult<OutboundMessage> {
        let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let text = serde_json::to_string(&Envelope {
            event_id: &event_id,
            event: self,
        })
        .map_err(|e| RealtimeError::Serialization(e.to_string()))?;
        Ok(OutboundMessage { event_id, text })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: &'a str,
    #[serde(flatten)]
    event: &'a ClientEvent,
}

/// A serialized outbound message.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event_id: String,
    pub text: String,
}

// =============================================================================
// Server Events (received from server)
// =============================================================================

/// Server events received from the server.
///
/// Fields are lenient: ids the protocol does not guarantee are optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error occurred
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    /// Session updated
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<SessionInfo>,
    },

    /// Speech started (VAD detected speech)
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Speech stopped (VAD detected silence)
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Audio buffer committed
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Audio buffer cleared
    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    /// Conversation item created
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        item: serde_json::Value,
    },

    /// Input audio transcription delta
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },

    /// Input audio transcription completed
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },

    /// Input audio transcription failed
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: Option<ApiError>,
    },

    /// Response created
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    /// Response done
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        #[serde(default)]
        response_id: Option<String>,
    },

    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Audio delta (audio data chunk)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        /// Base64-encoded audio delta
        delta: String,
    },

    /// Audio done
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Spoken transcript delta
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    /// Spoken transcript done
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        transcript: Option<String>,
    },

    /// Text delta
    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    /// Text done
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },

    /// Any other message type
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// Parse one inbound text frame, returning its `event_id` when present.
    pub fn parse(text: &str) -> RealtimeResult<(Option<String>, ServerEvent)> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| RealtimeError::Serialization(e.to_string()))?;
        let event_id = value
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let event =
            ServerEvent::deserialize(value).map_err(|e| RealtimeError::Serialization(e.to_string()))?;
        Ok((event_id, event))
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    /// Error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: String,
    /// Event ID that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl From<ApiError> for RealtimeError {
    fn from(error: ApiError) -> Self {
        RealtimeError::Protocol {
            code: error.code.or(error.error_type),
            message: error.message,
        }
    }
}

/// Session information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub output_audio_format: Option<String>,
}

/// Response information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseInfo {
    /// Response ID
    pub id: String,
    /// Response status
    #[serde(default)]
    pub status: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
