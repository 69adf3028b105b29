//! Crate-level error type.
//!
//! Every component keeps its own error enum; `EngineError` wraps them so the
//! coordinator and binary can classify failures in one place.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core::capture::CaptureError;
use crate::core::codec::CodecError;
use crate::core::playback::PlaybackError;
use crate::core::probe::DeviceError;
use crate::core::realtime::RealtimeError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether the engine can no longer run the conversation.
    ///
    /// Transient failures (a dropped transport while reconnecting, one bad
    /// audio chunk, a server error event) return `false`.
    pub fn is_terminal(&self) -> bool {
        match self {
            EngineError::Config(_) => true,
            EngineError::Device(_) => true,
            EngineError::Capture(e) => matches!(
                e,
                CaptureError::PermissionDenied(_)
                    | CaptureError::Device(_)
                    | CaptureError::Disposed
                    | CaptureError::InvalidSettings(_)
            ),
            EngineError::Playback(e) => !matches!(e, PlaybackError::SinkClosed),
            EngineError::Codec(_) => false,
            EngineError::Realtime(e) => matches!(
                e,
                RealtimeError::MaxRetriesExceeded { .. }
                    | RealtimeError::ConnectionLost(_)
                    | RealtimeError::InvalidConfiguration(_)
            ),
        }
    }

    /// Whether the failure is a denied microphone or speaker permission.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            EngineError::Device(DeviceError::PermissionDenied(_))
                | EngineError::Capture(CaptureError::PermissionDenied(_))
                | EngineError::Playback(PlaybackError::PermissionDenied(_))
        )
    }
}
