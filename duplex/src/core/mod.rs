pub mod capture;
pub mod codec;
pub mod context;
pub mod playback;
pub mod probe;
pub mod realtime;
pub mod session;

// Re-export commonly used types for convenience
pub use capture::{
    AudioFrame, CaptureEncoder, CaptureError, CaptureSettings, CaptureSource, CpalCaptureSource,
};

pub use codec::{CodecError, LinearResampler, PcmWidth};

pub use context::{EngineContext, EngineStats, EngineStatsSnapshot};

pub use playback::{
    AudioSink, AudioSmoother, CpalOutput, OfflineSink, PlaybackError, PlaybackScheduler,
    PlaybackSettings, SinkEvent,
};

pub use probe::{Capabilities, DeviceError};

pub use realtime::{
    ConnectionConfig, ProtocolEvent, ProtocolState, RealtimeError, RealtimeResult,
    SessionConfig, SessionProtocolClient,
};

pub use session::{SessionAction, SessionCoordinator, TranscriptUpdate};
