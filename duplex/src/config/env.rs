//! Environment variable overrides.

use std::env;
use std::str::FromStr;

use super::{ConfigError, EngineConfig};
use crate::core::codec::PcmWidth;
use crate::core::realtime::{InputAudioTranscription, TurnDetection};

/// Every variable read by [`apply_env`].
pub const ENV_VARS: &[&str] = &[
    "REALTIME_URL",
    "OPENAI_API_KEY",
    "REALTIME_API_KEY",
    "REALTIME_MODEL",
    "REALTIME_CONNECT_TIMEOUT_MS",
    "REALTIME_HEARTBEAT_INTERVAL_MS",
    "REALTIME_RECONNECT_ENABLED",
    "REALTIME_RECONNECT_MAX_ATTEMPTS",
    "REALTIME_RECONNECT_BASE_DELAY_MS",
    "REALTIME_VOICE",
    "REALTIME_INSTRUCTIONS",
    "REALTIME_TURN_DETECTION",
    "REALTIME_TRANSCRIPTION_MODEL",
    "CAPTURE_DEVICE",
    "CAPTURE_SAMPLE_RATE",
    "CAPTURE_FRAME_MS",
    "CAPTURE_GATE_THRESHOLD",
    "CAPTURE_LOCAL_BARGE_IN",
    "PLAYBACK_DEVICE",
    "PLAYBACK_SAMPLE_RATE",
    "PLAYBACK_WIDTH",
    "PLAYBACK_LEAD_MS",
    "PLAYBACK_VOLUME",
];

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    var(key)
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?} is not a boolean"),
            }),
        })
        .transpose()
}

/// Apply environment variables on top of `config`.
pub fn apply_env(config: &mut EngineConfig) -> Result<(), ConfigError> {
    let connection = &mut config.connection;
    if let Some(url) = var("REALTIME_URL") {
        connection.url = url;
    }
    if let Some(key) = var("REALTIME_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
        connection.api_key = key;
    }
    if let Some(model) = var("REALTIME_MODEL") {
        connection.model = Some(model);
    }
    if let Some(ms) = parse("REALTIME_CONNECT_TIMEOUT_MS")? {
        connection.connect_timeout_ms = ms;
    }
    if let Some(ms) = parse("REALTIME_HEARTBEAT_INTERVAL_MS")? {
        connection.heartbeat_interval_ms = ms;
    }
    if let Some(enabled) = parse_bool("REALTIME_RECONNECT_ENABLED")? {
        connection.reconnection.enabled = enabled;
    }
    if let Some(max) = parse("REALTIME_RECONNECT_MAX_ATTEMPTS")? {
        connection.reconnection.max_attempts = max;
    }
    if let Some(ms) = parse("REALTIME_RECONNECT_BASE_DELAY_MS")? {
        connection.reconnection.base_delay_ms = ms;
    }

    let session = &mut config.session;
    if let Some(voice) = var("REALTIME_VOICE") {
        session.voice = Some(voice);
    }
    if let Some(instructions) = var("REALTIME_INSTRUCTIONS") {
        session.instructions = Some(instructions);
    }
    if let Some(mode) = var("REALTIME_TURN_DETECTION") {
        session.turn_detection = Some(match mode.trim().to_lowercase().as_str() {
            "server_vad" | "server" | "vad" => TurnDetection::default(),
            "none" | "manual" => TurnDetection::None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "REALTIME_TURN_DETECTION".to_string(),
                    message: format!("{mode:?} is not server_vad or manual"),
                });
            }
        });
    }
    if let Some(model) = var("REALTIME_TRANSCRIPTION_MODEL") {
        session.input_audio_transcription = Some(InputAudioTranscription { model });
    }

    let capture = &mut config.capture;
    if let Some(device) = var("CAPTURE_DEVICE") {
        capture.device = Some(device);
    }
    if let Some(rate) = parse("CAPTURE_SAMPLE_RATE")? {
        capture.sample_rate = rate;
    }
    if let Some(ms) = parse("CAPTURE_FRAME_MS")? {
        capture.frame_ms = ms;
    }
    if let Some(threshold) = parse("CAPTURE_GATE_THRESHOLD")? {
        capture.gate_threshold = Some(threshold);
    }
    if let Some(enabled) = parse_bool("CAPTURE_LOCAL_BARGE_IN")? {
        capture.local_barge_in = enabled;
    }

    let playback = &mut config.playback;
    if let Some(device) = var("PLAYBACK_DEVICE") {
        playback.device = Some(device);
    }
    if let Some(rate) = parse("PLAYBACK_SAMPLE_RATE")? {
        playback.sample_rate = rate;
    }
    if let Some(width) = var("PLAYBACK_WIDTH") {
        playback.width = PcmWidth::parse(&width).map_err(|e| ConfigError::InvalidValue {
            key: "PLAYBACK_WIDTH".to_string(),
            message: e.to_string(),
        })?;
    }
    if let Some(ms) = parse("PLAYBACK_LEAD_MS")? {
        playback.lead_ms = ms;
    }
    if let Some(volume) = parse("PLAYBACK_VOLUME")? {
        playback.volume = volume;
    }

    Ok(())
}
