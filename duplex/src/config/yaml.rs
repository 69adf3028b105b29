use serde::Deserialize;
use std::path::Path;

use super::ConfigError;
use crate::core::codec::PcmWidth;
use crate::core::realtime::{MaxTokens, TurnDetection};

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present here
/// override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// connection:
///   url: "wss://api.openai.com/v1/realtime"
///   api_key: "sk-..."
///   model: "gpt-4o-realtime-preview"
///   connect_timeout_ms: 10000
///   heartbeat_interval_ms: 30000
///   reconnection:
///     enabled: true
///     max_attempts: 5
///     base_delay_ms: 1000
///
/// session:
///   voice: "alloy"
///   instructions: "You are a helpful assistant."
///   turn_detection:
///     type: server_vad
///     threshold: 0.5
///     silence_duration_ms: 500
///   transcription_model: "whisper-1"
///
/// capture:
///   sample_rate: 16000
///   frame_ms: 20
///   gate_threshold: 0.01
///   local_barge_in: true
///
/// playback:
///   sample_rate: 24000
///   width: pcm16
///   lead_ms: 50
///   crossfade_ms: 5.0
///   volume: 0.8
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub connection: Option<ConnectionYaml>,
    pub session: Option<SessionYaml>,
    pub capture: Option<CaptureYaml>,
    pub playback: Option<PlaybackYaml>,
}

/// Connection configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionYaml {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnection: Option<ReconnectionYaml>,
}

/// Reconnection policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReconnectionYaml {
    pub enabled: Option<bool>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

/// Session configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub modalities: Option<Vec<String>>,
    pub instructions: Option<String>,
    pub voice: Option<String>,
    pub input_audio_format: Option<String>,
    pub output_audio_format: Option<String>,
    /// Model used to transcribe input audio (e.g. "whisper-1")
    pub transcription_model: Option<String>,
    pub turn_detection: Option<TurnDetection>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_response_output_tokens: Option<MaxTokens>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<u64>,
}

/// Capture configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureYaml {
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub gate_threshold: Option<f32>,
    pub level_interval_ms: Option<u32>,
    pub local_barge_in: Option<bool>,
    pub barge_in_threshold: Option<f32>,
}

/// Playback configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    pub device: Option<String>,
    pub sample_rate: Option<u32>,
    pub width: Option<PcmWidth>,
    pub lead_ms: Option<u32>,
    pub crossfade_ms: Option<f32>,
    pub dc_removal: Option<bool>,
    pub volume: Option<f32>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        Self::parse(&contents)
    }

    /// Parse YAML configuration from a string
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
connection:
  url: "ws://localhost:9000/realtime"
  api_key: "yaml-key"
  reconnection:
    max_attempts: 3

session:
  voice: "verse"
  turn_detection:
    type: none
  max_response_output_tokens: "inf"

capture:
  gate_threshold: 0.02
  local_barge_in: true

playback:
  width: pcm24
  volume: 0.5
"#;
        let config = YamlConfig::parse(yaml).unwrap();

        let connection = config.connection.unwrap();
        assert_eq!(connection.url.as_deref(), Some("ws://localhost:9000/realtime"));
        assert_eq!(connection.api_key.as_deref(), Some("yaml-key"));
        assert_eq!(connection.reconnection.unwrap().max_attempts, Some(3));

        let session = config.session.unwrap();
        assert_eq!(session.voice.as_deref(), Some("verse"));
        assert_eq!(session.turn_detection, Some(TurnDetection::None));
        assert_eq!(
            session.max_response_output_tokens,
            Some(MaxTokens::Infinite("inf".to_string()))
        );

        let capture = config.capture.unwrap();
        assert_eq!(capture.gate_threshold, Some(0.02));
        assert_eq!(capture.local_barge_in, Some(true));

        let playback = config.playback.unwrap();
        assert_eq!(playback.width, Some(PcmWidth::Pcm24));
        assert_eq!(playback.volume, Some(0.5));
    }

    #[test]
    fn test_yaml_config_partial() {
        let config = YamlConfig::parse("playback:\n  lead_ms: 80\n").unwrap();
        assert!(config.connection.is_none());
        assert!(config.session.is_none());
        assert_eq!(config.playback.unwrap().lead_ms, Some(80));
    }

    #[test]
    fn test_yaml_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("duplex.yaml");
        fs::write(&path, "capture:\n  frame_ms: 40\n").unwrap();

        let config = YamlConfig::from_file(&path).unwrap();
        assert_eq!(config.capture.unwrap().frame_ms, Some(40));
    }

    #[test]
    fn test_yaml_config_invalid() {
        match YamlConfig::parse("capture: [unclosed") {
            Err(ConfigError::Parse(_)) => {}
            _ => panic!("Expected Parse error"),
        }
    }

    #[test]
    fn test_yaml_config_missing_file() {
        match YamlConfig::from_file(Path::new("/nonexistent/duplex.yaml")) {
            Err(ConfigError::Read { .. }) => {}
            _ => panic!("Expected Read error"),
        }
    }
}
