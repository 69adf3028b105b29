//! Configuration module for the duplex engine
//!
//! This module handles engine configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//!
//! # Example
//! ```rust,no_run
//! use waav_duplex::config::EngineConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = EngineConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config = EngineConfig::from_file(&PathBuf::from("duplex.yaml"))?;
//! println!("Connecting to {}", config.connection.url);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod env;
mod yaml;

pub use env::ENV_VARS;
pub use yaml::YamlConfig;

use crate::core::capture::CaptureSettings;
use crate::core::codec::PcmWidth;
use crate::core::playback::PlaybackSettings;
use crate::core::realtime::{ConnectionConfig, InputAudioTranscription, SessionConfig};

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse YAML config: {0}")]
    Parse(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub capture: CaptureSettings,
    pub playback: PlaybackSettings,
}

impl EngineConfig {
    /// Load configuration from environment variables on top of defaults.
    ///
    /// The .env file is loaded into the environment by the binary at startup.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::default();
        env::apply_env(&mut config)?;
        config.apply_yaml(yaml);
        config.validate()?;
        Ok(config)
    }

    /// Session configuration as sent to the server.
    ///
    /// The output format always follows the playback width.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            output_audio_format: Some(self.playback.width.as_str().to_string()),
            ..self.session.clone()
        }
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> ConfigResult<()> {
        self.connection
            .endpoint()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.connection.connect_timeout_ms == 0 {
            return Err(invalid("connection.connect_timeout_ms", "must be positive"));
        }

        let capture = &self.capture;
        if !(8000..=48000).contains(&capture.sample_rate) {
            return Err(invalid("capture.sample_rate", "must be within 8000..=48000"));
        }
        if !(5..=200).contains(&capture.frame_ms) {
            return Err(invalid("capture.frame_ms", "must be within 5..=200"));
        }
        if capture.level_interval_ms == 0 {
            return Err(invalid("capture.level_interval_ms", "must be positive"));
        }
        if capture
            .gate_threshold
            .is_some_and(|t| !(0.0..=1.0).contains(&t))
        {
            return Err(invalid("capture.gate_threshold", "must be within 0..=1"));
        }
        if !(0.0..=1.0).contains(&capture.barge_in_threshold) {
            return Err(invalid("capture.barge_in_threshold", "must be within 0..=1"));
        }

        let playback = &self.playback;
        if !(8000..=192000).contains(&playback.sample_rate) {
            return Err(invalid("playback.sample_rate", "must be within 8000..=192000"));
        }
        if !(0.0..=1.0).contains(&playback.volume) {
            return Err(invalid("playback.volume", "must be within 0..=1"));
        }
        if !(0.0..=50.0).contains(&playback.crossfade_ms) {
            return Err(invalid("playback.crossfade_ms", "must be within 0..=50"));
        }

        if let Some(format) = self.session.input_audio_format.as_deref()
            && PcmWidth::parse(format).ok() != Some(PcmWidth::Pcm16)
        {
            return Err(invalid("session.input_audio_format", "capture sends pcm16 only"));
        }
        if let Some(temperature) = self.session.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(invalid("session.temperature", "must be within 0..=2"));
        }
        Ok(())
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) {
        if let Some(c) = yaml.connection {
            let conn = &mut self.connection;
            if let Some(v) = c.url {
                conn.url = v;
            }
            if let Some(v) = c.api_key {
                conn.api_key = v;
            }
            if let Some(v) = c.model {
                conn.model = Some(v);
            }
            if let Some(v) = c.connect_timeout_ms {
                conn.connect_timeout_ms = v;
            }
            if let Some(v) = c.heartbeat_interval_ms {
                conn.heartbeat_interval_ms = v;
            }
            if let Some(r) = c.reconnection {
                if let Some(v) = r.enabled {
                    conn.reconnection.enabled = v;
                }
                if let Some(v) = r.max_attempts {
                    conn.reconnection.max_attempts = v;
                }
                if let Some(v) = r.base_delay_ms {
                    conn.reconnection.base_delay_ms = v;
                }
            }
        }

        if let Some(s) = yaml.session {
            let session = &mut self.session;
            macro_rules! overlay {
                ($($field:ident),*) => {
                    $(if s.$field.is_some() {
                        session.$field = s.$field;
                    })*
                };
            }
            overlay!(
                modalities,
                instructions,
                voice,
                input_audio_format,
                output_audio_format,
                turn_detection,
                temperature,
                top_p,
                top_k,
                max_response_output_tokens,
                frequency_penalty,
                presence_penalty,
                repetition_penalty,
                seed
            );
            if let Some(model) = s.transcription_model {
                session.input_audio_transcription = Some(InputAudioTranscription { model });
            }
        }

        if let Some(c) = yaml.capture {
            let capture = &mut self.capture;
            if c.device.is_some() {
                capture.device = c.device;
            }
            if let Some(v) = c.sample_rate {
                capture.sample_rate = v;
            }
            if let Some(v) = c.frame_ms {
                capture.frame_ms = v;
            }
            if c.gate_threshold.is_some() {
                capture.gate_threshold = c.gate_threshold;
            }
            if let Some(v) = c.level_interval_ms {
                capture.level_interval_ms = v;
            }
            if let Some(v) = c.local_barge_in {
                capture.local_barge_in = v;
            }
            if let Some(v) = c.barge_in_threshold {
                capture.barge_in_threshold = v;
            }
        }

        if let Some(p) = yaml.playback {
            let playback = &mut self.playback;
            if p.device.is_some() {
                playback.device = p.device;
            }
            if let Some(v) = p.sample_rate {
                playback.sample_rate = v;
            }
            if let Some(v) = p.width {
                playback.width = v;
            }
            if let Some(v) = p.lead_ms {
                playback.lead_ms = v;
            }
            if let Some(v) = p.crossfade_ms {
                playback.crossfade_ms = v;
            }
            if let Some(v) = p.dc_removal {
                playback.dc_removal = v;
            }
            if let Some(v) = p.volume {
                playback.volume = v;
            }
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
