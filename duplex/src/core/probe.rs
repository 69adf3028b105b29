//! Audio capability probe and device lookup.
//!
//! Produces a serializable record of the host's audio devices so callers can
//! decide up front whether a duplex session can run at all.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use thiserror::Error;

/// Device lookup failures shared by the capture and playback adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No {0} device available")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// One device in the capability record.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub sample_format: Option<String>,
}

/// Capability record returned by [`probe`].
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub host: String,
    pub inputs: Vec<DeviceInfo>,
    pub outputs: Vec<DeviceInfo>,
}

impl Capabilities {
    /// Whether a full-duplex session is possible.
    pub fn supports_duplex(&self) -> bool {
        !self.inputs.is_empty() && !self.outputs.is_empty()
    }
}

/// Enumerate input and output devices on the default host.
pub fn probe() -> Result<Capabilities, DeviceError> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let mut inputs = Vec::new();
    for device in host.input_devices().map_err(|e| classify(e.to_string()))? {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let config = device.default_input_config().ok();
        inputs.push(DeviceInfo {
            is_default: default_input.as_deref() == Some(name.as_str()),
            name,
            sample_rate: config.as_ref().map(|c| c.sample_rate().0),
            channels: config.as_ref().map(|c| c.channels()),
            sample_format: config.as_ref().map(|c| format!("{:?}", c.sample_format())),
        });
    }

    let mut outputs = Vec::new();
    for device in host.output_devices().map_err(|e| classify(e.to_string()))? {
        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        let config = device.default_output_config().ok();
        outputs.push(DeviceInfo {
            is_default: default_output.as_deref() == Some(name.as_str()),
            name,
            sample_rate: config.as_ref().map(|c| c.sample_rate().0),
            channels: config.as_ref().map(|c| c.channels()),
            sample_format: config.as_ref().map(|c| format!("{:?}", c.sample_format())),
        });
    }

    tracing::debug!(
        host = host.id().name(),
        inputs = inputs.len(),
        outputs = outputs.len(),
        "audio devices probed"
    );

    Ok(Capabilities {
        host: host.id().name().to_string(),
        inputs,
        outputs,
    })
}

/// Find an input device by name, or the default one.
pub fn input_device(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| classify(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(format!("input '{name}'"))),
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::NotFound("input".to_string())),
    }
}

/// Find an output device by name, or the default one.
pub fn output_device(name: Option<&str>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| classify(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(format!("output '{name}'"))),
        None => host
            .default_output_device()
            .ok_or_else(|| DeviceError::NotFound("output".to_string())),
    }
}

/// Map a backend message onto the error taxonomy.
///
/// Backends report permission failures only as text.
pub fn classify(message: String) -> DeviceError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied(message)
    } else {
        DeviceError::Backend(message)
    }
}
