//! cpal microphone source.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::{
    CaptureError, CaptureFormat, CaptureResult, CaptureSource, SampleCallback,
    SourceErrorCallback,
};
use crate::core::probe::{self, classify};

/// Captures from a named or default input device at its default config.
pub struct CpalCaptureSource {
    device_name: Option<String>,
    device: Option<cpal::Device>,
    config: Option<StreamConfig>,
    sample_format: SampleFormat,
    stream: Option<Stream>,
}

impl CpalCaptureSource {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            device: None,
            config: None,
            sample_format: SampleFormat::F32,
            stream: None,
        }
    }
}

impl CaptureSource for CpalCaptureSource {
    fn open(&mut self) -> CaptureResult<CaptureFormat> {
        let device = probe::input_device(self.device_name.as_deref())?;
        let supported = device
            .default_input_config()
            .map_err(|e| CaptureError::from(classify(e.to_string())))?;

        let config: StreamConfig = supported.config();
        let format = CaptureFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        };
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            sample_format = ?supported.sample_format(),
            "input device opened"
        );

        self.sample_format = supported.sample_format();
        self.config = Some(config);
        self.device = Some(device);
        Ok(format)
    }

    fn start(
        &mut self,
        on_samples: SampleCallback,
        on_error: SourceErrorCallback,
    ) -> CaptureResult<()> {
        let (Some(device), Some(config)) = (self.device.as_ref(), self.config.as_ref()) else {
            return Err(CaptureError::NotInitialized);
        };

        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(device, config, on_samples, on_error),
            SampleFormat::I16 => build_stream::<i16>(device, config, on_samples, on_error),
            SampleFormat::U16 => build_stream::<u16>(device, config, on_samples, on_error),
            SampleFormat::I32 => build_stream::<i32>(device, config, on_samples, on_error),
            other => Err(CaptureError::Device(format!(
                "unsupported input sample format {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| CaptureError::from(classify(e.to_string())))?;

        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the stream halts the device callback
        if self.stream.take().is_some() {
            tracing::debug!("input stream closed");
        }
    }

    fn close(&mut self) {
        self.stop();
        self.config = None;
        self.device = None;
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut on_samples: SampleCallback,
    mut on_error: SourceErrorCallback,
) -> CaptureResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
                on_samples(&scratch);
            },
            move |err| {
                let err = match err {
                    cpal::StreamError::DeviceNotAvailable => {
                        CaptureError::Device("input device no longer available".to_string())
                    }
                    other => CaptureError::from(classify(other.to_string())),
                };
                on_error(err);
            },
            None,
        )
        .map_err(|e| CaptureError::from(classify(e.to_string())))
}
