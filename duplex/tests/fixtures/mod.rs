//! Test Fixtures Module
//!
//! Generated audio and server event builders shared by the integration tests.

// Allow dead code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]

use std::f32::consts::PI;

use serde_json::{Value, json};
use waav_duplex::core::codec::{self, PcmWidth};

/// Protocol output rate used by the fixtures
pub const OUTPUT_RATE: u32 = 24000;

/// 20ms at 24kHz
pub const MS_20: usize = 480;

/// Generate a sine tone as f32 samples
pub fn sine(samples: usize, frequency: f32, amplitude: f32, sample_rate: u32) -> Vec<f32> {
    let angular = 2.0 * PI * frequency / sample_rate as f32;
    (0..samples)
        .map(|i| (angular * i as f32).sin() * amplitude)
        .collect()
}

/// PCM16 bytes of a 440Hz tone at the output rate
pub fn tone_pcm16(samples: usize) -> Vec<u8> {
    codec::encode(&sine(samples, 440.0, 0.5, OUTPUT_RATE), PcmWidth::Pcm16)
}

/// Base64 payload of a 440Hz tone
pub fn tone_delta(samples: usize) -> String {
    codec::encode_base64(&tone_pcm16(samples))
}

// =============================================================================
// Server events
// =============================================================================

pub fn session_created(id: &str) -> Value {
    json!({
        "type": "session.created",
        "event_id": "evt_srv_session",
        "session": { "id": id, "model": "gpt-4o-realtime-preview", "voice": "alloy" }
    })
}

pub fn response_created(id: &str) -> Value {
    json!({
        "type": "response.created",
        "response": { "id": id, "status": "in_progress" }
    })
}

pub fn response_done(id: &str) -> Value {
    json!({
        "type": "response.done",
        "response": { "id": id, "status": "completed" }
    })
}

pub fn audio_delta(response_id: &str, samples: usize) -> Value {
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "item_id": "item_1",
        "output_index": 0,
        "content_index": 0,
        "delta": tone_delta(samples)
    })
}

pub fn transcript_delta(response_id: &str, delta: &str) -> Value {
    json!({
        "type": "response.audio_transcript.delta",
        "response_id": response_id,
        "delta": delta
    })
}

pub fn transcript_done(response_id: &str, transcript: &str) -> Value {
    json!({
        "type": "response.audio_transcript.done",
        "response_id": response_id,
        "transcript": transcript
    })
}

pub fn speech_started(audio_start_ms: u64) -> Value {
    json!({
        "type": "input_audio_buffer.speech_started",
        "audio_start_ms": audio_start_ms,
        "item_id": "item_user"
    })
}

pub fn server_error(code: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "type": "invalid_request_error", "code": code, "message": message }
    })
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `condition` until it holds or five seconds pass.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}
