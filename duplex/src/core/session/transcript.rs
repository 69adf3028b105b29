//! Conversation transcript buffers.

use serde::Serialize;

use crate::core::realtime::{TranscriptChannel, TranscriptRole};

/// Finalized entries kept before the oldest are discarded.
const MAX_ENTRIES: usize = 256;

/// One transcript update delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptUpdate {
    pub role: TranscriptRole,
    pub channel: TranscriptChannel,
    pub response_id: Option<String>,
    /// Accumulated text for the current turn
    pub text: String,
    pub is_final: bool,
}

/// A completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub channel: TranscriptChannel,
    pub response_id: Option<String>,
    pub text: String,
}

/// Partial text per channel plus the finalized history.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    input: String,
    speech: String,
    text: String,
    entries: Vec<TranscriptEntry>,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, channel: TranscriptChannel) -> &mut String {
        match channel {
            TranscriptChannel::Input => &mut self.input,
            TranscriptChannel::Speech => &mut self.speech,
            TranscriptChannel::Text => &mut self.text,
        }
    }

    /// Record an update. Final updates move the text into the history.
    pub fn apply(
        &mut self,
        channel: TranscriptChannel,
        response_id: Option<String>,
        text: String,
        is_final: bool,
    ) -> TranscriptUpdate {
        if is_final {
            self.slot(channel).clear();
            if !text.trim().is_empty() {
                if self.entries.len() == MAX_ENTRIES {
                    self.entries.remove(0);
                }
                self.entries.push(TranscriptEntry {
                    role: channel.role(),
                    channel,
                    response_id: response_id.clone(),
                    text: text.clone(),
                });
            }
        } else {
            *self.slot(channel) = text.clone();
        }

        TranscriptUpdate {
            role: channel.role(),
            channel,
            response_id,
            text,
            is_final,
        }
    }

    /// Drop partial assistant text (barge-in or new response).
    pub fn clear_assistant(&mut self) {
        self.speech.clear();
        self.text.clear();
    }

    /// Drop all partial text, keeping the history.
    pub fn clear_partials(&mut self) {
        self.input.clear();
        self.clear_assistant();
    }

    pub fn partial(&self, channel: TranscriptChannel) -> &str {
        match channel {
            TranscriptChannel::Input => &self.input,
            TranscriptChannel::Speech => &self.speech,
            TranscriptChannel::Text => &self.text,
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.clear_partials();
        self.entries.clear();
    }
}
