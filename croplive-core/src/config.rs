use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// System instruction sent in the setup handshake when the caller doesn't
/// supply one.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are an expert agricultural AI assistant specializing in crop health analysis. \
Analyze images of crops in real-time to identify: crop type and variety, plant health status, \
visible diseases, pests, or deficiencies, nutritional deficiencies (yellowing, spots, wilting), \
environmental stress indicators, and actionable recommendations for treatment. \
Provide clear, concise responses suitable for farmers. Be specific about diseases and treatments.";

/// Prompt attached to every 3rd captured frame to force a model turn.
pub const ANALYSIS_PROMPT: &str = "What do you see in this image? Analyze the crop health, \
identify any diseases, pests, or issues. Be specific and concise.";

/// Session configuration with the capture and cadence constants the rest of
/// the workspace keys off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub system_instruction: String,
    pub analysis_prompt: String,

    /// Seconds between captured frames (1 Hz in production).
    pub frame_interval: Duration,
    /// Every Nth frame is sent as a prompted turn; the rest are context.
    pub prompted_frame_divisor: u32,

    /// Mean-absolute-amplitude floor below which a chunk is dropped.
    pub noise_gate_threshold: f32,
    /// Microphone capture rate the service accepts.
    pub input_sample_rate_hz: u32,
    /// Fixed rate of inbound inline audio.
    pub output_sample_rate_hz: u32,
    /// Samples per outbound audio chunk.
    pub audio_chunk_samples: usize,

    pub connect_timeout: Duration,
}

impl LiveConfig {
    pub fn production(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.into(),
            model: DEFAULT_MODEL.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            analysis_prompt: ANALYSIS_PROMPT.into(),
            frame_interval: Duration::from_secs(1),
            prompted_frame_divisor: 3,
            noise_gate_threshold: 0.01,
            input_sample_rate_hz: 16_000,
            output_sample_rate_hz: 24_000,
            audio_chunk_samples: 4096,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// A missing credential is a hard connect-time failure, checked before
    /// any socket work happens.
    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}
