//! Text-to-speech contract.

use serde::{Deserialize, Serialize};

use vx_domain::error::Result;
use vx_domain::stream::BoxStream;

/// Lazy ordered sequence of audio byte chunks.
///
/// Chunk size targets first-chunk latency below 500 ms for short texts. If
/// the provider disconnects mid-stream, the sequence terminates with an
/// `ExternalUnavailable` item; everything emitted before it remains valid.
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// A synthesis request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TtsRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    /// Playback rate multiplier (1.0 = normal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
    /// Semitone shift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    /// Output gain (0.0–1.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// Container hint (e.g. "mp3", "wav").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl TtsRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn pitch(mut self, pitch: f32) -> Self {
        self.pitch = Some(pitch);
        self
    }

    pub fn volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Trait every text-to-speech adapter implements.
///
/// Implementations must be safe for concurrent callers.
#[async_trait::async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize `req.text` into an ordered stream of audio chunks.
    async fn synthesize(&self, req: TtsRequest) -> Result<AudioStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_voice_params() {
        let req = TtsRequest::new("hello")
            .voice("nova")
            .speed(1.2)
            .pitch(-2.0)
            .volume(0.8);
        assert_eq!(req.voice.as_deref(), Some("nova"));
        assert_eq!(req.speed, Some(1.2));
        assert_eq!(req.pitch, Some(-2.0));
        assert_eq!(req.volume, Some(0.8));
    }

    #[test]
    fn serde_skips_unset_fields() {
        let json = serde_json::to_string(&TtsRequest::new("hi")).unwrap();
        assert!(!json.contains("voice"));
        assert!(!json.contains("pitch"));
    }
}
