//! Speech-to-text contract and audio container detection.

use serde::{Deserialize, Serialize};

use vx_domain::error::{Error, Result};

/// Maximum accepted audio blob size (25 MiB).
pub const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// Recognized audio containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
    Webm,
}

impl AudioFormat {
    /// Detect the container from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 12 {
            return None;
        }
        if &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if &bytes[0..4] == b"OggS" {
            return Some(Self::Ogg);
        }
        if &bytes[0..4] == b"fLaC" {
            return Some(Self::Flac);
        }
        if &bytes[0..4] == &[0x1A, 0x45, 0xDF, 0xA3] {
            return Some(Self::Webm);
        }
        if &bytes[0..3] == b"ID3" || (bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0) {
            return Some(Self::Mp3);
        }
        None
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Webm => "webm",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::Webm => "audio/webm",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wav" => Some(Self::Wav),
            "mp3" | "mpeg" => Some(Self::Mp3),
            "ogg" | "opus" => Some(Self::Ogg),
            "flac" => Some(Self::Flac),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }
}

/// A transcription request: raw audio plus an optional declared format.
#[derive(Debug, Clone)]
pub struct SttRequest {
    pub audio: Vec<u8>,
    /// Declared container; sniffed from magic bytes when absent.
    pub format: Option<AudioFormat>,
    pub language: Option<String>,
}

impl SttRequest {
    pub fn new(audio: Vec<u8>) -> Self {
        Self {
            audio,
            format: None,
            language: None,
        }
    }

    /// Validate the blob and resolve its container.
    ///
    /// The sniffed format wins over the declared one when both are present
    /// and disagree (clients routinely mislabel uploads).
    pub fn resolve_format(&self) -> Result<AudioFormat> {
        if self.audio.is_empty() {
            return Err(Error::InputInvalid("audio is empty".into()));
        }
        if self.audio.len() > MAX_AUDIO_BYTES {
            return Err(Error::InputInvalid(format!(
                "audio exceeds {} bytes",
                MAX_AUDIO_BYTES
            )));
        }
        match (AudioFormat::sniff(&self.audio), self.format) {
            (Some(sniffed), _) => Ok(sniffed),
            (None, Some(declared)) => Ok(declared),
            (None, None) => Err(Error::InputInvalid(
                "unrecognized audio format (expected wav, mp3, ogg, flac, or webm)".into(),
            )),
        }
    }
}

/// Transcription output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// Audio duration, when the vendor reports it.
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Trait every speech-to-text adapter implements.
///
/// Implementations must be safe for concurrent callers; per-request state is
/// stack-local.
#[async_trait::async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(&self, req: SttRequest) -> Result<Transcript>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_header() -> Vec<u8> {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(&[0u8; 32]);
        bytes
    }

    #[test]
    fn sniffs_wav() {
        assert_eq!(AudioFormat::sniff(&wav_header()), Some(AudioFormat::Wav));
    }

    #[test]
    fn sniffs_mp3_id3_and_sync() {
        let mut id3 = b"ID3".to_vec();
        id3.extend_from_slice(&[0u8; 16]);
        assert_eq!(AudioFormat::sniff(&id3), Some(AudioFormat::Mp3));

        let mut sync = vec![0xFF, 0xFB];
        sync.extend_from_slice(&[0u8; 16]);
        assert_eq!(AudioFormat::sniff(&sync), Some(AudioFormat::Mp3));
    }

    #[test]
    fn sniffs_ogg_flac_webm() {
        let mut ogg = b"OggS".to_vec();
        ogg.extend_from_slice(&[0u8; 16]);
        assert_eq!(AudioFormat::sniff(&ogg), Some(AudioFormat::Ogg));

        let mut flac = b"fLaC".to_vec();
        flac.extend_from_slice(&[0u8; 16]);
        assert_eq!(AudioFormat::sniff(&flac), Some(AudioFormat::Flac));

        let mut webm = vec![0x1A, 0x45, 0xDF, 0xA3];
        webm.extend_from_slice(&[0u8; 16]);
        assert_eq!(AudioFormat::sniff(&webm), Some(AudioFormat::Webm));
    }

    #[test]
    fn short_buffer_is_not_sniffed() {
        assert_eq!(AudioFormat::sniff(b"RIFF"), None);
    }

    #[test]
    fn empty_audio_rejected() {
        let req = SttRequest::new(Vec::new());
        let err = req.resolve_format().unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn oversized_audio_rejected() {
        let mut req = SttRequest::new(wav_header());
        req.audio.resize(MAX_AUDIO_BYTES + 1, 0);
        let err = req.resolve_format().unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn sniffed_format_wins_over_declared() {
        let mut req = SttRequest::new(wav_header());
        req.format = Some(AudioFormat::Mp3);
        assert_eq!(req.resolve_format().unwrap(), AudioFormat::Wav);
    }

    #[test]
    fn declared_format_used_when_sniff_fails() {
        let mut req = SttRequest::new(vec![0u8; 64]);
        req.format = Some(AudioFormat::Mp3);
        assert_eq!(req.resolve_format().unwrap(), AudioFormat::Mp3);
    }

    #[test]
    fn unknown_format_rejected() {
        let req = SttRequest::new(vec![0u8; 64]);
        assert_eq!(req.resolve_format().unwrap_err().kind(), "input_invalid");
    }

    #[test]
    fn format_parse_aliases() {
        assert_eq!(AudioFormat::parse("MP3"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::parse("opus"), Some(AudioFormat::Ogg));
        assert_eq!(AudioFormat::parse("midi"), None);
    }
}
