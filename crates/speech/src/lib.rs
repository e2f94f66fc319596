//! Speech adapters: speech-to-text and text-to-speech provider traits plus
//! an HTTP client speaking the OpenAI-style audio endpoints.

pub mod http;
pub mod stt;
pub mod tts;

pub use http::HttpSpeechClient;
pub use stt::{AudioFormat, SttProvider, SttRequest, Transcript, MAX_AUDIO_BYTES};
pub use tts::{AudioStream, TtsProvider, TtsRequest};
