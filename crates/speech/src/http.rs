//! HTTP speech adapter against OpenAI-style audio endpoints.
//!
//! - STT: `POST {base}/audio/transcriptions` (multipart file upload)
//! - TTS: `POST {base}/audio/speech` (streamed response body)

use serde_json::Value;

use vx_domain::config::SpeechEndpointConfig;
use vx_domain::error::{Error, Result};

use crate::stt::{SttProvider, SttRequest, Transcript};
use crate::tts::{AudioStream, TtsProvider, TtsRequest};

/// Target chunk size for re-chunked TTS output. Small enough that the first
/// chunk of a short utterance leaves within the 500 ms latency budget.
const TTS_CHUNK_BYTES: usize = 8 * 1024;

pub struct HttpSpeechClient {
    base_url: String,
    api_key: Option<String>,
    model: Option<String>,
    default_voice: Option<String>,
    client: reqwest::Client,
}

impl HttpSpeechClient {
    pub fn from_config(cfg: &SpeechEndpointConfig) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::unavailable("speech", e.to_string()))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            default_voice: cfg.voice.clone(),
            client,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// STT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl SttProvider for HttpSpeechClient {
    async fn transcribe(&self, req: SttRequest) -> Result<Transcript> {
        let format = req.resolve_format()?;

        let file_part = reqwest::multipart::Part::bytes(req.audio)
            .file_name(format!("audio.{}", format.extension()))
            .mime_str(format.mime_type())
            .map_err(|e| Error::Internal(format!("multipart: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("response_format", "verbose_json");
        if let Some(ref model) = self.model {
            form = form.text("model", model.clone());
        }
        if let Some(language) = req.language {
            form = form.text("language", language);
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let started = std::time::Instant::now();
        let resp = self
            .authed(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| map_reqwest("stt", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status("stt", status, &body));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| map_reqwest("stt", e))?;

        let text = v
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        // Vendors report duration in seconds; fall back to wall clock.
        let duration_ms = v
            .get("duration")
            .and_then(|d| d.as_f64())
            .map(|secs| (secs * 1000.0) as u64)
            .unwrap_or_else(|| started.elapsed().as_millis() as u64);
        let confidence = v.get("confidence").and_then(|c| c.as_f64()).map(|c| c as f32);

        tracing::debug!(chars = text.len(), duration_ms, "transcription complete");

        Ok(Transcript {
            text,
            duration_ms,
            confidence,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TTS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl TtsProvider for HttpSpeechClient {
    async fn synthesize(&self, req: TtsRequest) -> Result<AudioStream> {
        if req.text.trim().is_empty() {
            return Err(Error::InputInvalid("synthesis text is empty".into()));
        }

        let mut body = serde_json::json!({
            "input": req.text,
            "response_format": req.format.as_deref().unwrap_or("mp3"),
        });
        if let Some(ref model) = self.model {
            body["model"] = Value::String(model.clone());
        }
        if let Some(voice) = req.voice.as_deref().or(self.default_voice.as_deref()) {
            body["voice"] = Value::String(voice.to_string());
        }
        if let Some(speed) = req.speed {
            body["speed"] = serde_json::json!(speed);
        }
        if let Some(pitch) = req.pitch {
            body["pitch"] = serde_json::json!(pitch);
        }
        if let Some(volume) = req.volume {
            body["volume"] = serde_json::json!(volume);
        }

        let url = format!("{}/audio/speech", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest("tts", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_status("tts", status, &text));
        }

        // Re-chunk the body so the first audible bytes go out promptly and
        // downstream consumers see bounded chunk sizes.
        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut pending: Vec<u8> = Vec::with_capacity(TTS_CHUNK_BYTES);
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        while pending.len() >= TTS_CHUNK_BYTES {
                            let rest = pending.split_off(TTS_CHUNK_BYTES);
                            yield Ok(std::mem::replace(&mut pending, rest));
                        }
                        // Flush whatever we have rather than waiting for a
                        // full chunk; latency beats packing efficiency here.
                        if !pending.is_empty() {
                            yield Ok(std::mem::take(&mut pending));
                        }
                    }
                    Ok(None) => {
                        if !pending.is_empty() {
                            yield Ok(std::mem::take(&mut pending));
                        }
                        break;
                    }
                    Err(e) => {
                        // The already-emitted prefix stays valid.
                        yield Err(Error::unavailable("tts", e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn map_reqwest(service: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{service}: {e}"))
    } else {
        Error::unavailable(service, e.to_string())
    }
}

fn map_status(service: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(300).collect();
    if status.is_client_error() && status.as_u16() != 429 {
        Error::InputInvalid(format!("{service} rejected request ({status}): {snippet}"))
    } else {
        Error::unavailable(service, format!("{status}: {snippet}"))
    }
}
