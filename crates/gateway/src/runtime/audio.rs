//! Audio-out leg of a turn: pipe the final text through TTS and emit
//! sequenced `audio.chunk` events.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use futures_util::StreamExt;
use tracing::Instrument;

use vx_domain::error::{Error, Result};
use vx_domain::event::AgentEvent;
use vx_speech::{TtsProvider, TtsRequest};

use crate::runtime::cancel::CancelToken;
use crate::runtime::sink::EventSink;
use crate::state::AppState;

/// Voice parameters carried by a turn request.
#[derive(Debug, Clone, Default)]
pub struct VoiceParams {
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
}

impl VoiceParams {
    fn into_request(self, text: String) -> TtsRequest {
        TtsRequest {
            text,
            voice: self.voice,
            speed: self.speed,
            pitch: self.pitch,
            volume: self.volume,
            format: None,
        }
    }
}

/// Stream synthesized speech for `text` into the sink.
///
/// Chunks carry a strictly monotonic sequence number. A provider failure
/// mid-stream is returned to the caller (already-emitted audio stays valid);
/// barge-in cancels the stream promptly.
pub async fn stream_speech(
    state: &AppState,
    sink: &mut EventSink,
    cancel: &CancelToken,
    text: &str,
    voice: VoiceParams,
) -> Result<()> {
    let tts: &Arc<dyn TtsProvider> = state
        .tts
        .as_ref()
        .ok_or_else(|| Error::unavailable("tts", "no TTS endpoint configured"))?;

    let span = tracing::info_span!("tts.synthesize", chars = text.len());
    let started = Instant::now();
    let mut stream = tts
        .synthesize(voice.into_request(text.to_string()))
        .instrument(span)
        .await?;

    let mut sequence: u64 = 0;
    let mut first_chunk = true;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let Some(chunk) = chunk else { break };
        let bytes = chunk?;
        if bytes.is_empty() {
            continue;
        }

        if first_chunk {
            first_chunk = false;
            state
                .metrics
                .tts_first_chunk
                .observe(started.elapsed().as_secs_f64());
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        sink.send(AgentEvent::audio_chunk(encoded, sequence)).await?;
        sequence += 1;
    }

    tracing::debug!(chunks = sequence, "speech stream complete");
    Ok(())
}
