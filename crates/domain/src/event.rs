//! Client-facing event schema shared by the SSE and WebSocket transports.
//!
//! Every serialized event carries `v`, the schema version; breaking changes
//! increment [`SCHEMA_VERSION`]. Within a turn: `start` comes first,
//! `text.delta` follows generation order, each `tool.start` strictly precedes
//! its matching `tool.end`, `audio.chunk` sequences are strictly monotonic,
//! and exactly one of `end`/`error` terminates the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version of the client event schema.
pub const SCHEMA_VERSION: u8 = 1;

/// Events pushed server→client during one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "start")]
    Start {
        v: u8,
        turn_id: String,
        session_id: String,
    },

    #[serde(rename = "text.delta")]
    TextDelta { v: u8, chunk: String },

    #[serde(rename = "tool.start")]
    ToolStart {
        v: u8,
        call_id: String,
        name: String,
        args: Value,
    },

    #[serde(rename = "tool.end")]
    ToolEnd {
        v: u8,
        call_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// One chunk of synthesized speech, base64-encoded.
    #[serde(rename = "audio.chunk")]
    AudioChunk { v: u8, bytes: String, sequence: u64 },

    #[serde(rename = "warning")]
    Warning { v: u8, code: String, message: String },

    /// Terminal failure.
    #[serde(rename = "error")]
    Error { v: u8, kind: String, message: String },

    /// Terminal success.
    #[serde(rename = "end")]
    End { v: u8, turn_id: String },
}

impl AgentEvent {
    pub fn start(turn_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::Start {
            v: SCHEMA_VERSION,
            turn_id: turn_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn text_delta(chunk: impl Into<String>) -> Self {
        Self::TextDelta {
            v: SCHEMA_VERSION,
            chunk: chunk.into(),
        }
    }

    pub fn tool_start(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self::ToolStart {
            v: SCHEMA_VERSION,
            call_id: call_id.into(),
            name: name.into(),
            args,
        }
    }

    pub fn tool_end(call_id: impl Into<String>, success: bool, error: Option<String>) -> Self {
        Self::ToolEnd {
            v: SCHEMA_VERSION,
            call_id: call_id.into(),
            success,
            error,
        }
    }

    pub fn audio_chunk(bytes_b64: impl Into<String>, sequence: u64) -> Self {
        Self::AudioChunk {
            v: SCHEMA_VERSION,
            bytes: bytes_b64.into(),
            sequence,
        }
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Warning {
            v: SCHEMA_VERSION,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn error(err: &crate::Error) -> Self {
        Self::Error {
            v: SCHEMA_VERSION,
            kind: err.kind().to_string(),
            message: err.user_message(),
        }
    }

    pub fn end(turn_id: impl Into<String>) -> Self {
        Self::End {
            v: SCHEMA_VERSION,
            turn_id: turn_id.into(),
        }
    }

    /// Name used for the SSE `event:` field and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text.delta",
            Self::ToolStart { .. } => "tool.start",
            Self::ToolEnd { .. } => "tool.end",
            Self::AudioChunk { .. } => "audio.chunk",
            Self::Warning { .. } => "warning",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
        }
    }

    /// Whether this event closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// Requested output modality for a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Text,
    Audio,
    Both,
}

impl OutputMode {
    pub fn wants_audio(self) -> bool {
        matches!(self, Self::Audio | Self::Both)
    }

    pub fn wants_text(self) -> bool {
        matches!(self, Self::Text | Self::Both)
    }
}

/// Control events received client→server on the duplex socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// Start a text turn.
    #[serde(rename = "message")]
    Message {
        text: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        output_mode: OutputMode,
        #[serde(default)]
        voice: Option<String>,
    },

    /// Cancel the in-flight turn.
    #[serde(rename = "cancel")]
    Cancel,

    /// Interrupt the assistant mid-response (cancels the turn, including an
    /// active speech stream); the socket stays open for the next turn.
    #[serde(rename = "barge-in")]
    BargeIn,

    /// One chunk of live microphone input, base64-encoded.
    #[serde(rename = "audio.chunk")]
    AudioChunk { bytes: String },

    /// End of live microphone input; run the buffered audio as a turn.
    #[serde(rename = "audio.end")]
    AudioEnd {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        output_mode: OutputMode,
        #[serde(default)]
        voice: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_schema_version() {
        let json = serde_json::to_value(AgentEvent::text_delta("hi")).unwrap();
        assert_eq!(json["v"], SCHEMA_VERSION);
        assert_eq!(json["type"], "text.delta");
    }

    #[test]
    fn terminal_classification() {
        assert!(AgentEvent::end("t1").is_terminal());
        assert!(AgentEvent::error(&crate::Error::Cancelled).is_terminal());
        assert!(!AgentEvent::warning("slow-consumer", "buffer full").is_terminal());
        assert!(!AgentEvent::start("t1", "s1").is_terminal());
    }

    #[test]
    fn error_event_uses_kind_and_friendly_message() {
        let err = crate::Error::ToolFault("stack trace here".into());
        let json = serde_json::to_value(AgentEvent::error(&err)).unwrap();
        assert_eq!(json["kind"], "tool_fault");
        assert!(!json["message"].as_str().unwrap().contains("stack trace"));
    }

    #[test]
    fn control_event_parses_barge_in() {
        let ev: ControlEvent = serde_json::from_str(r#"{"type":"barge-in"}"#).unwrap();
        assert!(matches!(ev, ControlEvent::BargeIn));
    }

    #[test]
    fn control_message_defaults_output_mode() {
        let ev: ControlEvent =
            serde_json::from_str(r#"{"type":"message","text":"hello"}"#).unwrap();
        match ev {
            ControlEvent::Message { output_mode, .. } => {
                assert_eq!(output_mode, OutputMode::Text)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn output_mode_both_wants_everything() {
        assert!(OutputMode::Both.wants_audio());
        assert!(OutputMode::Both.wants_text());
        assert!(!OutputMode::Text.wants_audio());
        assert!(!OutputMode::Audio.wants_text());
    }
}
