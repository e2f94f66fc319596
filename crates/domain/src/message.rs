use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request from the model for one external action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique within the turn.
    pub id: String,
    /// Registry key of the tool to invoke.
    pub name: String,
    /// JSON-shaped argument map.
    pub arguments: Value,
}

/// Tool definition advertised to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
}

/// Structured failure attached to an unsuccessful [`ToolResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolError {
    /// Stable error kind code (see `Error::kind`).
    pub kind: String,
    pub message: String,
}

/// The outcome of dispatching one [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    /// Structured result on success; `Null` on failure.
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, data: Value, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            data,
            error: None,
            duration_ms,
        }
    }

    pub fn fail(call_id: impl Into<String>, err: &crate::Error, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            data: Value::Null,
            error: Some(ToolError {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
            duration_ms,
        }
    }

    /// Serialize the outcome as text fed back to the model.
    ///
    /// Failures are phrased so the model can decide to retry, switch tools,
    /// or give up; raw stack traces never appear here.
    pub fn content_for_model(&self) -> String {
        if self.success {
            serde_json::to_string(&self.data).unwrap_or_else(|_| "null".into())
        } else {
            let err = self.error.as_ref();
            format!(
                "tool error ({}): {}",
                err.map(|e| e.kind.as_str()).unwrap_or("unknown"),
                err.map(|e| e.message.as_str()).unwrap_or("no detail"),
            )
        }
    }
}

/// Speaker role of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One utterance in a conversation.
///
/// Invariants: an assistant message carries non-empty `content` or non-empty
/// `tool_calls` (or both when the model narrates before calling tools); a
/// tool message carries `tool_call_id` referencing a call in the immediately
/// preceding assistant message of the same turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Groups the messages of one turn; eviction never splits a group.
    pub turn_id: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, turn_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            turn_id: turn_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, "", content)
    }

    pub fn user(turn_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::User, turn_id, content)
    }

    pub fn assistant(turn_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, turn_id, content)
    }

    /// Assistant message carrying tool calls (content may be empty).
    pub fn assistant_tool_calls(
        turn_id: impl Into<String>,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut msg = Self::new(Role::Assistant, turn_id, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Tool-result message bound to a call in the preceding assistant message.
    pub fn tool(
        turn_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, turn_id, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// Split a message slice into consecutive turn groups, preserving order.
///
/// Used by the history window to evict whole turns: a group is the maximal
/// run of messages sharing a `turn_id`.
pub fn turn_groups(messages: &[Message]) -> Vec<&[Message]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=messages.len() {
        if i == messages.len() || messages[i].turn_id != messages[start].turn_id {
            groups.push(&messages[start..i]);
            start = i;
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_ok_round_trip() {
        let result = ToolResult::ok("c1", serde_json::json!({"title": "t"}), 12);
        assert!(result.success);
        assert_eq!(result.content_for_model(), r#"{"title":"t"}"#);
    }

    #[test]
    fn tool_result_fail_mentions_kind() {
        let err = crate::Error::ToolTimeout("web_search after 10s".into());
        let result = ToolResult::fail("c1", &err, 10_000);
        assert!(!result.success);
        assert!(result.content_for_model().contains("tool_timeout"));
    }

    #[test]
    fn assistant_tool_calls_keeps_order() {
        let calls = vec![
            ToolCall {
                id: "a".into(),
                name: "web_search".into(),
                arguments: serde_json::json!({"query": "x"}),
            },
            ToolCall {
                id: "b".into(),
                name: "get_time".into(),
                arguments: serde_json::json!({}),
            },
        ];
        let msg = Message::assistant_tool_calls("t1", "", calls);
        assert_eq!(msg.tool_calls[0].id, "a");
        assert_eq!(msg.tool_calls[1].id, "b");
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn tool_message_binds_call_id() {
        let msg = Message::tool("t1", "call-9", "result text");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-9"));
        assert_eq!(msg.role, Role::Tool);
    }

    #[test]
    fn turn_groups_split_on_turn_id() {
        let msgs = vec![
            Message::user("t1", "hi"),
            Message::assistant("t1", "hello"),
            Message::user("t2", "next"),
            Message::assistant("t2", "sure"),
        ];
        let groups = turn_groups(&msgs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].turn_id, "t2");
    }

    #[test]
    fn turn_groups_empty_input() {
        assert!(turn_groups(&[]).is_empty());
    }

    #[test]
    fn serde_skips_empty_optional_fields() {
        let msg = Message::user("t1", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }
}
