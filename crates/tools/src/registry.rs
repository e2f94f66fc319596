//! Tool registry and dispatch.
//!
//! The registry maps tool names to handlers behind the [`Tool`] trait. It is
//! built at startup and immutable afterwards. Dispatch validates arguments
//! against the declared parameter schema, enforces the per-call timeout, and
//! converts every failure mode into a `ToolResult { success: false }` — a
//! tool problem is fed back to the model, never fatal to the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::Instrument;

use vx_domain::error::{Error, Result};
use vx_domain::message::{ToolCall, ToolDefinition, ToolResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptor & trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Static description of a tool: schema, timing, and caching behavior.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: Value,
    pub timeout: Duration,
    /// Whether successful results may be memoized. Clock- and
    /// randomness-sensitive tools opt out.
    pub cacheable: bool,
}

/// Per-dispatch context handed to handlers.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: Option<String>,
}

/// A callable tool. Handlers are pure functions of (arguments, ctx) plus
/// whatever external I/O they perform; the framework guarantees no shared
/// state between calls.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice; later registration wins");
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions advertised to the LLM, sorted by name for stable prompts.
    pub fn describe(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| {
                let d = t.descriptor();
                ToolDefinition {
                    name: d.name,
                    description: d.description,
                    parameters: d.parameters,
                }
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Dispatch one call with validation, timeout, and fault isolation.
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let started = Instant::now();

        let tool = match self.tools.get(&call.name) {
            Some(t) => t.clone(),
            None => {
                let err = Error::ToolNotFound(call.name.clone());
                return ToolResult::fail(&call.id, &err, 0);
            }
        };
        let descriptor = tool.descriptor();

        if let Err(e) = validate_args(&call.arguments, &descriptor.parameters) {
            return ToolResult::fail(&call.id, &e, elapsed_ms(started));
        }

        let span = tracing::info_span!("tool.call", tool = %call.name, call_id = %call.id);
        let args = call.arguments.clone();
        let ctx = ctx.clone();

        // Run the handler on its own task so a panic surfaces as a join
        // error instead of tearing down the turn.
        let handle = tokio::spawn(async move { tool.call(args, &ctx).await }.instrument(span));
        let abort = handle.abort_handle();

        let outcome = tokio::time::timeout(descriptor.timeout, handle).await;
        let duration_ms = elapsed_ms(started);

        match outcome {
            Ok(Ok(Ok(data))) => ToolResult::ok(&call.id, data, duration_ms),
            Ok(Ok(Err(e))) => {
                tracing::debug!(tool = %call.name, error = %e, "tool returned error");
                ToolResult::fail(&call.id, &e, duration_ms)
            }
            Ok(Err(join_err)) => {
                tracing::error!(tool = %call.name, error = %join_err, "tool handler panicked");
                let err = Error::ToolFault(format!("handler for '{}' failed", call.name));
                ToolResult::fail(&call.id, &err, duration_ms)
            }
            Err(_) => {
                abort.abort();
                let err = Error::ToolTimeout(format!(
                    "'{}' exceeded {}s",
                    call.name,
                    descriptor.timeout.as_secs()
                ));
                ToolResult::fail(&call.id, &err, duration_ms)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate arguments against the declared parameter schema.
///
/// Checks the parts of JSON Schema tools actually declare: top-level object
/// shape, `required` keys, and primitive `type` per property. Unknown keys
/// are tolerated.
fn validate_args(args: &Value, schema: &Value) -> Result<()> {
    let obj = args
        .as_object()
        .ok_or_else(|| Error::InputInvalid("arguments must be an object".into()))?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(Error::InputInvalid(format!(
                    "missing required argument '{key}'"
                )));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in obj {
            let Some(expected) = props.get(key).and_then(|p| p.get("type")).and_then(|t| t.as_str())
            else {
                continue;
            };
            let matches = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !matches {
                return Err(Error::InputInvalid(format!(
                    "argument '{key}' should be a {expected}"
                )));
            }
        }
    }

    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".into(),
                description: "Echo the input back.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string" },
                        "count": { "type": "integer" }
                    },
                    "required": ["text"]
                }),
                timeout: Duration::from_secs(1),
                cacheable: true,
            }
        }

        async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
            Ok(serde_json::json!({ "echoed": args["text"] }))
        }
    }

    struct SlowTool;

    #[async_trait::async_trait]
    impl Tool for SlowTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "slow".into(),
                description: "Sleeps past its own timeout.".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                timeout: Duration::from_millis(50),
                cacheable: false,
            }
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct PanickyTool;

    #[async_trait::async_trait]
    impl Tool for PanickyTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "panicky".into(),
                description: "Always panics.".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
                timeout: Duration::from_secs(1),
                cacheable: false,
            }
        }

        async fn call(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
            panic!("boom");
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(EchoTool));
        reg.register(Arc::new(SlowTool));
        reg.register(Arc::new(PanickyTool));
        reg
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn dispatch_success() {
        let result = registry()
            .dispatch(&call("echo", serde_json::json!({"text": "hi"})), &ToolContext::default())
            .await;
        assert!(result.success);
        assert_eq!(result.data["echoed"], "hi");
    }

    #[tokio::test]
    async fn unknown_tool_fails_soft() {
        let result = registry()
            .dispatch(&call("nope", serde_json::json!({})), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, "tool_not_found");
    }

    #[tokio::test]
    async fn missing_required_argument_rejected() {
        let result = registry()
            .dispatch(&call("echo", serde_json::json!({})), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, "input_invalid");
        assert!(result.error.as_ref().unwrap().message.contains("text"));
    }

    #[tokio::test]
    async fn wrong_argument_type_rejected() {
        let result = registry()
            .dispatch(
                &call("echo", serde_json::json!({"text": "hi", "count": "three"})),
                &ToolContext::default(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().message.contains("count"));
    }

    #[tokio::test]
    async fn timeout_becomes_tool_timeout() {
        let result = registry()
            .dispatch(&call("slow", serde_json::json!({})), &ToolContext::default())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, "tool_timeout");
    }

    #[tokio::test]
    async fn panic_becomes_tool_fault_without_detail() {
        let result = registry()
            .dispatch(&call("panicky", serde_json::json!({})), &ToolContext::default())
            .await;
        assert!(!result.success);
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "tool_fault");
        assert!(!error.message.contains("boom"));
    }

    #[test]
    fn describe_is_sorted() {
        let defs = registry().describe();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "panicky", "slow"]);
    }

    #[test]
    fn non_object_arguments_rejected() {
        let err = validate_args(&serde_json::json!([1, 2]), &serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }
}
