//! Built-in tools shipped with the server.
//!
//! - `get_time` — current time; opts out of caching
//! - `calculator` — pure arithmetic; cacheable
//! - `web_search` — HTTP JSON search against a configured endpoint

use std::time::Duration;

use chrono::{FixedOffset, Utc};
use serde_json::Value;

use vx_domain::config::WebSearchConfig;
use vx_domain::error::{Error, Result};

use crate::registry::{Tool, ToolContext, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// get_time
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reports the current time, optionally shifted to a UTC offset.
pub struct GetTimeTool;

#[async_trait::async_trait]
impl Tool for GetTimeTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "get_time".into(),
            description: "Get the current date and time. Optionally pass a UTC offset like '+08:00'.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "offset": { "type": "string", "description": "UTC offset, e.g. '+08:00' or '-05:30'" }
                }
            }),
            timeout: Duration::from_secs(2),
            // Time moves on; a memoized answer would be wrong within the TTL.
            cacheable: false,
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let now = Utc::now();
        let (iso, offset_label) = match args.get("offset").and_then(|o| o.as_str()) {
            Some(raw) => {
                let offset = parse_offset(raw)?;
                (now.with_timezone(&offset).to_rfc3339(), raw.to_string())
            }
            None => (now.to_rfc3339(), "UTC".to_string()),
        };
        Ok(serde_json::json!({
            "iso": iso,
            "unix_ms": now.timestamp_millis(),
            "offset": offset_label,
        }))
    }
}

fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return offset_from_secs(0);
    }
    let (sign, rest) = match raw.bytes().next() {
        Some(b'+') => (1i32, &raw[1..]),
        Some(b'-') => (-1i32, &raw[1..]),
        _ => {
            return Err(Error::InputInvalid(format!(
                "offset '{raw}' must start with '+' or '-'"
            )))
        }
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| Error::InputInvalid(format!("offset '{raw}' must look like '+HH:MM'")))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| Error::InputInvalid(format!("bad hours in offset '{raw}'")))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| Error::InputInvalid(format!("bad minutes in offset '{raw}'")))?;
    if hours > 14 || minutes > 59 {
        return Err(Error::InputInvalid(format!("offset '{raw}' out of range")));
    }
    offset_from_secs(sign * (hours * 3600 + minutes * 60))
}

fn offset_from_secs(secs: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(secs)
        .ok_or_else(|| Error::InputInvalid(format!("offset of {secs}s is out of range")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// calculator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluates arithmetic expressions (`+ - * / ( )`, unary minus).
pub struct CalculatorTool;

#[async_trait::async_trait]
impl Tool for CalculatorTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "calculator".into(),
            description: "Evaluate an arithmetic expression, e.g. '(2 + 3) * 4 / 1.5'.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "expression": { "type": "string", "description": "Arithmetic expression" }
                },
                "required": ["expression"]
            }),
            timeout: Duration::from_secs(2),
            cacheable: true,
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let expr = args
            .get("expression")
            .and_then(|e| e.as_str())
            .unwrap_or("");
        let value = eval(expr)?;
        Ok(serde_json::json!({ "expression": expr, "value": value }))
    }
}

/// Recursive-descent evaluator over a token slice.
fn eval(expr: &str) -> Result<f64> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;
    let value = parse_sum(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(Error::InputInvalid(format!(
            "unexpected trailing input in '{expr}'"
        )));
    }
    if !value.is_finite() {
        return Err(Error::InputInvalid(format!("'{expr}' does not evaluate to a finite number")));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                tokens.push(Token::Plus);
                chars.next();
            }
            '-' => {
                tokens.push(Token::Minus);
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '/' => {
                tokens.push(Token::Slash);
                chars.next();
            }
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = expr[start..end]
                    .parse()
                    .map_err(|_| Error::InputInvalid(format!("bad number near '{}'", &expr[start..end])))?;
                tokens.push(Token::Number(number));
            }
            other => {
                return Err(Error::InputInvalid(format!(
                    "unexpected character '{other}' in expression"
                )))
            }
        }
    }
    if tokens.is_empty() {
        return Err(Error::InputInvalid("empty expression".into()));
    }
    Ok(tokens)
}

fn parse_sum(tokens: &[Token], pos: &mut usize) -> Result<f64> {
    let mut value = parse_product(tokens, pos)?;
    while let Some(op) = tokens.get(*pos) {
        match op {
            Token::Plus => {
                *pos += 1;
                value += parse_product(tokens, pos)?;
            }
            Token::Minus => {
                *pos += 1;
                value -= parse_product(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_product(tokens: &[Token], pos: &mut usize) -> Result<f64> {
    let mut value = parse_atom(tokens, pos)?;
    while let Some(op) = tokens.get(*pos) {
        match op {
            Token::Star => {
                *pos += 1;
                value *= parse_atom(tokens, pos)?;
            }
            Token::Slash => {
                *pos += 1;
                let divisor = parse_atom(tokens, pos)?;
                if divisor == 0.0 {
                    return Err(Error::InputInvalid("division by zero".into()));
                }
                value /= divisor;
            }
            _ => break,
        }
    }
    Ok(value)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<f64> {
    match tokens.get(*pos) {
        Some(Token::Number(n)) => {
            *pos += 1;
            Ok(*n)
        }
        Some(Token::Minus) => {
            *pos += 1;
            Ok(-parse_atom(tokens, pos)?)
        }
        Some(Token::Open) => {
            *pos += 1;
            let value = parse_sum(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::Close) => {
                    *pos += 1;
                    Ok(value)
                }
                _ => Err(Error::InputInvalid("missing closing parenthesis".into())),
            }
        }
        _ => Err(Error::InputInvalid("expected a number".into())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// web_search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Queries a configured JSON search endpoint.
pub struct WebSearchTool {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn from_config(cfg: &WebSearchConfig) -> Result<Self> {
        let api_key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::unavailable("web_search", e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "web_search".into(),
            description: "Search the web. Returns a list of results with title, url, and snippet.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "limit": { "type": "integer", "description": "Max results (default 5)" }
                },
                "required": ["query"]
            }),
            timeout: Duration::from_secs(10),
            cacheable: true,
        }
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let query = args.get("query").and_then(|q| q.as_str()).unwrap_or("");
        let limit = args.get("limit").and_then(|l| l.as_u64()).unwrap_or(5);

        let mut request = self
            .client
            .get(&self.base_url)
            .query(&[("q", query.to_string()), ("limit", limit.to_string())]);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::unavailable("web_search", e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::unavailable(
                "web_search",
                format!("search endpoint returned {status}"),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::unavailable("web_search", e.to_string()))?;
        // Accept either a bare array or an object with a results field.
        let results = match body {
            Value::Array(items) => Value::Array(items),
            Value::Object(mut map) => map.remove("results").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        Ok(serde_json::json!({ "query": query, "results": results }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_time_reports_utc_by_default() {
        let out = GetTimeTool
            .call(serde_json::json!({}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out["offset"], "UTC");
        assert!(out["unix_ms"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn get_time_applies_offset() {
        let out = GetTimeTool
            .call(serde_json::json!({"offset": "+08:00"}), &ToolContext::default())
            .await
            .unwrap();
        assert!(out["iso"].as_str().unwrap().ends_with("+08:00"));
    }

    #[tokio::test]
    async fn get_time_rejects_garbage_offset() {
        let err = GetTimeTool
            .call(serde_json::json!({"offset": "tomorrow"}), &ToolContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input_invalid");
    }

    #[test]
    fn get_time_is_not_cacheable() {
        assert!(!GetTimeTool.descriptor().cacheable);
    }

    #[test]
    fn offset_parsing_bounds() {
        assert!(parse_offset("+14:00").is_ok());
        assert!(parse_offset("-05:30").is_ok());
        assert!(parse_offset("+15:00").is_err());
        assert!(parse_offset("+02:75").is_err());
        assert!(parse_offset("utc").is_ok());
    }

    #[test]
    fn calculator_precedence_and_parens() {
        assert_eq!(eval("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval("10 / 4").unwrap(), 2.5);
        assert_eq!(eval("-3 + 5").unwrap(), 2.0);
        assert_eq!(eval("2 * -3").unwrap(), -6.0);
    }

    #[test]
    fn calculator_rejects_bad_input() {
        assert!(eval("").is_err());
        assert!(eval("2 +").is_err());
        assert!(eval("(1 + 2").is_err());
        assert!(eval("1 / 0").is_err());
        assert!(eval("two plus two").is_err());
        assert!(eval("1 2").is_err());
    }

    #[tokio::test]
    async fn calculator_tool_wraps_eval() {
        let out = CalculatorTool
            .call(
                serde_json::json!({"expression": "1.5 * 4"}),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["value"], 6.0);
    }

    #[test]
    fn web_search_descriptor_is_cacheable() {
        let tool = WebSearchTool::from_config(&WebSearchConfig {
            base_url: "https://search.example.com/api".into(),
            api_key_env: None,
        })
        .unwrap();
        let d = tool.descriptor();
        assert!(d.cacheable);
        assert_eq!(d.name, "web_search");
    }
}
