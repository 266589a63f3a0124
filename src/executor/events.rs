//! Structured events from the agent runtime's `stream-json` output.
//!
//! Parsing is permissive: unknown fields are ignored and both the flat
//! event shape (`tool_name`, string `message`) and the nested Claude shape
//! (`message.content[]` blocks, `usage`, `total_cost_usd`) are understood.
//! Lines that are not JSON objects are skipped by the caller.

use std::time::Duration;

use chrono::Local;
use serde::Deserialize;
use serde_json::Value;

use super::live_status::PhaseProgress;
use crate::util::{collapse_whitespace, truncate_str};

pub const SUMMARY_MAX: usize = 72;

/// One line of the event stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: String,
    /// Either plain text or a nested message object with content blocks.
    #[serde(default)]
    pub message: Option<Value>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_use_id: String,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub duration_api_ms: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl StreamEvent {
    pub fn is_init(&self) -> bool {
        self.kind == "init" || (self.kind == "system" && self.subtype == "init")
    }

    /// Tool invocations carried by this event, as `(name, input)`.
    pub fn tool_uses(&self) -> Vec<(String, Value)> {
        if !self.tool_name.is_empty() {
            return vec![(
                self.tool_name.clone(),
                self.tool_input.clone().unwrap_or(Value::Null),
            )];
        }
        self.content_blocks()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter_map(|b| {
                let name = b.get("name")?.as_str()?.to_string();
                Some((name, b.get("input").cloned().unwrap_or(Value::Null)))
            })
            .collect()
    }

    /// Human text carried by this event.
    pub fn text(&self) -> Option<String> {
        match &self.message {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.clone()),
            Some(Value::Object(_)) => {
                let joined: Vec<&str> = self
                    .content_blocks()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if !joined.is_empty() {
                    return Some(joined.join(" "));
                }
            }
            _ => {}
        }
        self.result.clone().filter(|r| !r.trim().is_empty())
    }

    pub fn cost(&self) -> Option<f64> {
        self.total_cost_usd.or(self.cost_usd)
    }

    /// input + output tokens from top-level or message-level usage.
    pub fn tokens(&self) -> Option<u64> {
        let usage = self.usage.as_ref().or_else(|| {
            self.message
                .as_ref()
                .and_then(|m| m.get("usage"))
        })?;
        let get = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0);
        let total = get("input_tokens") + get("output_tokens");
        (total > 0).then_some(total)
    }

    fn content_blocks(&self) -> impl Iterator<Item = &Value> {
        self.message
            .as_ref()
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
    }
}

/// Parse one line. Blank and non-JSON lines yield `None`.
pub fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Collapse whitespace and cap at 72 characters.
pub fn summarize_message(message: &str) -> String {
    truncate_str(&collapse_whitespace(message), SUMMARY_MAX)
}

/// Short description of a tool call, e.g. `Read src/main.rs`.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str);
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{name} {}", shorten_path(path)),
            None => name.to_string(),
        },
        "Bash" => match field("command") {
            Some(cmd) => format!("Bash {}", truncate_str(&collapse_whitespace(cmd), 40)),
            None => name.to_string(),
        },
        "Glob" | "Grep" => match field("pattern") {
            Some(p) => format!("{name} {}", truncate_str(p, 30)),
            None => name.to_string(),
        },
        "Task" => match field("description") {
            Some(d) => format!("Task {d}"),
            None => name.to_string(),
        },
        _ => name.to_string(),
    }
}

/// Last two components of a path.
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Fold one event into a phase's progress.
pub fn apply_event(progress: &mut PhaseProgress, event: &StreamEvent) {
    if event.is_init() {
        progress.session_id = event.session_id.clone();
        progress.model = event.model.clone();
        progress.current_action = "initialized".to_string();
    } else if event.kind == "assistant" {
        let tools = event.tool_uses();
        if let Some((name, input)) = tools.last() {
            progress.tool_count += tools.len() as u32;
            progress.last_tool = name.clone();
            progress.current_action = format!("tool: {}", describe_tool_use(name, input));
        } else if let Some(text) = event.text() {
            progress.current_action = summarize_message(&text);
        }
        if let Some(tokens) = event.tokens() {
            progress.tokens = tokens;
        }
    } else if event.kind == "result" {
        if let Some(cost) = event.cost() {
            progress.cost_usd = cost;
        }
        if let Some(turns) = event.num_turns {
            progress.turn_count = turns;
        }
        if let Some(tokens) = event.tokens() {
            progress.tokens = tokens;
        }
        if let Some(ms) = event.duration_ms.filter(|ms| *ms > 0.0) {
            progress.elapsed = Duration::from_millis(ms as u64);
        }
        if event.is_error {
            progress.current_action = "result error".to_string();
            progress.last_error = event
                .text()
                .map(|t| summarize_message(&t))
                .unwrap_or_else(|| "result event reported error".to_string());
        } else {
            progress.current_action = "result received".to_string();
        }
    }
    progress.last_update = Some(Local::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_flat_init() {
        let ev = parse_stream_line(r#"{"type":"init","session_id":"s1","model":"m1"}"#).unwrap();
        let mut p = PhaseProgress::default();
        apply_event(&mut p, &ev);
        assert_eq!(p.session_id, "s1");
        assert_eq!(p.model, "m1");
        assert_eq!(p.current_action, "initialized");
        assert!(p.last_update.is_some());
    }

    #[test]
    fn test_parse_system_init() {
        let ev = parse_stream_line(
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude","tools":["Read"]}"#,
        )
        .unwrap();
        assert!(ev.is_init());
        assert_eq!(ev.tools, vec!["Read".to_string()]);
    }

    #[test]
    fn test_nested_tool_use_counts_and_describes() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/Users/foo/project/src/main.rs"},"id":"1"}],"usage":{"input_tokens":100,"output_tokens":20}},"session_id":"abc"}"#;
        let ev = parse_stream_line(line).unwrap();
        let mut p = PhaseProgress::default();
        apply_event(&mut p, &ev);
        assert_eq!(p.tool_count, 1);
        assert_eq!(p.last_tool, "Read");
        assert_eq!(p.current_action, "tool: Read src/main.rs");
        assert_eq!(p.tokens, 120);
    }

    #[test]
    fn test_flat_tool_and_text() {
        let mut p = PhaseProgress::default();
        apply_event(
            &mut p,
            &parse_stream_line(r#"{"type":"assistant","tool_name":"Bash","tool_input":{"command":"cargo   test"}}"#).unwrap(),
        );
        assert_eq!(p.current_action, "tool: Bash cargo test");
        apply_event(
            &mut p,
            &parse_stream_line(r#"{"type":"assistant","message":"  thinking\n about   it "}"#).unwrap(),
        );
        assert_eq!(p.current_action, "thinking about it");
        assert_eq!(p.tool_count, 1);
    }

    #[test]
    fn test_result_event_updates_totals() {
        let mut p = PhaseProgress::default();
        let ev = parse_stream_line(
            r#"{"type":"result","subtype":"success","total_cost_usd":0.125,"duration_ms":4500,"num_turns":7}"#,
        )
        .unwrap();
        apply_event(&mut p, &ev);
        assert_eq!(p.cost_usd, 0.125);
        assert_eq!(p.turn_count, 7);
        assert_eq!(p.elapsed, Duration::from_millis(4500));
        assert_eq!(p.current_action, "result received");
    }

    #[test]
    fn test_result_error_without_message() {
        let mut p = PhaseProgress::default();
        apply_event(
            &mut p,
            &parse_stream_line(r#"{"type":"result","is_error":true}"#).unwrap(),
        );
        assert_eq!(p.current_action, "result error");
        assert_eq!(p.last_error, "result event reported error");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line("not json").is_none());
        assert!(parse_stream_line("{\"type\":").is_none());
    }

    #[test]
    fn test_summarize_message_caps_length() {
        let long = "word ".repeat(40);
        let s = summarize_message(&long);
        assert_eq!(s.chars().count(), SUMMARY_MAX);
        assert!(s.ends_with("..."));
    }

    #[test]
    fn test_describe_unknown_tool() {
        assert_eq!(describe_tool_use("WebFetch", &json!({})), "WebFetch");
    }
}
