//! Lifecycle event model.
//!
//! Each hook invocation carries one JSON object on stdin. The accessors
//! here are deliberately forgiving: hosts differ in field spelling
//! (`file_path` vs `path`), and a missing field is never an error at this
//! layer.

use crate::error::{HookError, Result};
use std::path::PathBuf;

/// The lifecycle points the host emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEventKind {
    /// About to invoke a tool.
    PreTool,
    /// A tool finished.
    PostTool,
    /// A delegated subagent task finished.
    PostToolTask,
    /// New user message.
    UserPrompt,
    /// Context-window compaction imminent.
    PreCompact,
    /// Session ending.
    Stop,
}

impl HookEventKind {
    /// Parses the event name used on the command line.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecognized names.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "pre_tool" => Ok(Self::PreTool),
            "post_tool" => Ok(Self::PostTool),
            "post_tool_task" => Ok(Self::PostToolTask),
            "user_prompt" => Ok(Self::UserPrompt),
            "pre_compact" => Ok(Self::PreCompact),
            "stop" => Ok(Self::Stop),
            other => Err(HookError::UnknownEvent {
                name: other.to_string(),
            }
            .into()),
        }
    }

    /// Canonical event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreTool => "pre_tool",
            Self::PostTool => "post_tool",
            Self::PostToolTask => "post_tool_task",
            Self::UserPrompt => "user_prompt",
            Self::PreCompact => "pre_compact",
            Self::Stop => "stop",
        }
    }
}

/// One parsed lifecycle event.
#[derive(Debug, Clone)]
pub struct HookEvent {
    /// Which lifecycle point fired.
    pub kind: HookEventKind,
    /// The raw event object.
    pub payload: serde_json::Value,
}

impl HookEvent {
    /// Wraps a payload, requiring a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not an object.
    pub fn new(kind: HookEventKind, payload: serde_json::Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(HookError::MalformedPayload(format!(
                "expected a JSON object, got {}",
                type_name(&payload)
            ))
            .into());
        }
        Ok(Self { kind, payload })
    }

    /// Tool name for tool events.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.payload.get("tool_name").and_then(|v| v.as_str())
    }

    /// Tool input object (Null when absent).
    #[must_use]
    pub fn tool_input(&self) -> &serde_json::Value {
        self.payload
            .get("tool_input")
            .unwrap_or(&serde_json::Value::Null)
    }

    /// Target file path from the tool input.
    #[must_use]
    pub fn file_path(&self) -> Option<&str> {
        let input = self.tool_input();
        input
            .get("file_path")
            .or_else(|| input.get("path"))
            .and_then(|v| v.as_str())
    }

    /// Shell command from the tool input.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.tool_input().get("command").and_then(|v| v.as_str())
    }

    /// Project directory carried in the event.
    #[must_use]
    pub fn project_dir(&self) -> Option<PathBuf> {
        self.payload
            .get("project_dir")
            .or_else(|| self.payload.get("cwd"))
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }

    /// Transcript path (stop events).
    #[must_use]
    pub fn transcript_path(&self) -> Option<PathBuf> {
        self.payload
            .get("transcript_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
    }

    /// Role of the agent issuing the tool call, when the host reports it.
    #[must_use]
    pub fn agent_role(&self) -> Option<&str> {
        self.payload
            .get("agent_role")
            .or_else(|| self.payload.get("agent_type"))
            .and_then(|v| v.as_str())
    }

    /// Whether the user explicitly requested this operation (allow-list
    /// flag checked by the MD-spam rule).
    #[must_use]
    pub fn user_requested(&self) -> bool {
        self.tool_input()
            .get("user_requested")
            .or_else(|| {
                self.payload
                    .get("metadata")
                    .and_then(|m| m.get("user_requested"))
            })
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    /// User prompt text (user_prompt events).
    #[must_use]
    pub fn prompt(&self) -> Option<&str> {
        self.payload.get("prompt").and_then(|v| v.as_str())
    }

    /// Compaction summary text (pre_compact events).
    #[must_use]
    pub fn summary(&self) -> Option<&str> {
        self.payload.get("summary").and_then(|v| v.as_str())
    }

    /// Every string in the tool response, concatenated. Used to find
    /// fenced DIGESTs in subagent task results.
    #[must_use]
    pub fn response_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(response) = self.payload.get("tool_response") {
            collect_strings(response, &mut parts);
        }
        parts.join("\n")
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("pre_tool", HookEventKind::PreTool)]
    #[test_case("post_tool", HookEventKind::PostTool)]
    #[test_case("post_tool_task", HookEventKind::PostToolTask)]
    #[test_case("user_prompt", HookEventKind::UserPrompt)]
    #[test_case("pre_compact", HookEventKind::PreCompact)]
    #[test_case("stop", HookEventKind::Stop)]
    fn test_kind_parse_roundtrip(name: &str, kind: HookEventKind) {
        assert_eq!(HookEventKind::parse(name).unwrap(), kind);
        assert_eq!(kind.as_str(), name);
    }

    #[test]
    fn test_unknown_kind() {
        let err = HookEventKind::parse("session_start").unwrap_err();
        assert!(err.to_string().contains("unknown hook event"));
    }

    #[test]
    fn test_payload_must_be_object() {
        let err = HookEvent::new(HookEventKind::PreTool, serde_json::json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("expected a JSON object"));
    }

    #[test]
    fn test_accessors() {
        let event = HookEvent::new(
            HookEventKind::PreTool,
            serde_json::json!({
                "tool_name": "Read",
                "tool_input": {"file_path": "src/x.ts", "user_requested": true},
                "project_dir": "/work/acme",
                "agent_role": "orchestrator"
            }),
        )
        .unwrap();

        assert_eq!(event.tool_name(), Some("Read"));
        assert_eq!(event.file_path(), Some("src/x.ts"));
        assert_eq!(event.project_dir(), Some(PathBuf::from("/work/acme")));
        assert_eq!(event.agent_role(), Some("orchestrator"));
        assert!(event.user_requested());
        assert!(event.command().is_none());
    }

    #[test]
    fn test_path_spelling_variants() {
        let event = HookEvent::new(
            HookEventKind::PreTool,
            serde_json::json!({"tool_input": {"path": "a.md"}}),
        )
        .unwrap();
        assert_eq!(event.file_path(), Some("a.md"));
    }

    #[test]
    fn test_response_text_collects_nested_strings() {
        let event = HookEvent::new(
            HookEventKind::PostToolTask,
            serde_json::json!({
                "tool_response": {
                    "content": [{"type": "text", "text": "part one"}, {"type": "text", "text": "part two"}]
                }
            }),
        )
        .unwrap();
        let text = event.response_text();
        assert!(text.contains("part one"));
        assert!(text.contains("part two"));
    }

    #[test]
    fn test_user_requested_defaults_false() {
        let event =
            HookEvent::new(HookEventKind::PreTool, serde_json::json!({"tool_name": "Write"}))
                .unwrap();
        assert!(!event.user_requested());
    }
}
