//! Canonical chat message model shared by every gateway backend.
//!
//! Providers disagree on how tool calls are serialized (canonical
//! `tool_calls` arrays vs. legacy `function` records, string-encoded vs.
//! structured arguments). This module fixes one internal representation:
//! an assistant message carries `Vec<ToolCall>` with `{id, name, args}`,
//! a tool message carries the `tool_call_id` it answers. Backends adapt
//! to/from their wire shapes at the HTTP boundary and nowhere else.

use serde::{Deserialize, Serialize};

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One normalized tool-call intent emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Stable id linking the eventual tool message back to this call.
    /// Synthesized by the gateway when the provider omits it.
    pub id: String,
    /// Tool name as declared in the bound [`ToolSpec`].
    pub name: String,
    /// Parsed argument object (`{}` when the provider sent none).
    pub args: serde_json::Value,
}

/// Declaration of a callable tool, in JSON-Schema form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument object.
    pub parameters: serde_json::Value,
}

/// A single chat turn in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Set on `Role::Tool` messages: the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on `Role::Assistant` messages that request tool execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that requests tool execution.
    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: calls,
        }
    }

    /// Tool result turn answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// True when the assistant asked for at least one tool execution.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_links_back_to_call() {
        let m = ChatMessage::tool("call-1", "{\"matches\": []}");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
        assert!(!m.has_tool_calls());
    }

    #[test]
    fn assistant_with_calls_reports_them() {
        let m = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: "call-0".into(),
                name: "run_grep".into(),
                args: serde_json::json!({"pattern": "unwrap"}),
            }],
        );
        assert!(m.has_tool_calls());
    }
}
