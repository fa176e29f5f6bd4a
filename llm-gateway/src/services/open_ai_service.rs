//! OpenAI-compatible chat-completions backend with tool binding.
//!
//! Endpoint derived from `LlmConfig::base_url`:
//! - POST {base_url}/v1/chat/completions — chat completion (non-streaming)
//!
//! The backend is the only place provider wire shapes are visible:
//! - canonical `tool_calls` arrays and legacy single `function_call`
//!   records are both normalized into [`ToolCall`] values;
//! - string-encoded argument payloads are parsed into JSON objects;
//! - tool calls arriving without an `id` get synthesized stable ids
//!   (`call-<n>`, numbered per response) so the follow-up tool message
//!   round-trips on the next request.
//!
//! Errors are normalized via the unified types in `error_handler`.

use std::time::{Duration, Instant};

use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::LlmConfig;
use crate::error_handler::{GatewayError, HttpError, make_snippet};
use crate::message::{ChatMessage, Role, ToolCall, ToolSpec};

/// Thin client for an OpenAI-compatible chat API.
///
/// Constructed from a complete [`LlmConfig`]. Internally keeps a
/// preconfigured `reqwest::Client` (timeout and default headers).
#[derive(Debug)]
pub struct OpenAiService {
    client: reqwest::Client,
    cfg: LlmConfig,
    url_chat: String,
}

impl OpenAiService {
    /// Creates a new [`OpenAiService`] from the given config.
    ///
    /// Validates the API key and endpoint scheme, then builds an HTTP
    /// client with default headers and a configurable timeout.
    ///
    /// # Errors
    /// - [`GatewayError::MissingApiKey`] if `cfg.api_key` is `None`
    /// - [`GatewayError::InvalidEndpoint`] if `cfg.base_url` is invalid
    /// - [`GatewayError::Transport`] if the HTTP client cannot be built
    pub fn new(cfg: LlmConfig) -> Result<Self, GatewayError> {
        let api_key = cfg.api_key.clone().ok_or(GatewayError::MissingApiKey)?;

        let endpoint = cfg.base_url.trim();
        if endpoint.is_empty()
            || !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(GatewayError::InvalidEndpoint(cfg.base_url.clone()));
        }

        let timeout = cfg
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(120));

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| GatewayError::Decode(format!("invalid API key header: {e}")))?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        let url_chat = format!("{}/v1/chat/completions", endpoint.trim_end_matches('/'));

        info!(
            model = %cfg.model,
            endpoint = %cfg.base_url,
            timeout_secs = cfg.timeout_secs.unwrap_or(120),
            "OpenAiService initialized"
        );

        Ok(Self {
            client,
            cfg,
            url_chat,
        })
    }

    /// Performs one non-streaming chat completion, optionally with tools
    /// bound, and returns the assistant message in canonical form.
    ///
    /// # Errors
    /// - [`GatewayError::HttpStatus`] for non-2xx responses
    /// - [`GatewayError::Transport`] for client/network failures
    /// - [`GatewayError::Decode`] if the JSON cannot be parsed
    /// - [`GatewayError::EmptyChoices`] if no choices are returned
    pub async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatMessage, GatewayError> {
        let started = Instant::now();
        let body = ChatCompletionRequest::build(&self.cfg, messages, tools);

        debug!(
            model = %self.cfg.model,
            messages = messages.len(),
            tools = tools.map(|t| t.len()).unwrap_or(0),
            "POST {}", self.url_chat
        );

        let resp = self.client.post(&self.url_chat).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let url = self.url_chat.clone();
            let text = resp.text().await.unwrap_or_default();
            let snippet = make_snippet(&text);

            error!(
                status,
                %url,
                %snippet,
                model = %self.cfg.model,
                latency_ms = started.elapsed().as_millis(),
                "chat completion returned non-success status"
            );

            return Err(GatewayError::HttpStatus(HttpError {
                status,
                url,
                snippet,
            }));
        }

        let out: ChatCompletionResponse = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                error!(
                    error = %e,
                    model = %self.cfg.model,
                    latency_ms = started.elapsed().as_millis(),
                    "failed to decode chat completion response"
                );
                return Err(GatewayError::Decode(format!(
                    "serde error: {e}; expected `choices[0].message`"
                )));
            }
        };

        let wire = out
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(GatewayError::EmptyChoices)?;

        let msg = normalize_assistant(wire);

        info!(
            model = %self.cfg.model,
            latency_ms = started.elapsed().as_millis(),
            tool_calls = msg.tool_calls.len(),
            content_len = msg.content.len(),
            "chat completion completed"
        );

        Ok(msg)
    }
}

/// Converts a wire assistant message into the canonical form, parsing
/// string-encoded arguments and synthesizing missing tool-call ids.
fn normalize_assistant(wire: WireMessageOut) -> ChatMessage {
    fn synth(next_id: &mut usize) -> String {
        let id = format!("call-{next_id}");
        *next_id += 1;
        id
    }

    let mut calls: Vec<ToolCall> = Vec::new();
    let mut next_id = 0usize;

    for tc in wire.tool_calls.unwrap_or_default() {
        let id = match tc.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => synth(&mut next_id),
        };
        calls.push(ToolCall {
            id,
            name: tc.function.name,
            args: parse_args(tc.function.arguments),
        });
    }

    // Legacy single-record shape: {"function_call": {"name", "arguments"}}.
    if calls.is_empty() {
        if let Some(fc) = wire.function_call {
            calls.push(ToolCall {
                id: synth(&mut next_id),
                name: fc.name,
                args: parse_args(fc.arguments),
            });
        }
    }

    ChatMessage {
        role: Role::Assistant,
        content: wire.content.unwrap_or_default(),
        tool_call_id: None,
        tool_calls: calls,
    }
}

/// Arguments arrive either as a JSON object or as a string-encoded one.
fn parse_args(raw: Option<serde_json::Value>) -> serde_json::Value {
    match raw {
        None => serde_json::json!({}),
        Some(serde_json::Value::String(s)) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        Some(v) => v,
    }
}

/* ===========================================================================
HTTP payloads
======================================================================== */

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolSpec<'a>>>,
}

impl<'a> ChatCompletionRequest<'a> {
    fn build(cfg: &'a LlmConfig, messages: &'a [ChatMessage], tools: Option<&'a [ToolSpec]>) -> Self {
        Self {
            model: &cfg.model,
            messages: messages.iter().map(WireMessage::from_canonical).collect(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            tools: tools.map(|ts| ts.iter().map(WireToolSpec::from_spec).collect()),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall<'a>>>,
}

impl<'a> WireMessage<'a> {
    /// Round-trips assistant tool-call intents so the next request
    /// validates on the provider side.
    fn from_canonical(m: &'a ChatMessage) -> Self {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let tool_calls = if m.tool_calls.is_empty() {
            None
        } else {
            Some(
                m.tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: &c.id,
                        kind: "function",
                        function: WireFunction {
                            name: &c.name,
                            arguments: c.args.to_string(),
                        },
                    })
                    .collect(),
            )
        };
        Self {
            role,
            content: &m.content,
            tool_call_id: m.tool_call_id.as_deref(),
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireToolCall<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    /// Providers expect string-encoded argument objects on requests.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireToolSpec<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireToolSpecFunction<'a>,
}

#[derive(Debug, Serialize)]
struct WireToolSpecFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

impl<'a> WireToolSpec<'a> {
    fn from_spec(s: &'a ToolSpec) -> Self {
        Self {
            kind: "function",
            function: WireToolSpecFunction {
                name: &s.name,
                description: &s.description,
                parameters: &s.parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessageOut,
}

#[derive(Debug, Deserialize)]
struct WireMessageOut {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallOut>>,
    /// Legacy single-record tool call emitted by some providers.
    function_call: Option<WireFunctionOut>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallOut {
    id: Option<String>,
    function: WireFunctionOut,
}

#[derive(Debug, Deserialize)]
struct WireFunctionOut {
    name: String,
    arguments: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_from_json(s: &str) -> WireMessageOut {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn normalizes_string_encoded_arguments() {
        let wire = wire_from_json(
            r#"{"content": null, "tool_calls": [
                {"id": "abc", "function": {"name": "run_grep", "arguments": "{\"pattern\": \"foo\"}"}}
            ]}"#,
        );
        let msg = normalize_assistant(wire);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "abc");
        assert_eq!(msg.tool_calls[0].args["pattern"], "foo");
        assert_eq!(msg.content, "");
    }

    #[test]
    fn synthesizes_missing_tool_call_ids() {
        let wire = wire_from_json(
            r#"{"content": "", "tool_calls": [
                {"function": {"name": "a", "arguments": {}}},
                {"id": "  ", "function": {"name": "b", "arguments": {}}}
            ]}"#,
        );
        let msg = normalize_assistant(wire);
        assert_eq!(msg.tool_calls[0].id, "call-0");
        assert_eq!(msg.tool_calls[1].id, "call-1");
    }

    #[test]
    fn normalizes_legacy_function_call_record() {
        let wire = wire_from_json(
            r#"{"content": "thinking", "function_call": {"name": "read_file_snippet", "arguments": "{\"path\": \"src/a.rs\"}"}}"#,
        );
        let msg = normalize_assistant(wire);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "read_file_snippet");
        assert_eq!(msg.tool_calls[0].args["path"], "src/a.rs");
        assert_eq!(msg.content, "thinking");
    }

    #[test]
    fn request_round_trips_assistant_tool_calls() {
        let cfg = LlmConfig::default();
        let history = vec![
            ChatMessage::user("go"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "call-0".into(),
                    name: "run_grep".into(),
                    args: serde_json::json!({"pattern": "x"}),
                }],
            ),
            ChatMessage::tool("call-0", "{\"total\": 1}"),
        ];
        let req = ChatCompletionRequest::build(&cfg, &history, None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][1]["tool_calls"][0]["id"], "call-0");
        assert_eq!(v["messages"][1]["tool_calls"][0]["type"], "function");
        // Arguments must be string-encoded on the wire.
        assert!(v["messages"][1]["tool_calls"][0]["function"]["arguments"].is_string());
        assert_eq!(v["messages"][2]["tool_call_id"], "call-0");
    }
}
