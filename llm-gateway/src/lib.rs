//! Uniform asynchronous chat gateway.
//!
//! One interface for every backend: `invoke(messages, tools?) ->
//! assistant message`. Dispatch is enum-based (no `async-trait`, no heap
//! trait objects); provider wire-format quirks never leave the backend
//! modules — core stages only ever see canonical [`ChatMessage`] values
//! with normalized `{id, name, args}` tool calls.

pub mod config;
pub mod error_handler;
pub mod message;
pub mod services;

use config::{LlmConfig, LlmProvider};
use error_handler::GatewayError;
use message::{ChatMessage, ToolSpec};
use services::{open_ai_service::OpenAiService, scripted::ScriptedService};

/// Thin enum client for dispatch.
#[derive(Debug)]
pub enum LlmGateway {
    OpenAi(OpenAiService),
    Scripted(ScriptedService),
}

impl LlmGateway {
    /// Construct a gateway based on the given provider config.
    ///
    /// `Scripted` constructed this way starts with an empty reply queue;
    /// use [`LlmGateway::scripted`] to preload replies.
    pub fn from_config(cfg: LlmConfig) -> Result<Self, GatewayError> {
        match cfg.provider {
            LlmProvider::OpenAi => Ok(Self::OpenAi(OpenAiService::new(cfg)?)),
            LlmProvider::Scripted => Ok(Self::Scripted(ScriptedService::default())),
        }
    }

    /// Gateway that plays the given canned replies in order.
    pub fn scripted(replies: Vec<ChatMessage>) -> Self {
        Self::Scripted(ScriptedService::new(replies))
    }

    /// One chat completion. Pass `tools` to bind the toolbox for this
    /// call; pass `None` for a tool-less call (e.g. forced finalize).
    pub async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatMessage, GatewayError> {
        match self {
            Self::OpenAi(c) => c.invoke(messages, tools).await,
            Self::Scripted(c) => c.invoke(messages, tools).await,
        }
    }

    /// Binds a toolbox once for repeated calls.
    pub fn with_tools(&self, tools: Vec<ToolSpec>) -> BoundGateway<'_> {
        BoundGateway {
            gateway: self,
            tools,
        }
    }
}

/// A gateway with a fixed tool binding.
pub struct BoundGateway<'a> {
    gateway: &'a LlmGateway,
    tools: Vec<ToolSpec>,
}

impl BoundGateway<'_> {
    pub async fn invoke(&self, messages: &[ChatMessage]) -> Result<ChatMessage, GatewayError> {
        self.gateway.invoke(messages, Some(&self.tools)).await
    }
}

pub use error_handler::{HttpError, Result as GatewayResult};
pub use message::{Role, ToolCall};
