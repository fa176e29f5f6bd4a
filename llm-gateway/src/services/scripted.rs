//! Deterministic scripted backend.
//!
//! Plays a fixed queue of canned assistant messages, one per `invoke`.
//! Used by unit/integration tests and by offline dry-runs where no
//! provider is reachable. Requests are recorded so tests can assert on
//! the exact message histories the pipeline submitted.

use std::sync::Mutex;

use crate::error_handler::GatewayError;
use crate::message::{ChatMessage, ToolSpec};

/// One recorded request: the submitted history plus whether tools were bound.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tools_bound: bool,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: Vec<ChatMessage>,
    cursor: usize,
    requests: Vec<RecordedRequest>,
}

/// Queue-backed gateway backend with interior mutability.
#[derive(Debug, Default)]
pub struct ScriptedService {
    state: Mutex<ScriptState>,
}

impl ScriptedService {
    /// Creates a backend that answers with `replies` in order.
    pub fn new(replies: Vec<ChatMessage>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                replies,
                cursor: 0,
                requests: Vec::new(),
            }),
        }
    }

    /// Pops the next scripted reply; errors once the queue is exhausted.
    pub async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ChatMessage, GatewayError> {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.requests.push(RecordedRequest {
            messages: messages.to_vec(),
            tools_bound: tools.is_some(),
        });
        let idx = st.cursor;
        match st.replies.get(idx).cloned() {
            Some(reply) => {
                st.cursor += 1;
                Ok(reply)
            }
            None => Err(GatewayError::ScriptExhausted(idx)),
        }
    }

    /// Requests seen so far, in submission order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .requests
            .clone()
    }

    /// Number of replies consumed so far.
    pub fn consumed(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).cursor
    }
}
