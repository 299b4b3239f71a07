//! Completion providers: one uniform contract over two transports.
//!
//! The engine talks to exactly one provider per turn: the hosted remote
//! endpoint or the local inference server. Both implement
//! [`CompletionProvider`]; selection is a pure function of the session
//! mode, so the pipeline never branches on transport details.

pub mod local;
pub mod remote;

pub use local::LocalClient;
pub use remote::RemoteClient;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::HISTORY_WINDOW;
use crate::models::MessageRole;

/// Which backend a provider speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Remote,
    Local,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// One plain-text turn of conversation context. Images never ride the
/// history: only the current turn's images are forwarded, separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            text: text.into(),
        }
    }
}

/// Transient description of the active provider/model pair.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub model: String,
    pub supports_vision: bool,
}

/// Errors from provider operations.
///
/// Messages are complete sentences: they are surfaced to the user
/// verbatim when a turn fails.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("No API credential is configured — set the remote API key to use online mode")]
    MissingCredential,

    #[error("Provider returned an error (HTTP {status}): {message}")]
    Transport { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Malformed provider response: {0}")]
    InvalidResponseFormat(String),

    #[error("No local models are installed — pull a model to use offline mode")]
    NoModelsAvailable,

    #[error("Invalid model name: '{0}'")]
    InvalidModelName(String),
}

/// The completion provider contract.
///
/// `complete` receives the plain-text conversation history (oldest first)
/// and the current turn's image payloads, and resolves to the assistant's
/// reply text. Implementations cap context to the trailing
/// [`HISTORY_WINDOW`] turns.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    async fn complete(
        &self,
        history: &[ChatTurn],
        images: &[String],
    ) -> Result<String, ProviderError>;
}

/// Trailing window of conversation context: fixed policy, bounds request
/// size and latency for both transports.
pub fn trailing_window(history: &[ChatTurn]) -> &[ChatTurn] {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    &history[start..]
}

// ═══════════════════════════════════════════════════════════
// MockProvider: scripted test double
// ═══════════════════════════════════════════════════════════

/// Mock completion provider for testing: returns a configured outcome
/// and records what it was called with. Vision support follows the real
/// capability registry, so a mock behind `gpt-4o` accepts images and one
/// behind `mock-model` does not.
pub struct MockProvider {
    kind: ProviderKind,
    model: String,
    outcome: std::sync::Mutex<Result<String, ProviderError>>,
    calls: std::sync::Mutex<Vec<(Vec<ChatTurn>, Vec<String>)>>,
    gate: Option<std::sync::Arc<tokio::sync::Notify>>,
}

impl MockProvider {
    pub fn replying(reply: &str) -> Self {
        Self {
            kind: ProviderKind::Remote,
            model: "mock-model".to_string(),
            outcome: std::sync::Mutex::new(Ok(reply.to_string())),
            calls: std::sync::Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        let mock = Self::replying("");
        *mock.outcome.lock().unwrap() = Err(error);
        mock
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Block each `complete` call until the returned handle is notified.
    /// Used to hold a send in flight deterministically.
    pub fn gated(mut self) -> (Self, std::sync::Arc<tokio::sync::Notify>) {
        let gate = std::sync::Arc::new(tokio::sync::Notify::new());
        self.gate = Some(std::sync::Arc::clone(&gate));
        (self, gate)
    }

    /// Every `(history, images)` pair this mock has been called with.
    pub fn calls(&self) -> Vec<(Vec<ChatTurn>, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: self.kind,
            model: self.model.clone(),
            supports_vision: crate::capability::supports_vision(self.kind, &self.model),
        }
    }

    async fn complete(
        &self,
        history: &[ChatTurn],
        images: &[String],
    ) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((history.to_vec(), images.to_vec()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.outcome.lock().unwrap().clone()
    }
}
