//! Local provider client: Ollama-style inference server on loopback.
//!
//! The preferred model is re-validated against the installed set on every
//! call (queried fresh, never cached): a missing preferred model is
//! silently substituted with the first installed one, and the call only
//! fails when no model exists at all. Images are attached only when the
//! resolved model is vision-capable; otherwise the call degrades to
//! text-only rather than erroring.

use serde::{Deserialize, Serialize};

use super::{
    trailing_window, ChatTurn, CompletionProvider, ProviderDescriptor, ProviderError, ProviderKind,
};
use crate::capability;
use crate::config::REQUEST_TIMEOUT_SECS;
use crate::monitor::SelectedModel;

pub struct LocalClient {
    client: reqwest::Client,
    base_url: String,
    selected: SelectedModel,
}

impl LocalClient {
    /// Create a client against a loopback inference server.
    ///
    /// Conversation content never leaves the machine through this client,
    /// so non-loopback endpoints are rejected outright.
    pub fn new(base_url: &str, selected: SelectedModel) -> Result<Self, ProviderError> {
        validate_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            selected,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve the model for this call: the preferred model when installed,
    /// else the first installed model. Zero installed models is the only
    /// failure.
    fn resolve_model(preferred: &str, installed: &[String]) -> Result<String, ProviderError> {
        let Some(first) = installed.first() else {
            return Err(ProviderError::NoModelsAvailable);
        };
        if installed.iter().any(|m| m.starts_with(preferred)) {
            Ok(preferred.to_string())
        } else {
            tracing::info!(
                preferred = %preferred,
                substitute = %first,
                "preferred model not installed, substituting"
            );
            Ok(first.clone())
        }
    }
}

/// Request body for the local `/api/chat` endpoint.
#[derive(Serialize)]
struct LocalChatRequest {
    model: String,
    messages: Vec<LocalChatMessage>,
    stream: bool,
}

/// A single message in a local chat request.
#[derive(Serialize)]
struct LocalChatMessage {
    role: &'static str,
    content: String,
    /// Base64-encoded images (final user message only, vision models only).
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

/// Response body from the local `/api/chat` endpoint.
#[derive(Deserialize)]
struct LocalChatResponse {
    message: Option<LocalResponseMessage>,
}

#[derive(Deserialize)]
struct LocalResponseMessage {
    content: Option<String>,
}

/// Response body from the local `/api/tags` endpoint.
#[derive(Deserialize)]
struct LocalTagsResponse {
    models: Vec<LocalTagModel>,
}

#[derive(Deserialize)]
struct LocalTagModel {
    name: String,
}

/// Fetch the installed model list: shared by the client (per-call
/// re-validation) and the availability monitor (periodic probe).
pub(crate) async fn fetch_installed_models(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<Vec<String>, ProviderError> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(REQUEST_TIMEOUT_SECS)
        } else {
            ProviderError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Transport {
            status: status.as_u16(),
            message: body,
        });
    }

    let parsed: LocalTagsResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponseFormat(e.to_string()))?;

    Ok(parsed.models.into_iter().map(|m| m.name).collect())
}

#[async_trait::async_trait]
impl CompletionProvider for LocalClient {
    fn descriptor(&self) -> ProviderDescriptor {
        let model = self.selected.get();
        ProviderDescriptor {
            supports_vision: capability::supports_vision(ProviderKind::Local, &model),
            kind: ProviderKind::Local,
            model,
        }
    }

    async fn complete(
        &self,
        history: &[ChatTurn],
        images: &[String],
    ) -> Result<String, ProviderError> {
        let preferred = self.selected.get();
        validate_model_name(&preferred)?;

        let installed = fetch_installed_models(&self.client, &self.base_url).await?;
        let model = Self::resolve_model(&preferred, &installed)?;

        let window = trailing_window(history);
        let vision = capability::supports_vision(ProviderKind::Local, &model);
        let last_index = window.len().saturating_sub(1);

        let messages: Vec<LocalChatMessage> = window
            .iter()
            .enumerate()
            .map(|(i, turn)| LocalChatMessage {
                role: turn.role.as_str(),
                content: turn.text.clone(),
                images: if vision && i == last_index && !images.is_empty() {
                    Some(images.to_vec())
                } else {
                    None
                },
            })
            .collect();

        tracing::debug!(
            model = %model,
            turns = messages.len(),
            images_attached = vision && !images.is_empty(),
            "local completion request"
        );

        let url = format!("{}/api/chat", self.base_url);
        let body = LocalChatRequest {
            model,
            messages,
            stream: false,
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(REQUEST_TIMEOUT_SECS)
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Transport {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: LocalChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponseFormat(e.to_string()))?;

        parsed
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::InvalidResponseFormat("response had no message".into()))
    }
}

/// Validate that a base URL points to loopback only.
///
/// Accepts: localhost, 127.0.0.1, [::1]. Rejects any other host and
/// malformed URLs.
pub fn validate_base_url(url: &str) -> Result<(), ProviderError> {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .ok_or_else(|| ProviderError::Network(format!("invalid local endpoint: {url}")))?;

    let host = after_scheme
        .split(':')
        .next()
        .unwrap_or("")
        .split('/')
        .next()
        .unwrap_or("");

    // IPv6 bracket notation: [::1]
    let host_clean = if after_scheme.starts_with('[') {
        after_scheme
            .split(']')
            .next()
            .unwrap_or("")
            .trim_start_matches('[')
    } else {
        host
    };

    match host_clean {
        "localhost" | "127.0.0.1" | "::1" => Ok(()),
        other => Err(ProviderError::Network(format!(
            "local endpoint must be loopback, got host '{other}'"
        ))),
    }
}

/// Validate a model name against the local server's naming convention
/// before it is placed in any request body.
///
/// Supports the community namespace format: `namespace/model:tag`.
/// Valid: `llama3.2`, `llava:13b`, `library/llava:7b`.
/// Invalid: `../etc/passwd`, `; rm -rf /`, `a/b/c`.
pub fn validate_model_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty() {
        return Err(ProviderError::InvalidModelName(name.to_string()));
    }

    // Format: [namespace/]model[:tag]. Each segment starts alphanumeric,
    // at most one `/`.
    let valid = regex::Regex::new(
        r"^[a-zA-Z0-9][a-zA-Z0-9._-]*(/[a-zA-Z0-9][a-zA-Z0-9._-]*)?(:[a-zA-Z0-9._-]+)?$",
    )
    .expect("static regex");

    if !valid.is_match(name) {
        return Err(ProviderError::InvalidModelName(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selected(model: &str) -> SelectedModel {
        SelectedModel::new(model)
    }

    // ── URL validation ──

    #[test]
    fn validate_url_accepts_loopback() {
        assert!(validate_base_url("http://localhost:11434").is_ok());
        assert!(validate_base_url("http://127.0.0.1:11434").is_ok());
        assert!(validate_base_url("http://[::1]:11434").is_ok());
        assert!(validate_base_url("https://localhost:11434").is_ok());
    }

    #[test]
    fn validate_url_rejects_remote_hosts() {
        assert!(validate_base_url("http://evil.com:11434").is_err());
        assert!(validate_base_url("http://192.168.1.100:11434").is_err());
        assert!(validate_base_url("localhost:11434").is_err());
        assert!(validate_base_url("").is_err());
    }

    #[test]
    fn client_rejects_non_loopback_endpoint() {
        let err = LocalClient::new("http://example.com:11434", selected("llama3.2"));
        assert!(err.is_err());
    }

    // ── Model name validation ──

    #[test]
    fn validate_name_accepts_usual_shapes() {
        assert!(validate_model_name("llama3.2").is_ok());
        assert!(validate_model_name("llava:13b").is_ok());
        assert!(validate_model_name("library/llava:7b").is_ok());
        assert!(validate_model_name("my-custom-model:latest").is_ok());
    }

    #[test]
    fn validate_name_rejects_malformed() {
        assert!(validate_model_name("").is_err());
        assert!(validate_model_name("../etc/passwd").is_err());
        assert!(validate_model_name("; rm -rf /").is_err());
        assert!(validate_model_name("model name").is_err());
        assert!(validate_model_name("a/b/c").is_err());
        assert!(validate_model_name("/model").is_err());
        assert!(validate_model_name("model/").is_err());
    }

    // ── Model resolution ──

    #[test]
    fn resolve_keeps_installed_preferred_model() {
        let installed = vec!["llama3.2:3b".to_string(), "llava:13b".to_string()];
        let model = LocalClient::resolve_model("llama3.2", &installed).unwrap();
        assert_eq!(model, "llama3.2");
    }

    #[test]
    fn resolve_substitutes_first_when_preferred_missing() {
        let installed = vec!["mistral:7b".to_string(), "phi3:mini".to_string()];
        let model = LocalClient::resolve_model("llama3.2", &installed).unwrap();
        assert_eq!(model, "mistral:7b");
    }

    #[test]
    fn resolve_fails_only_with_zero_models() {
        let err = LocalClient::resolve_model("llama3.2", &[]).unwrap_err();
        assert!(matches!(err, ProviderError::NoModelsAvailable));
    }

    // ── Client behavior ──

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let client = LocalClient::new("http://127.0.0.1:1", selected("llama3.2")).unwrap();
        let err = client
            .complete(&[ChatTurn::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn invalid_model_name_fails_before_any_request() {
        let client = LocalClient::new("http://127.0.0.1:1", selected("../etc/passwd")).unwrap();
        let err = client.complete(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidModelName(_)));
    }

    #[test]
    fn descriptor_tracks_selected_model() {
        let slot = selected("llama3.2");
        let client = LocalClient::new("http://localhost:11434", slot.clone()).unwrap();
        assert_eq!(client.descriptor().model, "llama3.2");
        assert!(!client.descriptor().supports_vision);

        slot.set("llava:13b".to_string());
        assert_eq!(client.descriptor().model, "llava:13b");
        assert!(client.descriptor().supports_vision);
    }

    #[test]
    fn chat_message_serializes_without_images_field_when_absent() {
        let msg = LocalChatMessage {
            role: "user",
            content: "hello".into(),
            images: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("images").is_none());

        let with_images = LocalChatMessage {
            role: "user",
            content: "look".into(),
            images: Some(vec!["abc".into()]),
        };
        let json = serde_json::to_value(&with_images).unwrap();
        assert_eq!(json["images"][0], "abc");
    }
}
