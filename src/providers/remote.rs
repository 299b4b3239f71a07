//! Remote provider client: hosted chat-completions endpoint.
//!
//! Sends the trailing window of the conversation with a bearer credential.
//! When images ride along and the model accepts them, only the final
//! message is reshaped into multimodal parts; everything before it stays
//! text-only.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    trailing_window, ChatTurn, CompletionProvider, ProviderDescriptor, ProviderError, ProviderKind,
};
use crate::capability;
use crate::config::{
    Settings, DEFAULT_REMOTE_BASE_URL, DEFAULT_REMOTE_MODEL, MAX_TOKENS, REQUEST_TIMEOUT_SECS,
    TEMPERATURE,
};

pub struct RemoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl RemoteClient {
    pub fn new(api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_REMOTE_MODEL.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.remote_api_key.clone())
            .with_base_url(&settings.remote_base_url)
            .with_model(&settings.remote_model)
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Build the request messages: the whole window as plain text, with the
    /// final message expanded into multimodal parts when images apply.
    fn build_messages(window: &[ChatTurn], images: &[String]) -> Vec<Value> {
        let mut messages: Vec<Value> = window
            .iter()
            .map(|turn| {
                serde_json::json!({
                    "role": turn.role.as_str(),
                    "content": turn.text,
                })
            })
            .collect();

        if !images.is_empty() {
            if let (Some(slot), Some(last)) = (messages.last_mut(), window.last()) {
                let mut parts = vec![serde_json::json!({
                    "type": "text",
                    "text": last.text,
                })];
                for image in images {
                    parts.push(serde_json::json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{image}") },
                    }));
                }
                *slot = serde_json::json!({
                    "role": last.role.as_str(),
                    "content": parts,
                });
            }
        }

        messages
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Value>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Error envelope most hosted endpoints return on non-2xx.
#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[async_trait::async_trait]
impl CompletionProvider for RemoteClient {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::Remote,
            model: self.model.clone(),
            supports_vision: capability::supports_vision(ProviderKind::Remote, &self.model),
        }
    }

    async fn complete(
        &self,
        history: &[ChatTurn],
        images: &[String],
    ) -> Result<String, ProviderError> {
        // Missing credential is a configuration error: raised before any
        // network traffic.
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ProviderError::MissingCredential)?;

        let window = trailing_window(history);
        let images: &[String] = if capability::supports_vision(ProviderKind::Remote, &self.model) {
            images
        } else {
            &[]
        };

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::build_messages(window, images),
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        tracing::debug!(
            model = %self.model,
            turns = window.len(),
            images = images.len(),
            "remote completion request"
        );

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(REQUEST_TIMEOUT_SECS)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !status.is_success() {
            // Surface the upstream error message when the body carries one.
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ProviderError::Transport {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponseFormat(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponseFormat("response had no choices".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credential_fails_before_any_request() {
        // Unroutable base URL: if the client tried the network this
        // would surface as a different error.
        let client = RemoteClient::new(None).with_base_url("http://127.0.0.1:1");
        let err = client
            .complete(&[ChatTurn::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential));
    }

    #[tokio::test]
    async fn empty_credential_counts_as_missing() {
        let client =
            RemoteClient::new(Some(String::new())).with_base_url("http://127.0.0.1:1");
        let err = client.complete(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingCredential));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_network_error() {
        let client =
            RemoteClient::new(Some("sk-test".into())).with_base_url("http://127.0.0.1:1");
        let err = client
            .complete(&[ChatTurn::user("hi")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Network(_)), "got {err:?}");
    }

    #[test]
    fn descriptor_reflects_vision_support() {
        let vision = RemoteClient::new(None).with_model("gpt-4o");
        assert!(vision.descriptor().supports_vision);
        assert_eq!(vision.descriptor().kind, ProviderKind::Remote);

        let text_only = RemoteClient::new(None).with_model("gpt-3.5-turbo");
        assert!(!text_only.descriptor().supports_vision);
    }

    #[test]
    fn plain_messages_stay_string_content() {
        let window = vec![ChatTurn::user("Hello"), ChatTurn::assistant("Hi there")];
        let messages = RemoteClient::build_messages(&window, &[]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Hello");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "Hi there");
    }

    #[test]
    fn only_final_message_becomes_multimodal() {
        let window = vec![
            ChatTurn::user("earlier question"),
            ChatTurn::assistant("earlier answer"),
            ChatTurn::user("what is in this picture?"),
        ];
        let images = vec!["aW1hZ2Ux".to_string(), "aW1hZ2Uy".to_string()];
        let messages = RemoteClient::build_messages(&window, &images);

        // Preceding messages remain plain strings.
        assert!(messages[0]["content"].is_string());
        assert!(messages[1]["content"].is_string());

        // Final message: one text part plus one part per image, in order.
        let parts = messages[2]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[0]["text"], "what is in this picture?");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .ends_with("aW1hZ2Ux"));
        assert!(parts[2]["image_url"]["url"]
            .as_str()
            .unwrap()
            .ends_with("aW1hZ2Uy"));
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let client = RemoteClient::new(None).with_base_url("https://api.example.com/v1/");
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }
}
