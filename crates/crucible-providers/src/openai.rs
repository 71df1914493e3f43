use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crucible_observability::redact_text;
use crucible_types::{CompletionRequest, ModelDescriptor, ProviderInfo};

use crate::Provider;

/// Offline fallback used when no provider is configured. Replies with the
/// last user message so pipelines can be exercised end to end.
pub struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
        }
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        let mut echo = ModelDescriptor::new("echo-1", "local");
        echo.display_name = "Echo Model".to_string();
        vec![echo]
    }

    async fn generate_completion(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("Echo: {last}"))
    }
}

pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    fn models(&self) -> Vec<ModelDescriptor> {
        let mut model = ModelDescriptor::new(self.default_model.clone(), self.id.clone());
        model.context_window = 128_000;
        vec![model]
    }

    async fn generate_completion(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        let model = Some(request.model_id.trim())
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": model,
            "messages": request
                .messages
                .iter()
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect::<Vec<_>>(),
            "stream": false,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: Value = response.json().await?;
        completion_text(model, status, &value)
    }
}

/// Pulls the completion out of a chat-completions response. The raw body
/// only ever appears in errors as a digest.
fn completion_text(model: &str, status: StatusCode, value: &Value) -> anyhow::Result<String> {
    if let Some(detail) = extract_openai_error(value) {
        anyhow::bail!(detail);
    }
    if !status.is_success() {
        anyhow::bail!(
            "provider request failed with status {} (response: {})",
            status,
            redact_text(&value.to_string())
        );
    }
    if let Some(text) = extract_openai_text(value) {
        return Ok(text);
    }
    anyhow::bail!(
        "provider returned no completion content for model `{}` (response: {})",
        model,
        redact_text(&value.to_string())
    )
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn collect_text_fragments(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_fragments(message, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let mut out = String::new();

    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        collect_text_fragments(choice, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    if let Some(content) = value.get("content") {
        collect_text_fragments(content, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }

    None
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_always_ends_in_v1() {
        assert_eq!(normalize_base("http://localhost:11434"), "http://localhost:11434/v1");
        assert_eq!(normalize_base("https://api.openai.com/v1"), "https://api.openai.com/v1");
        assert_eq!(normalize_base("https://host/"), "https://host/v1");
    }

    #[test]
    fn extracts_text_from_chat_choice() {
        let value = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}]
        });
        assert_eq!(extract_openai_text(&value).as_deref(), Some("hello there"));

        let parts = json!({
            "choices": [{"message": {"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]}}]
        });
        assert_eq!(extract_openai_text(&parts).as_deref(), Some("ab"));
        assert_eq!(extract_openai_text(&json!({"choices": []})), None);
    }

    #[test]
    fn extracts_error_message() {
        let value = json!({"error": {"message": "invalid api key"}});
        assert_eq!(extract_openai_error(&value).as_deref(), Some("invalid api key"));
        assert_eq!(extract_openai_error(&json!({"ok": true})), None);
    }

    #[test]
    fn unexpected_bodies_only_surface_as_a_digest() {
        let echoed = json!({"debug": {"authorization": "Bearer sk-live-abc123"}});
        let err = completion_text("m", StatusCode::OK, &echoed).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no completion content for model `m`"), "{message}");
        assert!(message.contains("[redacted len="), "{message}");
        assert!(!message.contains("sk-live-abc123"), "{message}");

        let err = completion_text("m", StatusCode::BAD_GATEWAY, &echoed).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("502"), "{message}");
        assert!(!message.contains("sk-live-abc123"), "{message}");

        let err = completion_text(
            "m",
            StatusCode::UNAUTHORIZED,
            &json!({"error": {"message": "invalid api key"}}),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid api key");

        let ok = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(completion_text("m", StatusCode::OK, &ok).expect("text"), "hi");
    }
}
