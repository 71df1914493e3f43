use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub coding: bool,
}

impl ModelCapabilities {
    pub fn satisfies(&self, wanted: &ModelCapabilities) -> bool {
        (!wanted.vision || self.vision)
            && (!wanted.reasoning || self.reasoning)
            && (!wanted.coding || self.coding)
    }
}

/// Catalog entry for an execution resource. `enabled` is the operator toggle;
/// `active` is false once a record is retired and must never be selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(alias = "providerID", alias = "providerId")]
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub context_window: usize,
    /// Cost per 1k tokens in the catalog's currency unit.
    #[serde(default)]
    pub cost_per_1k: f64,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            provider_id: provider_id.into(),
            group_id: None,
            context_window: 8_192,
            cost_per_1k: 0.0,
            capabilities: ModelCapabilities::default(),
            enabled: true,
            active: true,
        }
    }

    pub fn in_group(&self, groups: &[String]) -> bool {
        self.group_id
            .as_deref()
            .is_some_and(|group| groups.iter().any(|g| g.eq_ignore_ascii_case(group)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelRequirements {
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_context_window: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_1k: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn payload_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}
