use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use crucible_types::ModelDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_attempts: u32,
    pub max_parallel_tasks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_parallel_tasks: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BanditPolicy {
    #[default]
    EpsilonGreedy,
    Ucb1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub policy: BanditPolicy,
    pub epsilon: f64,
    pub exploration: f64,
    /// Arms with fewer (completed + in-flight) pulls than this are always
    /// preferred over arms that have more.
    pub cold_start_pulls: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            policy: BanditPolicy::EpsilonGreedy,
            epsilon: 0.1,
            exploration: std::f64::consts::SQRT_2,
            cold_start_pulls: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub top_n: usize,
    pub low_priority_groups: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            top_n: 3,
            low_priority_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub base_timeout_secs: u64,
    pub complex_timeout_secs: u64,
    pub complex_threshold_chars: usize,
    pub complex_max_tokens: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            base_timeout_secs: 60,
            complex_timeout_secs: 180,
            complex_threshold_chars: 12_000,
            complex_max_tokens: 4_096,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArenaBackendKind {
    #[default]
    Git,
    Scratch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub root: Option<PathBuf>,
    pub repo_path: Option<PathBuf>,
    pub base_ref: String,
    pub backend: ArenaBackendKind,
    pub agent_timeout_secs: u64,
    pub commit_on_success: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            root: None,
            repo_path: None,
            base_ref: "HEAD".to_string(),
            backend: ArenaBackendKind::Git,
            agent_timeout_secs: 600,
            commit_on_success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub arena: ArenaConfig,
    #[serde(default)]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_paths(path, global_path, env_layer(), cli_overrides).await
    }

    /// Builds a store from explicit layer sources. The env layer is passed in
    /// so callers (and tests) control what the process environment contributes.
    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, &env, &global_path).await?;
        scrub_persisted_secrets(&mut project, &env, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "effective config did not deserialize; using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": redact_layer(&layers.env),
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let (snapshot, env) = {
            let layers = self.layers.read().await;
            (layers.project.clone(), layers.env.clone())
        };
        write_json_file(&self.project_path, &snapshot, &env).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let (snapshot, env) = {
            let layers = self.layers.read().await;
            (layers.global.clone(), layers.env.clone())
        };
        write_json_file(&self.global_path, &snapshot, &env).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value, env: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write, env);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// Drops `api_key` from any provider whose key is supplied by the environment,
/// so env-sourced secrets never land in a config file.
fn strip_persisted_secrets(value: &mut Value, env: &Value) {
    let Some(providers) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("providers"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for (provider_id, provider_cfg) in providers.iter_mut() {
        let Value::Object(cfg) = provider_cfg else {
            continue;
        };
        if env_provides_key(env, provider_id) {
            cfg.remove("api_key");
            cfg.remove("apiKey");
        }
    }
}

fn env_provides_key(env: &Value, provider_id: &str) -> bool {
    env.get("providers")
        .and_then(|providers| providers.get(provider_id))
        .and_then(|cfg| cfg.get("api_key"))
        .and_then(Value::as_str)
        .is_some_and(|key| !key.trim().is_empty())
}

async fn scrub_persisted_secrets(
    value: &mut Value,
    env: &Value,
    path: &Path,
) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value, env);
    if *value != before {
        tracing::info!(path = %path.display(), "removed env-sourced provider keys from config file");
        write_json_file(path, value, env).await?;
    }
    Ok(())
}

fn redact_layer(value: &Value) -> Value {
    let mut out = value.clone();
    if let Some(providers) = out.get_mut("providers").and_then(Value::as_object_mut) {
        for cfg in providers.values_mut() {
            if let Some(key) = cfg.get_mut("api_key") {
                *key = Value::String("[redacted]".to_string());
            }
        }
    }
    out
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CRUCIBLE_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("crucible").join("config.json");
    }
    PathBuf::from(".crucible/global_config.json")
}

/// Snapshot of the `CRUCIBLE_*` and provider variables as a config layer.
pub fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

pub fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(n) = var("CRUCIBLE_MAX_ATTEMPTS").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(&mut root, &json!({ "orchestrator": { "max_attempts": n } }));
    }
    if let Some(n) = var("CRUCIBLE_MAX_PARALLEL_TASKS").and_then(|v| v.trim().parse::<usize>().ok())
    {
        deep_merge(&mut root, &json!({ "orchestrator": { "max_parallel_tasks": n } }));
    }
    if let Some(root_dir) = var("CRUCIBLE_ARENA_ROOT") {
        deep_merge(&mut root, &json!({ "arena": { "root": root_dir } }));
    }
    if let Some(base_ref) = var("CRUCIBLE_BASE_REF") {
        deep_merge(&mut root, &json!({ "arena": { "base_ref": base_ref } }));
    }
    if let Some(trace) = var("CRUCIBLE_TRACE_LOG") {
        deep_merge(&mut root, &json!({ "trace_log": trace }));
    }

    for (provider, key_env, url, model) in [
        (
            "openai",
            "OPENAI_API_KEY",
            "https://api.openai.com/v1",
            "gpt-4o-mini",
        ),
        (
            "openrouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o-mini",
        ),
        (
            "groq",
            "GROQ_API_KEY",
            "https://api.groq.com/openai/v1",
            "llama-3.1-8b-instant",
        ),
    ] {
        if let Some(api_key) = var(key_env) {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        provider: {
                            "api_key": api_key,
                            "url": url,
                            "default_model": model
                        }
                    }
                }),
            );
        }
    }
    if let Some(ollama_url) = var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({
                "providers": {
                    "ollama": {
                        "url": ollama_url,
                        "default_model": "llama3.1:8b"
                    }
                }
            }),
        );
    }

    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
