use crate::{Result, runtime_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
/// Hard ceiling on the serialized size of one session file.
pub const DEFAULT_MAX_SESSION_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent_loop: AgentLoopConfig,
    pub sessions: SessionConfig,
    pub tools: ToolsConfig,
    pub observe: ObserveConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".devpilot/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Layered load: defaults, legacy TOML, user settings, project settings,
    /// project-local settings. Later layers win key by key.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, json_layers: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_value: toml::Table = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_value)?);
        }

        for path in json_layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::project_settings_path(workspace);
        if path.exists()
            || Self::project_local_settings_path(workspace).exists()
            || Self::legacy_toml_path(workspace).exists()
            || Self::user_settings_path().is_some_and(|p| p.exists())
        {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// Model used for semantic history compression. Empty means `model`.
    pub summary_model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub network_retry_base_ms: u64,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl LlmConfig {
    pub fn summary_model(&self) -> &str {
        if self.summary_model.trim().is_empty() {
            &self.model
        } else {
            &self.summary_model
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            summary_model: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            api_key_env: "DEVPILOT_API_KEY".to_string(),
            timeout_seconds: 600,
            max_retries: 3,
            retry_base_ms: 400,
            network_retry_base_ms: 1000,
            max_tokens: 4096,
            temperature: Some(0.2),
        }
    }
}

fn default_agent_loop_max_iterations() -> u64 {
    25
}
fn default_agent_loop_compress_threshold() -> usize {
    40
}
fn default_agent_loop_keep_recent() -> usize {
    10
}
fn default_agent_loop_max_tool_result_chars() -> usize {
    12_000
}
fn default_agent_loop_semantic_compression() -> bool {
    true
}
fn default_agent_loop_extension_iterations() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    #[serde(default = "default_agent_loop_max_iterations")]
    pub max_iterations: u64,
    /// Canonical history length above which compression runs.
    #[serde(default = "default_agent_loop_compress_threshold")]
    pub compress_threshold: usize,
    #[serde(default = "default_agent_loop_keep_recent")]
    pub keep_recent: usize,
    /// Tool results longer than this are truncated in the sent history only.
    #[serde(default = "default_agent_loop_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
    #[serde(default = "default_agent_loop_semantic_compression")]
    pub semantic_compression: bool,
    /// Iterations granted each time the user accepts an extension.
    #[serde(default = "default_agent_loop_extension_iterations")]
    pub extension_iterations: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_agent_loop_max_iterations(),
            compress_threshold: default_agent_loop_compress_threshold(),
            keep_recent: default_agent_loop_keep_recent(),
            max_tool_result_chars: default_agent_loop_max_tool_result_chars(),
            semantic_compression: default_agent_loop_semantic_compression(),
            extension_iterations: default_agent_loop_extension_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_session_bytes: u64,
    /// Sessions kept by `sessions cleanup` when no `--keep` is given.
    pub max_keep: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_bytes: DEFAULT_MAX_SESSION_BYTES,
            max_keep: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub read_max_bytes: usize,
    pub search_max_results: usize,
    pub search_budget_ms: u64,
    pub git_timeout_seconds: u64,
    pub max_output_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            read_max_bytes: 256 * 1024,
            search_max_results: 200,
            search_budget_ms: 5_000,
            git_timeout_seconds: 30,
            max_output_chars: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObserveConfig {
    pub verbose: bool,
    pub telemetry_enabled: bool,
    pub telemetry_endpoint: Option<String>,
}
