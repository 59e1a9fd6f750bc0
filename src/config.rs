//! Engine configuration: provider selection, model names, iteration budgets
//! and the fixed internal caps.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::store;

/// Which model client facade to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    Anthropic,
    OpenaiCompatible,
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Anthropic
    }
}

/// User-tunable engine configuration.
///
/// Loaded from a TOML file; the `api_key` field holds the encrypted blob on
/// disk and is decrypted on load (see [`store::ApiKeyCipher`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub provider: Provider,

    /// API key for the selected provider. Stored encrypted at rest.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL override for self-hosted or proxied endpoints.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model driving the main agent loop.
    pub primary_model: String,

    /// Model driving sub-agent loops. Falls back to `primary_model`.
    #[serde(default)]
    pub sub_model: Option<String>,

    /// Hard cap on main-loop iterations. Clamped to [1, 100].
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Sub-call budget shared across the whole task. Clamped to [1, 200].
    #[serde(default = "default_max_sub_calls")]
    pub max_sub_calls: u32,

    /// Optional JSONL trace file per run (stream tokens excluded).
    #[serde(default)]
    pub trace_path: Option<PathBuf>,

    /// Optional flat key-value store preserved across tasks.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default)]
    pub limits: Limits,
}

fn default_max_iterations() -> u32 {
    25
}

fn default_max_sub_calls() -> u32 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            api_key: None,
            base_url: None,
            primary_model: "claude-sonnet-4-20250514".to_string(),
            sub_model: None,
            max_iterations: default_max_iterations(),
            max_sub_calls: default_max_sub_calls(),
            trace_path: None,
            store_path: None,
            limits: Limits::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp the user-tunable budgets into their documented bounds.
    pub fn normalized(mut self) -> Self {
        self.max_iterations = self.max_iterations.clamp(1, 100);
        self.max_sub_calls = self.max_sub_calls.clamp(1, 200);
        self
    }

    /// Model used for sub-agent loops.
    pub fn sub_model(&self) -> &str {
        self.sub_model.as_deref().unwrap_or(&self.primary_model)
    }

    /// Load from a TOML file, decrypting the stored API key blob.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| EngineError::config(format!("failed to read {}: {err}", path.display())))?;
        let mut config: EngineConfig = toml::from_str(&raw)
            .map_err(|err| EngineError::config(format!("failed to parse {}: {err}", path.display())))?;
        if let Some(blob) = config.api_key.take() {
            let key = store::ApiKeyCipher::load_or_create()
                .map_err(|err| EngineError::config(err.to_string()))?;
            let plain = if store::ApiKeyCipher::is_encrypted(&blob) {
                key.decrypt(&blob)
                    .map_err(|err| EngineError::config(format!("api key decrypt failed: {err}")))?
            } else {
                blob
            };
            config.api_key = Some(plain);
        }
        Ok(config.normalized())
    }

    /// Persist to a TOML file with the API key encrypted.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let mut on_disk = self.clone();
        if let Some(plain) = on_disk.api_key.take() {
            let key = store::ApiKeyCipher::load_or_create()
                .map_err(|err| EngineError::config(err.to_string()))?;
            let blob = key
                .encrypt(&plain)
                .map_err(|err| EngineError::config(format!("api key encrypt failed: {err}")))?;
            on_disk.api_key = Some(blob);
        }
        let raw = toml::to_string_pretty(&on_disk)
            .map_err(|err| EngineError::config(err.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| EngineError::config(err.to_string()))?;
        }
        std::fs::write(path, raw).map_err(|err| EngineError::config(err.to_string()))
    }
}

/// Fixed internal caps. These are compiled-in defaults rather than knobs; the
/// struct exists so tests can tighten them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Consecutive no-code model responses tolerated before erroring.
    pub max_no_code_continuations: u32,
    /// Iteration cap for every sub-agent loop.
    pub max_sub_iterations: u32,
    /// Token budget for the compacted action history.
    pub history_token_budget: usize,
    /// Compaction triggers at this fraction of the budget (percent).
    pub history_compact_percent: usize,
    /// Cap on a single execution result, in JSON characters.
    pub exec_result_cap: usize,
    /// Cap on `sleep` calls from the REPL, in milliseconds.
    pub sleep_cap_ms: u64,
    /// Wall-clock timeout for one code block.
    pub exec_timeout_ms: u64,
    /// Timeout for a single `execInTab` call.
    pub exec_in_tab_timeout_ms: u64,
    /// Default timeout for `waitForLoad` / `waitForSelector`.
    pub wait_timeout_ms: u64,
    /// Cap on one `log` message.
    pub log_max_chars: usize,
    /// Preview length for result metadata.
    pub preview_max_chars: usize,
    /// Preview length for variable descriptors.
    pub var_preview_max_chars: usize,
    /// Memory ceiling for one REPL evaluator, in bytes.
    pub repl_memory_limit_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_no_code_continuations: 3,
            max_sub_iterations: 10,
            history_token_budget: 8_000,
            history_compact_percent: 80,
            exec_result_cap: 100_000,
            sleep_cap_ms: 10_000,
            exec_timeout_ms: 30_000,
            exec_in_tab_timeout_ms: 10_000,
            wait_timeout_ms: 30_000,
            log_max_chars: 5_000,
            preview_max_chars: 400,
            var_preview_max_chars: 200,
            repl_memory_limit_bytes: 128 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_are_clamped() {
        let config = EngineConfig {
            max_iterations: 0,
            max_sub_calls: 9_999,
            ..EngineConfig::default()
        }
        .normalized();
        assert_eq!(config.max_iterations, 1);
        assert_eq!(config.max_sub_calls, 200);
    }

    #[test]
    fn sub_model_falls_back_to_primary() {
        let mut config = EngineConfig::default();
        assert_eq!(config.sub_model(), config.primary_model);
        config.sub_model = Some("small-model".into());
        assert_eq!(config.sub_model(), "small-model");
    }

    #[test]
    fn default_limits_match_contract() {
        let limits = Limits::default();
        assert_eq!(limits.exec_result_cap, 100_000);
        assert_eq!(limits.history_token_budget, 8_000);
        assert_eq!(limits.max_sub_iterations, 10);
    }
}
