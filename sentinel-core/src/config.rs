//! Layered configuration: programmatic defaults, overridden by a TOML file,
//! overridden by environment variables.
//!
//! Grounded on `core/src/config.rs`'s merge-then-validate shape, scaled down
//! to this engine's recognised keys.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::approval::MasterMode;
use crate::approval::ModuleMode;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid environment override {key}={value}: {message}")]
    InvalidEnvOverride {
        key: String,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

fn default_llm_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_verifier_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            timeout_ms: default_verifier_timeout_ms(),
        }
    }
}

fn default_verifier_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GateConfigSection {
    #[serde(default)]
    pub master_mode: MasterMode,
    #[serde(default)]
    pub module_overrides: HashMap<String, ModuleMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_internal_patch_version")]
    pub internal_patch_version: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            internal_patch_version: default_internal_patch_version(),
        }
    }
}

fn default_internal_patch_version() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub gate: GateConfigSection,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Programmatic defaults, with no file or environment involved.
    pub fn defaults() -> Self {
        Config::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = std::fs::read_to_string(path_ref).map_err(|e| ConfigError::Read {
            path: path_ref.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Applies `SENTINEL_*` environment overrides on top of an already
    /// loaded config. Unset variables leave the existing value untouched.
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var("SENTINEL_LLM_TIMEOUT_MS") {
            self.llm.timeout_ms = parse_env("SENTINEL_LLM_TIMEOUT_MS", &value)?;
        }
        if let Ok(value) = std::env::var("SENTINEL_VERIFIER_TIMEOUT_MS") {
            self.verifier.timeout_ms = parse_env("SENTINEL_VERIFIER_TIMEOUT_MS", &value)?;
        }
        if let Ok(value) = std::env::var("SENTINEL_GATE_MASTER_MODE") {
            self.gate.master_mode = match value.to_ascii_lowercase().as_str() {
                "hitl" => MasterMode::Hitl,
                "autonomous" => MasterMode::Autonomous,
                other => {
                    return Err(ConfigError::InvalidEnvOverride {
                        key: "SENTINEL_GATE_MASTER_MODE".to_string(),
                        value: value.clone(),
                        message: format!("unknown mode {other:?}"),
                    });
                }
            };
        }
        if let Ok(value) = std::env::var("SENTINEL_ENGINE_MAX_ITERATIONS") {
            self.engine.max_iterations = parse_env("SENTINEL_ENGINE_MAX_ITERATIONS", &value)?;
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
        message: "not a valid integer".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::defaults();
        assert_eq!(config.llm.timeout_ms, 60_000);
        assert_eq!(config.verifier.timeout_ms, 30_000);
        assert_eq!(config.gate.master_mode, MasterMode::Hitl);
        assert!(config.gate.module_overrides.is_empty());
        assert_eq!(config.codec.internal_patch_version, 2);
        assert_eq!(config.engine.max_iterations, 10);
    }

    #[test]
    fn partial_toml_fills_remaining_fields_with_defaults() {
        let config = Config::from_toml_str("[verifier]\ntimeout_ms = 5000\n").unwrap();
        assert_eq!(config.verifier.timeout_ms, 5000);
        assert_eq!(config.llm.timeout_ms, 60_000);
    }

    #[test]
    fn module_overrides_parse_from_toml() {
        let toml_text = r#"
            [gate]
            master_mode = "autonomous"
            [gate.module_overrides]
            "cycle.context" = "hitl"
        "#;
        let config = Config::from_toml_str(toml_text).unwrap();
        assert_eq!(config.gate.master_mode, MasterMode::Autonomous);
        assert_eq!(
            config.gate.module_overrides.get("cycle.context"),
            Some(&ModuleMode::Hitl)
        );
    }

    #[test]
    fn invalid_env_override_is_reported() {
        // SAFETY: test-only process-local env mutation, no concurrent access
        // to this key from other tests.
        unsafe {
            std::env::set_var("SENTINEL_ENGINE_MAX_ITERATIONS", "not-a-number");
        }
        let result = Config::defaults().apply_env_overrides();
        unsafe {
            std::env::remove_var("SENTINEL_ENGINE_MAX_ITERATIONS");
        }
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnvOverride { .. })
        ));
    }
}
