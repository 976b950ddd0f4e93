//! ParallelChat configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main ParallelChat configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Turn orchestration settings
    pub orchestrator: OrchestratorConfig,

    /// HTTP/WebSocket server settings
    pub server: ServerConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Checks that required environment variables are set correctly.
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.llm.api_key_env).is_err() {
            return Err(eyre::eyre!(
                "LLM API key not found. Set the {} environment variable.",
                self.llm.api_key_env
            ));
        }
        if self.orchestrator.max_branches == 0 {
            return Err(eyre::eyre!("orchestrator.max-branches must be at least 1"));
        }
        if self.orchestrator.max_concurrent_calls == 0 {
            return Err(eyre::eyre!("orchestrator.max-concurrent-calls must be at least 1"));
        }
        if self.orchestrator.injection_marker.trim().is_empty() {
            return Err(eyre::eyre!("orchestrator.injection-marker must not be empty"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .parallelchat.yml
        let local_config = PathBuf::from(".parallelchat.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/parallelchat/parallelchat.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("parallelchat").join("parallelchat.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level from the config file, read before logging is set up
    ///
    /// Any load failure yields `None`; the full load reports it later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name ("anthropic" or "openai")
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// HTTP request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl LlmConfig {
    /// Read the API key from the configured environment variable
    pub fn get_api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).context(format!("Environment variable {} not set", self.api_key_env))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 300_000,
        }
    }
}

/// Turn orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on injections taken from one decomposition or rebranch
    #[serde(rename = "max-branches")]
    pub max_branches: usize,

    /// Extra branching rounds allowed after iteration 0 (0 disables rebranching)
    #[serde(rename = "max-rebranch-rounds")]
    pub max_rebranch_rounds: u32,

    /// Marker the skeleton prompt must contain exactly once
    #[serde(rename = "injection-marker")]
    pub injection_marker: String,

    /// Stream synthesis deltas before the final_response event
    #[serde(rename = "stream-synthesis")]
    pub stream_synthesis: bool,

    #[serde(rename = "decompose-timeout-ms")]
    pub decompose_timeout_ms: u64,

    #[serde(rename = "branch-timeout-ms")]
    pub branch_timeout_ms: u64,

    #[serde(rename = "rebranch-timeout-ms")]
    pub rebranch_timeout_ms: u64,

    #[serde(rename = "synthesis-timeout-ms")]
    pub synthesis_timeout_ms: u64,

    /// Simultaneous gateway calls across all branches
    #[serde(rename = "max-concurrent-calls")]
    pub max_concurrent_calls: usize,

    /// Token cap for each branch response
    #[serde(rename = "branch-max-tokens")]
    pub branch_max_tokens: u32,

    /// Token cap for decomposition, evaluation, rebranch and synthesis replies
    #[serde(rename = "control-max-tokens")]
    pub control_max_tokens: u32,

    /// Directory with .pmt overrides for the embedded prompts
    #[serde(rename = "prompts-dir")]
    pub prompts_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn decompose_timeout(&self) -> Duration {
        Duration::from_millis(self.decompose_timeout_ms)
    }

    pub fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_timeout_ms)
    }

    pub fn rebranch_timeout(&self) -> Duration {
        Duration::from_millis(self.rebranch_timeout_ms)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_millis(self.synthesis_timeout_ms)
    }

    /// Prompts directory with `~/` expanded
    pub fn expanded_prompts_dir(&self) -> Option<PathBuf> {
        self.prompts_dir.as_ref().map(|p| match p.strip_prefix("~") {
            Ok(rest) => dirs::home_dir().map(|home| home.join(rest)).unwrap_or_else(|| p.clone()),
            Err(_) => p.clone(),
        })
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_branches: 4,
            max_rebranch_rounds: 2,
            injection_marker: "[INJECTION_POINT]".to_string(),
            stream_synthesis: true,
            decompose_timeout_ms: 60_000,
            branch_timeout_ms: 180_000,
            rebranch_timeout_ms: 60_000,
            synthesis_timeout_ms: 180_000,
            max_concurrent_calls: 8,
            branch_max_tokens: 4096,
            control_max_tokens: 8192,
            prompts_dir: None,
        }
    }
}

/// HTTP/WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub bind: String,

    /// Seconds between SSE keep-alive comments
    #[serde(rename = "keepalive-secs")]
    pub keepalive_secs: u64,

    /// Outbound event buffer per turn
    #[serde(rename = "event-buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4000".to_string(),
            keepalive_secs: 15,
            event_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.orchestrator.max_branches, 4);
        assert_eq!(config.orchestrator.max_rebranch_rounds, 2);
        assert_eq!(config.orchestrator.injection_marker, "[INJECTION_POINT]");
        assert!(config.orchestrator.stream_synthesis);
        assert_eq!(config.server.bind, "127.0.0.1:4000");
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

llm:
  provider: openai
  model: gpt-4o
  api-key-env: MY_API_KEY
  base-url: https://api.example.com
  max-tokens: 2048
  timeout-ms: 60000

orchestrator:
  max-branches: 3
  max-rebranch-rounds: 0
  injection-marker: "{{SLOT}}"
  stream-synthesis: false
  branch-timeout-ms: 5000
  max-concurrent-calls: 2

server:
  bind: 0.0.0.0:8080
  keepalive-secs: 5
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.api_key_env, "MY_API_KEY");
        assert_eq!(config.orchestrator.max_branches, 3);
        assert_eq!(config.orchestrator.max_rebranch_rounds, 0);
        assert_eq!(config.orchestrator.injection_marker, "{{SLOT}}");
        assert!(!config.orchestrator.stream_synthesis);
        assert_eq!(config.orchestrator.branch_timeout(), Duration::from_secs(5));
        assert_eq!(config.orchestrator.max_concurrent_calls, 2);
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.event_buffer, 256);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
llm:
  model: claude-haiku
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.model, "claude-haiku");
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.orchestrator.max_concurrent_calls, 8);
        assert_eq!(config.server.keepalive_secs, 15);
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "orchestrator:\n  max-branches: 2").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.orchestrator.max_branches, 2);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let path = PathBuf::from("/nonexistent/parallelchat.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_validate_missing_api_key() {
        let mut config = Config::default();
        config.llm.api_key_env = "PARALLELCHAT_TEST_KEY_THAT_IS_NEVER_SET".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("PARALLELCHAT_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_validate_uses_present_env_var() {
        let mut config = Config::default();
        // PATH is set in every test environment
        config.llm.api_key_env = "PATH".to_string();
        assert!(config.validate().is_ok());

        config.orchestrator.max_branches = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_injection_marker() {
        let mut config = Config::default();
        config.llm.api_key_env = "PATH".to_string();

        for marker in ["", "   "] {
            config.orchestrator.injection_marker = marker.to_string();
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains("injection-marker"), "marker {:?} gave {}", marker, err);
        }
    }
}
