//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from a TOML file at
//! `$XDG_CONFIG_HOME/relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [tokens]
//! ttl_secs = 60
//! refresh_margin_secs = 10
//!
//! [subscription]
//! reconnect_attempts = 5
//! reconnect_delay_ms = 250
//! max_reconnect_delay_ms = 5000
//! max_batch = 256
//! refresh_timeout_ms = 5000
//!
//! [animation]
//! quiescence_ms = 3000
//! streaming_threshold = 50
//!
//! [reducer]
//! text_buffer = "reset-per-turn"
//!
//! [generation]
//! model = "gpt-4o-mini"
//! base_url = "https://api.openai.com/v1"
//! temperature = 0.7
//!
//! [publisher]
//! progress_every_chunks = 10
//!
//! [access.grants]
//! alice = ["session-one", "session-two"]
//! ```
//!
//! The generation API key is never read from this file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::animation::AnimationConfig;
use crate::generation::DEFAULT_BASE_URL;
use crate::reducer::TextBufferPolicy;
use crate::session::SessionConfig;
use crate::subscription::SubscriptionConfig;
use crate::token::TokenConfig;
use crate::workflow::TurnConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[tokens]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensToml {
    /// Token lifetime in seconds
    pub ttl_secs: Option<u64>,
    /// Refresh this many seconds before expiry
    pub refresh_margin_secs: Option<u64>,
}

/// `[subscription]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionToml {
    /// Reconnection attempts before giving up
    pub reconnect_attempts: Option<u32>,
    /// First reconnection delay in milliseconds
    pub reconnect_delay_ms: Option<u64>,
    /// Reconnection delay cap in milliseconds
    pub max_reconnect_delay_ms: Option<u64>,
    /// Most messages per batch
    pub max_batch: Option<usize>,
    /// Token refresh deadline in milliseconds
    pub refresh_timeout_ms: Option<u64>,
}

/// `[animation]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationToml {
    /// Complete → idle delay in milliseconds
    pub quiescence_ms: Option<u64>,
    /// Running progress below this shows processing
    pub streaming_threshold: Option<u8>,
}

/// `[reducer]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducerToml {
    /// Text buffer lifecycle across turns
    pub text_buffer: Option<TextBufferPolicy>,
}

/// `[generation]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Model identifier
    pub model: Option<String>,
    /// Endpoint base URL
    pub base_url: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// System prompt
    pub system_prompt: Option<String>,
}

/// `[publisher]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherToml {
    /// Streaming progress tick interval in chunks
    pub progress_every_chunks: Option<usize>,
}

/// `[access]`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessToml {
    /// Requester id → sessions it may subscribe to
    pub grants: BTreeMap<String, Vec<String>>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Token section
    pub tokens: TokensToml,
    /// Subscription section
    pub subscription: SubscriptionToml,
    /// Animation section
    pub animation: AnimationToml,
    /// Reducer section
    pub reducer: ReducerToml,
    /// Generation section
    pub generation: GenerationToml,
    /// Publisher section
    pub publisher: PublisherToml,
    /// Access section
    pub access: AccessToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration for every component
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Token issuer settings
    pub tokens: TokenConfig,
    /// Consumer pipeline settings
    pub session: SessionConfig,
    /// Producer settings
    pub turn: TurnConfig,
    /// Generation endpoint
    pub base_url: String,
    /// Requester id → sessions the allow-list authorizer grants
    pub grants: BTreeMap<String, Vec<String>>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let tokens = TokenConfig::default();
        let session = SessionConfig {
            subscription: SubscriptionConfig {
                refresh_margin: tokens.refresh_margin,
                ..SubscriptionConfig::default()
            },
            animation: AnimationConfig::default(),
            text_buffer: TextBufferPolicy::default(),
        };

        Self {
            tokens,
            session,
            turn: TurnConfig::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            grants: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero TTL, a refresh
    /// margin not below the TTL, or a streaming threshold above 100.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.ttl.is_zero() {
            return Err(ConfigError::ValidationError(
                "tokens.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.tokens.refresh_margin >= self.tokens.ttl {
            return Err(ConfigError::ValidationError(format!(
                "tokens.refresh_margin_secs ({}) must be less than tokens.ttl_secs ({})",
                self.tokens.refresh_margin.as_secs(),
                self.tokens.ttl.as_secs()
            )));
        }
        if self.session.animation.streaming_threshold > 100 {
            return Err(ConfigError::ValidationError(format!(
                "animation.streaming_threshold ({}) must be at most 100",
                self.session.animation.streaming_threshold
            )));
        }
        if self.session.subscription.max_batch == 0 {
            return Err(ConfigError::ValidationError(
                "subscription.max_batch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or `~/.config/relay/relay.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    if let Some(ttl) = toml.tokens.ttl_secs {
        config.tokens.ttl = Duration::from_secs(ttl);
    }
    if let Some(margin) = toml.tokens.refresh_margin_secs {
        config.tokens.refresh_margin = Duration::from_secs(margin);
        config.session.subscription.refresh_margin = Duration::from_secs(margin);
    }

    let sub = &mut config.session.subscription;
    if let Some(attempts) = toml.subscription.reconnect_attempts {
        sub.reconnect.max_attempts = attempts;
    }
    if let Some(delay) = toml.subscription.reconnect_delay_ms {
        sub.reconnect.initial_delay = Duration::from_millis(delay);
    }
    if let Some(delay) = toml.subscription.max_reconnect_delay_ms {
        sub.reconnect.max_delay = Duration::from_millis(delay);
    }
    if let Some(max_batch) = toml.subscription.max_batch {
        sub.max_batch = max_batch;
    }
    if let Some(timeout) = toml.subscription.refresh_timeout_ms {
        sub.refresh_timeout = Duration::from_millis(timeout);
    }

    if let Some(quiescence) = toml.animation.quiescence_ms {
        config.session.animation.quiescence = Duration::from_millis(quiescence);
    }
    if let Some(threshold) = toml.animation.streaming_threshold {
        config.session.animation.streaming_threshold = threshold;
    }

    if let Some(policy) = toml.reducer.text_buffer {
        config.session.text_buffer = policy;
    }

    if let Some(ref model) = toml.generation.model {
        config.turn.model.clone_from(model);
    }
    if let Some(ref base_url) = toml.generation.base_url {
        config.base_url.clone_from(base_url);
    }
    if let Some(temperature) = toml.generation.temperature {
        config.turn.temperature = temperature;
    }
    if let Some(ref prompt) = toml.generation.system_prompt {
        config.turn.system_prompt.clone_from(prompt);
    }

    if let Some(every) = toml.publisher.progress_every_chunks {
        config.turn.progress_every_chunks = every;
    }

    for (requester, sessions) in &toml.access.grants {
        config
            .grants
            .entry(requester.clone())
            .or_default()
            .extend(sessions.iter().cloned());
    }
}

/// Apply environment variable overrides, reading through `var`
fn apply_env_config(
    config: &mut RelayConfig,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let invalid = |key: &str, value: &str| {
        ConfigError::ValidationError(format!("{key}={value} is not a valid value"))
    };

    if let Some(value) = var("RELAY_TOKEN_TTL_SECS") {
        let secs = value
            .parse::<u64>()
            .map_err(|_| invalid("RELAY_TOKEN_TTL_SECS", &value))?;
        config.tokens.ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = var("RELAY_QUIESCENCE_MS") {
        let ms = value
            .parse::<u64>()
            .map_err(|_| invalid("RELAY_QUIESCENCE_MS", &value))?;
        config.session.animation.quiescence = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = var("RELAY_MODEL") {
        config.turn.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(base_url) = var("RELAY_BASE_URL") {
        config.base_url = base_url;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = var("RELAY_TEXT_BUFFER") {
        config.session.text_buffer = value
            .parse()
            .map_err(|_| invalid("RELAY_TEXT_BUFFER", &value))?;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Model override
    pub model: Option<String>,
    /// Endpoint override
    pub base_url: Option<String>,
    /// Token TTL override (seconds)
    pub ttl_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set endpoint override
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set token TTL override
    #[must_use]
    pub fn with_ttl_secs(mut self, secs: u64) -> Self {
        self.ttl_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the result is invalid.
    pub fn apply(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if self.model.is_some() || self.base_url.is_some() || self.ttl_secs.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref model) = self.model {
            config.turn.model.clone_from(model);
        }
        if let Some(ref base_url) = self.base_url {
            config.base_url.clone_from(base_url);
        }
        if let Some(secs) = self.ttl_secs {
            config.tokens.ttl = Duration::from_secs(secs);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.tokens.ttl, Duration::from_secs(60));
        assert_eq!(config.tokens.refresh_margin, Duration::from_secs(10));
        assert_eq!(config.session.subscription.reconnect.max_attempts, 5);
        assert_eq!(
            config.session.animation.quiescence,
            Duration::from_millis(3000)
        );
        assert_eq!(config.session.animation.streaming_threshold, 50);
        assert_eq!(config.session.text_buffer, TextBufferPolicy::ResetPerTurn);
        assert_eq!(config.turn.model, "gpt-4o-mini");
        assert_eq!(config.turn.progress_every_chunks, 10);
        assert_eq!(config.base_url, "https://api.openai.com/v1");
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[tokens]
ttl_secs = 120
refresh_margin_secs = 20

[subscription]
reconnect_attempts = 2
max_batch = 32

[animation]
quiescence_ms = 1500

[reducer]
text_buffer = "accumulate"

[generation]
model = "local-model"
base_url = "http://localhost:8080/v1"

[publisher]
progress_every_chunks = 4
"#,
        );

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.tokens.ttl, Duration::from_secs(120));
        assert_eq!(
            config.session.subscription.refresh_margin,
            Duration::from_secs(20)
        );
        assert_eq!(config.session.subscription.reconnect.max_attempts, 2);
        assert_eq!(config.session.subscription.max_batch, 32);
        assert_eq!(
            config.session.animation.quiescence,
            Duration::from_millis(1500)
        );
        assert_eq!(config.session.text_buffer, TextBufferPolicy::Accumulate);
        assert_eq!(config.turn.model, "local-model");
        assert_eq!(config.turn.progress_every_chunks, 4);
        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_access_grants_from_file() {
        let file = write_config(
            r#"
[access.grants]
alice = ["abc", "def"]
bob = []
"#,
        );
        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(
            config.grants.get("alice"),
            Some(&vec!["abc".to_string(), "def".to_string()])
        );
        assert_eq!(config.grants.get("bob"), Some(&Vec::new()));
        assert!(RelayConfig::default().grants.is_empty());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/relay/relay.toml"))).unwrap();
        assert_eq!(config.tokens.ttl, Duration::from_secs(60));
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_config("[tokens\nttl_secs = ");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = RelayConfig::default();
        config.tokens.ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.tokens.refresh_margin = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.session.animation.streaming_threshold = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_margin_not_below_ttl_in_file() {
        let file = write_config("[tokens]\nttl_secs = 5\nrefresh_margin_secs = 5\n");
        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        apply_env_config(
            &mut config,
            env(&[
                ("RELAY_TOKEN_TTL_SECS", "30"),
                ("RELAY_QUIESCENCE_MS", "500"),
                ("RELAY_MODEL", "env-model"),
                ("RELAY_TEXT_BUFFER", "accumulate"),
            ]),
        )
        .unwrap();

        assert_eq!(config.tokens.ttl, Duration::from_secs(30));
        assert_eq!(
            config.session.animation.quiescence,
            Duration::from_millis(500)
        );
        assert_eq!(config.turn.model, "env-model");
        assert_eq!(config.session.text_buffer, TextBufferPolicy::Accumulate);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = RelayConfig::default();
        let result = apply_env_config(&mut config, env(&[("RELAY_TOKEN_TTL_SECS", "soon")]));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = apply_env_config(&mut config, env(&[("RELAY_TEXT_BUFFER", "sometimes")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = RelayConfig::default();
        apply_env_config(&mut config, env(&[("RELAY_MODEL", "env-model")])).unwrap();

        ConfigOverrides::new()
            .with_model("cli-model")
            .with_ttl_secs(90)
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.turn.model, "cli-model");
        assert_eq!(config.tokens.ttl, Duration::from_secs(90));
        assert_eq!(config.source(), ConfigSource::Cli);

        let result = ConfigOverrides::new().with_ttl_secs(0).apply(&mut config);
        assert!(result.is_err());
    }
}
