//! Text Generation Traits
//!
//! The text-generation collaborator as seen by the producer workflow: a lazy,
//! finite sequence of fragments ending in an explicit completion signal.
//!
//! # Design Philosophy
//!
//! The workflow checks [`TextGenerator::ensure_configured`] before it
//! publishes anything, so a missing credential is reported up front rather
//! than in the middle of a turn. Everything that goes wrong after that is a
//! [`GenerationError`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default system prompt for chat turns
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, friendly AI assistant. Provide thoughtful, clear, and concise responses.";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Token stream events from a generator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A fragment of the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// Missing or unusable setup for the generator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A required credential is not set
    #[error("{provider} API key not configured (set {env_var})")]
    MissingCredential {
        /// Provider name
        provider: &'static str,
        /// Environment variable that should hold it
        env_var: &'static str,
    },

    /// Endpoint URL cannot be used
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Failures while generating
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Generator is not configured
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Request could not be sent
    #[error("request failed: {0}")]
    Request(String),

    /// Provider answered with an error status
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Stream broke mid-response
    #[error("stream failed: {0}")]
    Stream(String),

    /// Stream ended without producing anything
    #[error("generation ended without output")]
    Empty,
}

/// One generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    /// User input
    pub prompt: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature (0.0-2.0)
    pub temperature: f32,
    /// System prompt
    pub system: Option<String>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            system: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

impl GenerationRequest {
    /// Create a request with the default model and system prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Text generation collaborator
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generator name for logs
    fn name(&self) -> &str;

    /// Check credentials and settings without contacting the provider
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`] found.
    fn ensure_configured(&self) -> Result<(), ConfigurationError>;

    /// Start generating
    ///
    /// The receiver yields [`StreamingToken::Token`]s and ends with exactly
    /// one [`StreamingToken::Complete`] or [`StreamingToken::Error`].
    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("Hello")
            .with_model("small")
            .with_temperature(5.0)
            .with_system("Be brief");

        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.model, "small");
        assert!((request.temperature - 2.0).abs() < f32::EPSILON);
        assert_eq!(request.system.as_deref(), Some("Be brief"));
    }

    #[test]
    fn test_request_defaults() {
        let request = GenerationRequest::new("Hi");
        assert_eq!(request.model, "gpt-4o-mini");
        assert!((request.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(request.system.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn test_missing_credential_message() {
        let err = ConfigurationError::MissingCredential {
            provider: "OpenAI",
            env_var: "OPENAI_API_KEY",
        };
        assert_eq!(
            err.to_string(),
            "OpenAI API key not configured (set OPENAI_API_KEY)"
        );
    }
}
