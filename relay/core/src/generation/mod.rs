//! Text Generation
//!
//! Collaborators that produce the streamed answer of a turn.
//!
//! # Available Generators
//!
//! - **OpenAI**: streaming chat completions over HTTP
//! - **Scripted**: fixed fragments, for the demo turn and tests
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::generation::{GenerationRequest, OpenAiGenerator, TextGenerator};
//!
//! let generator = OpenAiGenerator::from_env("https://api.openai.com/v1");
//! generator.ensure_configured()?;
//! let rx = generator.stream(&GenerationRequest::new("Hello!")).await?;
//! ```

mod openai;
mod scripted;
mod traits;

pub use openai::{OpenAiGenerator, API_KEY_ENV, DEFAULT_BASE_URL};
pub use scripted::{ScriptedGenerator, DEMO_FRAGMENTS};
pub use traits::{
    ConfigurationError, GenerationError, GenerationRequest, StreamingToken, TextGenerator,
    DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT,
};
