//! Provider implementations

pub mod common;
pub mod gemini;
pub mod openai;
pub mod openrouter;

pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;
pub use openrouter::OpenRouterProvider;
