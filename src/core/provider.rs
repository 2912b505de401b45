//! Provider abstraction layer for LLM APIs
//!
//! This module defines the common trait implemented by every provider
//! (OpenAI, Gemini, OpenRouter, Ollama) and the error taxonomy they share.

use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ImageGenerationRequest,
    ImageGenerationResponse, SpeechRequest,
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::fmt;
use std::pin::Pin;
use thiserror::Error;

/// Stream of text deltas produced by a streaming chat completion
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Error types for provider operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Operation not supported by provider: {0}")]
    Unsupported(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ProviderError {
    /// Map an upstream HTTP status and classified message to an error
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => ProviderError::Authentication(message),
            429 => ProviderError::RateLimit(message),
            400 | 404 | 422 => ProviderError::BadRequest(message),
            _ => ProviderError::ApiError { status, message },
        }
    }

    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimit(_) | ProviderError::Unexpected(_) => true,
            ProviderError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Short name of the error variant, shown to chat users
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Authentication(_) => "AuthenticationError",
            ProviderError::RateLimit(_) => "RateLimitError",
            ProviderError::BadRequest(_) => "BadRequestError",
            ProviderError::ApiError { .. } => "APIError",
            ProviderError::NotConfigured(_) => "NotConfiguredError",
            ProviderError::Unsupported(_) => "UnsupportedError",
            ProviderError::Unexpected(_) => "UnexpectedError",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Unexpected(err.to_string())
    }
}

/// Trait for LLM API providers
///
/// Chat completion is mandatory; media and embedding operations default to
/// `Unsupported` so providers only implement what their API offers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send non-streaming chat completion request
    async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError>;

    /// Send streaming chat completion request, yielding text deltas
    async fn create_chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<TokenStream, ProviderError>;

    async fn create_image(
        &self,
        _request: &ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse, ProviderError> {
        Err(ProviderError::Unsupported("image generation".to_string()))
    }

    /// Synthesize speech, returning the encoded audio
    async fn create_speech(&self, _request: &SpeechRequest) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Unsupported("text-to-speech".to_string()))
    }

    async fn create_transcription(
        &self,
        _file_name: &str,
        _audio: Vec<u8>,
        _model: &str,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported("transcription".to_string()))
    }

    async fn create_embeddings(
        &self,
        _model: &str,
        _inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Unsupported("embeddings".to_string()))
    }

    /// Get the provider name
    fn provider_name(&self) -> &str;
}

/// Supported provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    /// Recognise a model prefix such as `gemini` in `gemini/gemini-1.5-pro`
    pub fn from_prefix(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAI),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "ollama" | "ollama_chat" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(matches!(
            ProviderError::from_status(401, "x".into()),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "x".into()),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "x".into()),
            ProviderError::ApiError { status: 503, .. }
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(ProviderError::RateLimit("slow down".into()).is_retryable());
        assert!(ProviderError::ApiError { status: 502, message: String::new() }.is_retryable());
        assert!(!ProviderError::ApiError { status: 418, message: String::new() }.is_retryable());
        assert!(!ProviderError::Authentication("bad key".into()).is_retryable());
        assert!(!ProviderError::NotConfigured("gemini".into()).is_retryable());
    }

    #[test]
    fn test_prefix() {
        assert_eq!(ProviderKind::from_prefix("Gemini"), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::from_prefix("ollama"), Some(ProviderKind::Ollama));
        assert_eq!(ProviderKind::from_prefix("anthropic"), None);
        assert_eq!(ProviderKind::OpenRouter.to_string(), "openrouter");
    }
}
