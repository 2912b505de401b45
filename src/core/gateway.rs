//! Provider dispatch with retries
//!
//! The gateway accepts user-facing model names, resolves them through the
//! model registry, picks the configured provider and retries transient
//! failures with exponential backoff.

use crate::core::config::Config;
use crate::core::constants::role;
use crate::core::model_registry::{ModelRegistry, ResolvedModel};
use crate::core::provider::{Provider, ProviderError, ProviderKind, TokenStream};
use crate::core::providers::{GeminiProvider, OpenAIProvider, OpenRouterProvider};
use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ContentPart, ImageGenerationRequest,
    ImageGenerationResponse, ImageUrl, MessageContent, SpeechRequest,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Base delay between retries, doubled on every attempt
const RETRY_BASE_DELAY_MS: u64 = 250;

/// Dispatches model calls to the provider that serves each model
pub struct LlmGateway {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    registry: Arc<ModelRegistry>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl LlmGateway {
    /// Create a gateway with an explicit provider set
    pub fn new(registry: Arc<ModelRegistry>, max_retries: u32) -> Self {
        Self {
            providers: HashMap::new(),
            registry,
            max_retries,
            retry_base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        }
    }

    /// Build every provider the configuration has credentials for
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let registry = Arc::new(ModelRegistry::new(&config.models));
        let mut gateway = Self::new(registry, config.max_retries);

        gateway = gateway.with_provider(
            ProviderKind::OpenAI,
            Arc::new(OpenAIProvider::new(
                config.openai_api_key.clone(),
                config.openai_base_url.clone(),
                config.request_timeout,
            )?),
        );

        if let Some(ref key) = config.gemini_api_key {
            gateway = gateway.with_provider(
                ProviderKind::Gemini,
                Arc::new(GeminiProvider::new(
                    key.clone(),
                    config.gemini_base_url.clone(),
                    config.request_timeout,
                )?),
            );
        }

        if let Some(ref key) = config.openrouter_api_key {
            gateway = gateway.with_provider(
                ProviderKind::OpenRouter,
                Arc::new(OpenRouterProvider::new(
                    key.clone(),
                    config.openrouter_base_url.clone(),
                    config.request_timeout,
                    config.openrouter_site_url.clone(),
                    config.openrouter_app_name.clone(),
                )?),
            );
        }

        if let Some(ref base_url) = config.ollama_base_url {
            gateway = gateway.with_provider(
                ProviderKind::Ollama,
                Arc::new(OpenAIProvider::ollama(
                    base_url.clone(),
                    config.request_timeout,
                )?),
            );
        }

        Ok(gateway)
    }

    pub fn with_provider(mut self, kind: ProviderKind, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Configured providers, sorted by name
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .values()
            .map(|p| p.provider_name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn supports_vision(&self, model: &str) -> bool {
        self.registry.supports_vision(model)
    }

    fn provider_for(
        &self,
        model: &str,
    ) -> Result<(Arc<dyn Provider>, ResolvedModel), ProviderError> {
        let resolved = self.registry.resolve(model);
        let provider = self
            .providers
            .get(&resolved.kind)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(resolved.kind.to_string()))?;
        Ok((provider, resolved))
    }

    /// Run `op`, retrying retryable failures up to `max_retries` more times
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt);
                    attempt += 1;
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what, e, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn chat_request(
        resolved: &ResolvedModel,
        messages: Vec<ChatMessage>,
        temperature: Option<f32>,
    ) -> ChatCompletionRequest {
        let mut request = ChatCompletionRequest::new(resolved.upstream_model.clone(), messages);
        request.temperature = temperature;
        request
    }

    /// Non-streaming chat completion
    pub async fn chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: Option<f32>,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        info!(
            "Dispatching chat: model={} -> {} ({})",
            model,
            resolved.upstream_model,
            provider.provider_name()
        );
        let request = Self::chat_request(&resolved, messages, temperature);
        self.with_retries("chat completion", || provider.create_chat_completion(&request))
            .await
    }

    /// Streaming chat completion
    ///
    /// Only establishing the stream is retried; a stream that fails midway
    /// surfaces the error to the caller.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: Option<f32>,
    ) -> Result<TokenStream, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        info!(
            "Dispatching streaming chat: model={} -> {} ({})",
            model,
            resolved.upstream_model,
            provider.provider_name()
        );
        let request = Self::chat_request(&resolved, messages, temperature);
        self.with_retries("streaming chat completion", || {
            provider.create_chat_completion_stream(request.clone())
        })
        .await
    }

    /// Describe an image given by URL or data URL
    pub async fn vision(
        &self,
        model: &str,
        prompt: &str,
        image_url: &str,
        temperature: Option<f32>,
    ) -> Result<String, ProviderError> {
        let message = ChatMessage::new(
            role::USER,
            MessageContent::Parts(vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.to_string(),
                    },
                },
            ]),
        );
        let response = self.chat(model, vec![message], temperature).await?;
        Ok(response.first_content())
    }

    pub async fn generate_image(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<ImageGenerationResponse, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        let request = ImageGenerationRequest {
            model: resolved.upstream_model,
            prompt: prompt.to_string(),
            n: Some(1),
            size: None,
        };
        self.with_retries("image generation", || provider.create_image(&request))
            .await
    }

    pub async fn speak(
        &self,
        model: &str,
        voice: &str,
        input: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        let request = SpeechRequest {
            model: resolved.upstream_model,
            input: input.to_string(),
            voice: voice.to_string(),
            response_format: Some("mp3".to_string()),
        };
        self.with_retries("speech synthesis", || provider.create_speech(&request))
            .await
    }

    pub async fn transcribe(
        &self,
        model: &str,
        file_name: &str,
        audio: Vec<u8>,
    ) -> Result<String, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        self.with_retries("transcription", || {
            provider.create_transcription(file_name, audio.clone(), &resolved.upstream_model)
        })
        .await
    }

    pub async fn embed(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let (provider, resolved) = self.provider_for(model)?;
        self.with_retries("embeddings", || {
            provider.create_embeddings(&resolved.upstream_model, inputs)
        })
        .await
    }
}
