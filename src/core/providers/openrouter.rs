//! OpenRouter provider implementation

use crate::core::provider::{Provider, ProviderError, TokenStream};
use crate::core::providers::common::{
    build_client, data_payloads, error_from_response, into_token_stream,
};
use crate::core::providers::openai::OpenAIProvider;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::info;

/// OpenRouter provider
pub struct OpenRouterProvider {
    client: Client,
    api_key: String,
    base_url: String,
    site_url: Option<String>,
    app_name: Option<String>,
}

impl OpenRouterProvider {
    /// Create a new OpenRouter provider
    ///
    /// # Arguments
    ///
    /// * `api_key` - OpenRouter API key
    /// * `base_url` - OpenRouter API base URL
    /// * `timeout` - Request timeout in seconds
    /// * `site_url` - Optional site URL for OpenRouter rankings
    /// * `app_name` - Optional application name
    pub fn new(
        api_key: String,
        base_url: String,
        timeout: u64,
        site_url: Option<String>,
        app_name: Option<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            site_url,
            app_name,
        })
    }

    /// Classify OpenRouter errors and provide helpful messages
    fn classify_error(error_detail: &str) -> String {
        let error_lower = error_detail.to_lowercase();

        if error_lower.contains("invalid") && error_lower.contains("api") {
            return "Invalid API key. Please check your OPENROUTER_API_KEY configuration."
                .to_string();
        }

        if error_lower.contains("rate_limit") || error_lower.contains("quota") {
            return "Rate limit exceeded. Please wait and try again.".to_string();
        }

        if error_lower.contains("insufficient") && error_lower.contains("credits") {
            return "Insufficient credits. Please add credits to your OpenRouter account."
                .to_string();
        }

        if error_lower.contains("model")
            && (error_lower.contains("not found") || error_lower.contains("does not exist"))
        {
            return "Model not found. Please check your model configuration.".to_string();
        }

        error_detail.to_string()
    }

    fn chat_request(&self, body: &ChatCompletionRequest) -> RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);

        if let Some(ref site_url) = self.site_url {
            builder = builder.header("HTTP-Referer", site_url);
        }
        if let Some(ref app_name) = self.app_name {
            builder = builder.header("X-Title", app_name);
        }

        builder.json(body)
    }

    async fn send(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, ProviderError> {
        info!(
            "Sending request to OpenRouter: model={}, messages={}, stream={}",
            body.model,
            body.messages.len(),
            body.stream
        );

        let response = self.chat_request(body).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Self::classify_error).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("Failed to parse response: {}", e)))
    }

    async fn create_chat_completion_stream(
        &self,
        mut request: ChatCompletionRequest,
    ) -> Result<TokenStream, ProviderError> {
        request.stream = true;
        let response = self.send(&request).await?;
        Ok(into_token_stream(
            data_payloads(response),
            OpenAIProvider::extract_delta,
        ))
    }

    fn provider_name(&self) -> &str {
        "OpenRouter"
    }
}
