//! OpenAI provider implementation
//!
//! Also serves any OpenAI-compatible endpoint that needs no key, such as a
//! local Ollama server.

use crate::core::provider::{Provider, ProviderError, TokenStream};
use crate::core::providers::common::{
    build_client, data_payloads, error_from_response, into_token_stream,
};
use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
    ImageGenerationRequest, ImageGenerationResponse, SpeechRequest, StreamOptions,
    StreamingChunk, TranscriptionResponse,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

/// OpenAI provider (OpenAI cloud or an OpenAI-compatible local server)
pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    name: &'static str,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider
    ///
    /// # Arguments
    ///
    /// * `api_key` - OpenAI API key
    /// * `base_url` - OpenAI API base URL
    /// * `timeout` - Request timeout in seconds
    pub fn new(api_key: String, base_url: String, timeout: u64) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key: Some(api_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            name: "OpenAI",
        })
    }

    /// Create a provider for a local Ollama server's OpenAI-compatible API
    pub fn ollama(base_url: String, timeout: u64) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key: None,
            base_url: base_url.trim_end_matches('/').to_string(),
            name: "Ollama",
        })
    }

    /// Classify OpenAI errors and provide helpful messages
    fn classify_error(error_detail: &str) -> String {
        let error_lower = error_detail.to_lowercase();

        if error_lower.contains("unsupported_country_region_territory")
            || error_lower.contains("country, region, or territory not supported")
        {
            return "OpenAI API is not available in your region.".to_string();
        }

        if error_lower.contains("invalid_api_key") || error_lower.contains("unauthorized") {
            return "Invalid API key. Please check your OPENAI_API_KEY configuration.".to_string();
        }

        if error_lower.contains("rate_limit") || error_lower.contains("quota") {
            return "Rate limit exceeded. Please wait and try again, or upgrade your API plan."
                .to_string();
        }

        if error_lower.contains("model")
            && (error_lower.contains("not found") || error_lower.contains("does not exist"))
        {
            return "Model not found. Please check your model configuration.".to_string();
        }

        if error_lower.contains("content_policy_violation") {
            return "The request was rejected by the content policy. Please rephrase your prompt."
                .to_string();
        }

        if error_lower.contains("billing") || error_lower.contains("payment") {
            return "Billing issue. Please check your OpenAI account billing status.".to_string();
        }

        error_detail.to_string()
    }

    /// Extract the text delta of an OpenAI streaming chunk
    pub(crate) fn extract_delta(payload: &str) -> Result<Option<String>, serde_json::Error> {
        let chunk: StreamingChunk = serde_json::from_str(payload)?;
        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Self::classify_error).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        debug!(
            "Sending request to {}: model={}, messages={}",
            self.name,
            request.model,
            request.messages.len()
        );

        let response = self.send(self.post("/chat/completions").json(request)).await?;
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
        if request.stream_options.is_none() && self.api_key.is_some() {
            request.stream_options = Some(StreamOptions {
                include_usage: true,
            });
        }

        debug!(
            "Streaming from {}: model={}, messages={}",
            self.name,
            request.model,
            request.messages.len()
        );

        let response = self.send(self.post("/chat/completions").json(&request)).await?;
        Ok(into_token_stream(data_payloads(response), Self::extract_delta))
    }

    async fn create_image(
        &self,
        request: &ImageGenerationRequest,
    ) -> Result<ImageGenerationResponse, ProviderError> {
        let response = self.send(self.post("/images/generations").json(request)).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("Failed to parse response: {}", e)))
    }

    async fn create_speech(&self, request: &SpeechRequest) -> Result<Vec<u8>, ProviderError> {
        let response = self.send(self.post("/audio/speech").json(request)).await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn create_transcription(
        &self,
        file_name: &str,
        audio: Vec<u8>,
        model: &str,
    ) -> Result<String, ProviderError> {
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", model.to_string())
            .part("file", part);

        let response = self
            .send(self.post("/audio/transcriptions").multipart(form))
            .await?;
        let transcription: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("Failed to parse response: {}", e)))?;
        Ok(transcription.text)
    }

    async fn create_embeddings(
        &self,
        model: &str,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = EmbeddingRequest {
            model: model.to_string(),
            input: inputs.to_vec(),
        };
        let response = self.send(self.post("/embeddings").json(&request)).await?;
        let mut embeddings: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("Failed to parse response: {}", e)))?;

        embeddings.data.sort_by_key(|d| d.index);
        if embeddings.data.len() != inputs.len() {
            return Err(ProviderError::Unexpected(format!(
                "Expected {} embeddings, got {}",
                inputs.len(),
                embeddings.data.len()
            )));
        }
        Ok(embeddings.data.into_iter().map(|d| d.embedding).collect())
    }

    fn provider_name(&self) -> &str {
        self.name
    }
}
