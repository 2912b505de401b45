//! Gemini provider implementation
//!
//! Talks to the Google Generative Language API and converts between the
//! OpenAI-style chat format used across the service and Gemini `contents`.

use crate::core::constants::role;
use crate::core::provider::{Provider, ProviderError, TokenStream};
use crate::core::providers::common::{
    build_client, data_payloads, error_from_response, into_token_stream,
};
use crate::models::openai::{
    ChatCompletionRequest, ChatCompletionResponse, Choice, ContentPart,
    MessageContent, ResponseMessage, Usage,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest remote image fetched for inline upload
const MAX_REMOTE_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

fn check_image_size(url: &str, length: u64) -> Result<(), ProviderError> {
    if length > MAX_REMOTE_IMAGE_BYTES {
        return Err(ProviderError::BadRequest(format!(
            "Image {} is too large ({} bytes, limit {})",
            url, length, MAX_REMOTE_IMAGE_BYTES
        )));
    }
    Ok(())
}

/// Gemini provider for Google's generative models
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<GeminiInlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl GeminiCandidate {
    fn text(&self) -> String {
        self.content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

/// Split a `data:<mime>;base64,<payload>` URL into its MIME type and payload
pub(crate) fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    Some((mime.to_string(), data.to_string()))
}

impl GeminiProvider {
    /// Create a new Gemini provider
    ///
    /// # Arguments
    ///
    /// * `api_key` - Gemini API key
    /// * `base_url` - Generative Language API base URL
    /// * `timeout` - Request timeout in seconds
    pub fn new(api_key: String, base_url: String, timeout: u64) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the endpoint URL for the model
    fn endpoint_url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.base_url, model)
        }
    }

    /// Classify Gemini errors
    fn classify_error(error_detail: &str) -> String {
        let error_lower = error_detail.to_lowercase();

        if error_lower.contains("api_key_invalid") || error_lower.contains("api key not valid") {
            return "Invalid API key. Please check your GEMINI_API_KEY configuration.".to_string();
        }

        if error_lower.contains("resource_exhausted") || error_lower.contains("quota") {
            return "Rate limit or quota exceeded. Please check your Gemini quota.".to_string();
        }

        if error_lower.contains("not found") && error_lower.contains("model") {
            return "Model not found or not available for your API key.".to_string();
        }

        if error_lower.contains("permission") {
            return "Permission denied. Please check your Gemini API access.".to_string();
        }

        error_detail.to_string()
    }

    /// Resolve an image URL into inline data, fetching remote images
    async fn inline_image(&self, url: &str) -> Result<GeminiInlineData, ProviderError> {
        if let Some((mime_type, data)) = parse_data_url(url) {
            return Ok(GeminiInlineData { mime_type, data });
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::BadRequest(format!(
                "Failed to fetch image {} (status {})",
                url,
                response.status().as_u16()
            )));
        }

        if let Some(length) = response.content_length() {
            check_image_size(url, length)?;
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| "image/jpeg".to_string());

        // Content-Length may be missing or wrong, so count while reading
        let mut response = response;
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            bytes.extend_from_slice(&chunk);
            check_image_size(url, bytes.len() as u64)?;
        }
        debug!("Fetched {} bytes of image data from {}", bytes.len(), url);

        Ok(GeminiInlineData {
            mime_type,
            data: STANDARD.encode(&bytes),
        })
    }

    async fn convert_parts(&self, content: &MessageContent) -> Result<Vec<GeminiPart>, ProviderError> {
        match content {
            MessageContent::Text(text) => Ok(vec![GeminiPart {
                text: Some(text.clone()),
                inline_data: None,
            }]),
            MessageContent::Parts(parts) => {
                let mut converted = Vec::with_capacity(parts.len());
                for part in parts {
                    converted.push(match part {
                        ContentPart::Text { text } => GeminiPart {
                            text: Some(text.clone()),
                            inline_data: None,
                        },
                        ContentPart::ImageUrl { image_url } => GeminiPart {
                            text: None,
                            inline_data: Some(self.inline_image(&image_url.url).await?),
                        },
                    });
                }
                Ok(converted)
            }
        }
    }

    /// Convert an OpenAI-style request to Gemini format
    ///
    /// System messages become the system instruction, assistant turns are
    /// sent with the `model` role.
    async fn convert_request(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<GeminiRequest, ProviderError> {
        let mut contents = Vec::new();
        let mut system_texts = Vec::new();

        for msg in &request.messages {
            if msg.role == role::SYSTEM {
                let text = msg.content.text();
                if !text.trim().is_empty() {
                    system_texts.push(text);
                }
                continue;
            }

            let gemini_role = if msg.role == role::ASSISTANT {
                "model"
            } else {
                "user"
            };
            contents.push(GeminiContent {
                role: Some(gemini_role.to_string()),
                parts: self.convert_parts(&msg.content).await?,
            });
        }

        let system_instruction = (!system_texts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: Some(system_texts.join("\n\n")),
                inline_data: None,
            }],
        });

        Ok(GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
            }),
        })
    }

    /// Convert a Gemini response to OpenAI format
    fn convert_response(response: GeminiResponse, model: &str) -> ChatCompletionResponse {
        let (content, finish_reason) = match response.candidates.first() {
            Some(candidate) => {
                let finish_reason = match candidate.finish_reason.as_deref() {
                    Some("MAX_TOKENS") => "length",
                    Some("SAFETY") | Some("RECITATION") => "content_filter",
                    _ => "stop",
                };
                (candidate.text(), finish_reason)
            }
            None => (String::new(), "stop"),
        };

        let usage = response.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        });

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: role::ASSISTANT.to_string(),
                    content: Some(content),
                },
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage,
        }
    }

    /// Extract the text of one streamed `GenerateContentResponse`
    fn extract_delta(payload: &str) -> Result<Option<String>, serde_json::Error> {
        let response: GeminiResponse = serde_json::from_str(payload)?;
        Ok(response.candidates.first().map(GeminiCandidate::text))
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = self.convert_request(request).await?;
        debug!(
            "Sending request to Gemini: model={}, contents={}, stream={}",
            request.model,
            body.contents.len(),
            stream
        );

        let response = self
            .client
            .post(self.endpoint_url(&request.model, stream))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, Self::classify_error).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let response = self.send(request, false).await?;
        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Unexpected(format!("Failed to parse response: {}", e)))?;

        Ok(Self::convert_response(gemini_response, &request.model))
    }

    async fn create_chat_completion_stream(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<TokenStream, ProviderError> {
        let response = self.send(&request, true).await?;
        Ok(into_token_stream(data_payloads(response), Self::extract_delta))
    }

    fn provider_name(&self) -> &str {
        "Gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::{ChatMessage, ImageUrl};

    fn sample_messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new(role::SYSTEM, "Be brief."),
            ChatMessage::new(role::USER, "Hi"),
            ChatMessage::new(role::ASSISTANT, "Hello!"),
            ChatMessage::new(role::USER, "What is Rust?"),
        ]
    }

    fn provider() -> GeminiProvider {
        GeminiProvider::new(
            "gm-key".to_string(),
            "https://generativelanguage.googleapis.com/v1beta/".to_string(),
            5,
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_url() {
        let p = provider();
        assert_eq!(
            p.endpoint_url("gemini-1.5-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert!(
            p.endpoint_url("gemini-1.5-pro", true)
                .ends_with(":streamGenerateContent?alt=sse")
        );
    }

    #[test]
    fn test_parse_data_url() {
        assert_eq!(
            parse_data_url("data:image/png;base64,AAAA"),
            Some(("image/png".to_string(), "AAAA".to_string()))
        );
        assert_eq!(parse_data_url("https://example.com/a.png"), None);
        assert_eq!(parse_data_url("data:text/plain,hello"), None);
    }

    #[tokio::test]
    async fn test_convert_request_roles_and_system() {
        let mut request = ChatCompletionRequest::new("gemini-1.5-pro", sample_messages());
        request.temperature = Some(0.3);
        let converted = provider().convert_request(&request).await.unwrap();

        let system = converted.system_instruction.unwrap();
        assert_eq!(system.parts[0].text.as_deref(), Some("Be brief."));
        let roles: Vec<_> = converted
            .contents
            .iter()
            .map(|c| c.role.clone().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(converted.generation_config.unwrap().temperature, Some(0.3));
    }

    #[tokio::test]
    async fn test_convert_inline_image() {
        let request = ChatCompletionRequest::new(
            "gemini-1.5-flash",
            vec![ChatMessage::new(
                role::USER,
                MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "What is in this image?".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/jpeg;base64,/9j/4AAQ".to_string(),
                        },
                    },
                ]),
            )],
        );
        let converted = provider().convert_request(&request).await.unwrap();
        let parts = &converted.contents[0].parts;
        assert_eq!(parts.len(), 2);
        let inline = parts[1].inline_data.as_ref().unwrap();
        assert_eq!(inline.mime_type, "image/jpeg");
        assert_eq!(inline.data, "/9j/4AAQ");

        let json = serde_json::to_value(&converted).unwrap();
        assert!(json["contents"][0]["parts"][1]["inlineData"]["mimeType"].is_string());
    }

    #[tokio::test]
    async fn test_oversized_remote_image_is_rejected() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\n\r\n",
                MAX_REMOTE_IMAGE_BYTES + 1
            );
            let _ = socket.write_all(head.as_bytes()).await;
        });

        let err = provider()
            .inline_image(&format!("http://{}/huge.png", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::BadRequest(m) if m.contains("too large")));
    }

    #[test]
    fn test_image_size_limit() {
        assert!(check_image_size("https://example.com/a.png", 1024).is_ok());
        assert!(check_image_size("https://example.com/a.png", MAX_REMOTE_IMAGE_BYTES).is_ok());
        assert!(check_image_size("https://example.com/a.png", MAX_REMOTE_IMAGE_BYTES + 1).is_err());
    }

    #[test]
    fn test_convert_response() {
        let raw = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Rust is "}, {"text": "a language."}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 5, "totalTokenCount": 9}
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        let converted = GeminiProvider::convert_response(response, "gemini-1.5-pro");
        assert_eq!(converted.first_content(), "Rust is a language.");
        assert_eq!(converted.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(converted.usage.unwrap().total_tokens, 9);
    }

    #[test]
    fn test_extract_stream_delta() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]}}]}"#;
        assert_eq!(
            GeminiProvider::extract_delta(payload).unwrap().as_deref(),
            Some("Hi")
        );
    }
}
