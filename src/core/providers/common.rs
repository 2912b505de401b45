//! Helpers shared by the HTTP providers
//!
//! Server-sent event decoding for streaming completions and conversion of
//! failed upstream responses into `ProviderError`s.

use crate::core::provider::{ProviderError, TokenStream};
use futures::StreamExt;
use futures::TryStreamExt;
use futures::stream::Stream;
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tracing::warn;

/// Extracts the text delta from one SSE `data:` payload
pub type DeltaExtractor = fn(&str) -> Result<Option<String>, serde_json::Error>;

/// Build the HTTP client used by a provider
pub fn build_client(timeout: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .map_err(|e| ProviderError::Unexpected(format!("Failed to create HTTP client: {}", e)))
}

/// Payload of an SSE `data:` line, `None` for comments, blanks and other fields
pub fn parse_data_line(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    let payload = trimmed.strip_prefix("data:")?;
    let payload = payload.trim_start();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

/// Split a streaming response body into SSE `data:` payloads, ending at `[DONE]`
pub fn data_payloads(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>> {
    let byte_stream = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

    let reader = tokio_util::io::StreamReader::new(byte_stream);
    let lines = LinesStream::new(tokio::io::BufReader::new(reader).lines());

    let stream = async_stream::stream! {
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(payload) = parse_data_line(&line) {
                        if payload == "[DONE]" {
                            break;
                        }
                        yield Ok(payload.to_string());
                    }
                }
                Err(e) => {
                    yield Err(ProviderError::Unexpected(e.to_string()));
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}

/// Turn a stream of SSE payloads into a stream of non-empty text deltas
///
/// Payloads that fail to parse are logged and skipped; transport errors are
/// passed through.
pub fn into_token_stream<S>(payloads: S, extract: DeltaExtractor) -> TokenStream
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    let stream = payloads.filter_map(move |item| async move {
        match item {
            Ok(payload) => match extract(&payload) {
                Ok(Some(text)) if !text.is_empty() => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => {
                    warn!("Failed to parse chunk: {}, error: {}", payload, e);
                    None
                }
            },
            Err(e) => Some(Err(e)),
        }
    });

    Box::pin(stream)
}

/// Convert a non-success response into a classified `ProviderError`
pub async fn error_from_response(
    response: reqwest::Response,
    classify: fn(&str) -> String,
) -> ProviderError {
    let status = response.status().as_u16();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    ProviderError::from_status(status, classify(&error_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn echo(payload: &str) -> Result<Option<String>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        Ok(value.get("t").and_then(|t| t.as_str()).map(String::from))
    }

    #[test]
    fn test_parse_data_line() {
        assert_eq!(parse_data_line("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_data_line("data:[DONE]"), Some("[DONE]"));
        assert_eq!(parse_data_line(": keep-alive"), None);
        assert_eq!(parse_data_line("event: message"), None);
        assert_eq!(parse_data_line("data: "), None);
        assert_eq!(parse_data_line(""), None);
    }

    #[tokio::test]
    async fn test_token_stream_skips_empty_and_malformed() {
        let payloads = stream::iter(vec![
            Ok(r#"{"t":"Hel"}"#.to_string()),
            Ok("not json".to_string()),
            Ok(r#"{"t":""}"#.to_string()),
            Ok(r#"{"other":1}"#.to_string()),
            Ok(r#"{"t":"lo"}"#.to_string()),
        ]);
        let tokens: Vec<String> = into_token_stream(payloads, echo)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_token_stream_passes_errors_through() {
        let payloads = stream::iter(vec![
            Ok(r#"{"t":"a"}"#.to_string()),
            Err(ProviderError::Unexpected("connection reset".to_string())),
        ]);
        let items: Vec<_> = into_token_stream(payloads, echo).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
