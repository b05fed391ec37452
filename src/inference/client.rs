use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use super::types::{ChatMessage, ChatRequest, ChatResponse, Completion, CompletionRequest};
use super::InferenceBackend;
use crate::config::{InferenceConfig, RequestConfig};
use crate::error::{InferenceError, InferenceResult};

/// System message sent ahead of every prompt.
const SYSTEM_PROMPT: &str =
    "You are an expert in chemical accident emergency response. Answer with valid JSON only.";

/// Client for an OpenAI-compatible chat-completions endpoint.
///
/// Performs exactly one HTTP request per call. Retries, backoff and
/// concurrency limits live in [`super::InferenceAdapter`].
#[derive(Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout_ms: u64,
}

impl ChatCompletionsClient {
    /// Create a new client
    pub fn new(config: &InferenceConfig, request_config: &RequestConfig) -> InferenceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(|e| InferenceError::Transport {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        let mut chat = ChatRequest::new(
            &self.model,
            vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(&request.prompt),
            ],
        )
        .with_options(&request.options);
        chat.temperature = chat.temperature.or(Some(self.temperature));
        chat.max_tokens = chat.max_tokens.or(Some(self.max_tokens));
        chat
    }

    /// Send one chat-completions request
    pub async fn chat(&self, request: &ChatRequest) -> InferenceResult<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completions"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    InferenceError::from(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let retry_after_ms = parse_retry_after(response.headers());
            let error_body = response.text().await.unwrap_or_default();
            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                InferenceError::RateLimited {
                    message: error_body,
                    retry_after_ms,
                }
            } else {
                InferenceError::Api {
                    status: status.as_u16(),
                    message: error_body,
                }
            });
        }

        response
            .json()
            .await
            .map_err(|e| InferenceError::ResponseFormat {
                message: format!("Failed to parse response: {}", e),
            })
    }
}

#[async_trait]
impl InferenceBackend for ChatCompletionsClient {
    async fn complete(&self, request: &CompletionRequest) -> InferenceResult<Completion> {
        let start = Instant::now();
        let response = self.chat(&self.build_request(request)).await?;

        let text = response
            .first_content()
            .ok_or_else(|| InferenceError::ResponseFormat {
                message: "Response contained no choices".to_string(),
            })?
            .to_string();

        info!(
            model = response.model.as_deref().unwrap_or(&self.model),
            latency_ms = start.elapsed().as_millis(),
            completion_tokens = response.usage.map(|u| u.completion_tokens),
            "Chat completion succeeded"
        );

        Ok(Completion {
            text,
            usage: response.usage,
        })
    }
}

/// `Retry-After` in milliseconds. Only the delta-seconds form is honoured.
fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::CompletionOptions;
    use reqwest::header::HeaderValue;

    fn config() -> InferenceConfig {
        InferenceConfig {
            api_key: "test_key".to_string(),
            base_url: "https://api.deepseek.com/v1/".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            prompt_token_cost: 0.0,
            response_token_cost: 0.0,
        }
    }

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = ChatCompletionsClient::new(&config(), &RequestConfig::default()).unwrap();
        assert_eq!(client.base_url(), "https://api.deepseek.com/v1");
    }

    #[test]
    fn test_build_request_applies_defaults_and_overrides() {
        let client = ChatCompletionsClient::new(&config(), &RequestConfig::default()).unwrap();

        let req = client.build_request(&CompletionRequest::new(
            "prompt",
            CompletionOptions::default(),
        ));
        assert_eq!(req.temperature, Some(0.7));
        assert_eq!(req.max_tokens, Some(4096));
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[1].content, "prompt");

        let req = client.build_request(&CompletionRequest::new(
            "prompt",
            CompletionOptions::default().with_temperature(0.1),
        ));
        assert_eq!(req.temperature, Some(0.1));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(parse_retry_after(&headers), Some(2000));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(500));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }
}
