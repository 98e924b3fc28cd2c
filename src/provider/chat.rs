//! OpenAI-compatible chat/completions client used as the generative provider.
//! Connection pooling via reqwest, a min-interval rate limiter, and bounded
//! retries for 429/5xx. Callers wrap each call in their own timeout; dropping
//! the future aborts the request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{classify_status, classify_transport, CompletionRequest, GenerativeProvider};
use crate::config::GenerativeEndpoint;
use crate::error::ProviderError;

const MAX_429_RETRIES: u32 = 2;
const MAX_5XX_RETRIES: u32 = 1;

/// Chat/completions client (DeepSeek, OpenAI and compatible gateways).
pub struct ChatCompletionsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    vision_model: String,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    /// Minimum interval between requests (e.g. 100ms = 10 req/s).
    min_interval: Duration,
}

impl ChatCompletionsClient {
    /// Build a client from config. The API key is read from the environment
    /// variable named by `endpoint.api_key_env`.
    pub fn from_endpoint(endpoint: &GenerativeEndpoint) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&endpoint.api_key_env).map_err(|_| {
            let name = &endpoint.api_key_env;
            ProviderError::Unavailable(format!("{name} environment variable not set"))
        })?;
        Self::new(endpoint, api_key)
    }

    pub fn new(endpoint: &GenerativeEndpoint, api_key: String) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_millis(endpoint.request_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            model: endpoint.model.clone(),
            vision_model: endpoint
                .vision_model
                .clone()
                .unwrap_or_else(|| endpoint.model.clone()),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(endpoint.min_interval_ms),
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    async fn chat(&self, body: serde_json::Value) -> Result<String, ProviderError> {
        self.rate_limit_wait().await;
        let start = Instant::now();
        let response = self.send_with_retry(&body).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                total_tokens = usage.total_tokens,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "chat completion done"
            );
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("completion has no content".into()))
    }

    /// Send request with retry logic.
    /// 429: Retry-After or 1s/2s (max 2).
    /// 5xx: exponential backoff (max 1).
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt: u32 = 0;

        loop {
            let result = self
                .http
                .post(format!("{}/v1/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => return Err(classify_transport(&e)),
            };
            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);

            let wait = if status.as_u16() == 429 && attempt < MAX_429_RETRIES {
                retry_after.unwrap_or_else(|| Duration::from_secs(1 << attempt))
            } else if status.is_server_error() && attempt < MAX_5XX_RETRIES {
                Duration::from_millis(500 * (1 << attempt))
            } else {
                let retry_after_ms = retry_after.map(|d| d.as_millis() as u64).unwrap_or(0);
                let body_text = resp.text().await.unwrap_or_default();
                warn!(
                    status = status.as_u16(),
                    body = %body_text.chars().take(200).collect::<String>(),
                    "chat completion failed"
                );
                return Err(classify_status(status, retry_after_ms));
            };

            warn!(
                attempt,
                status = status.as_u16(),
                wait_ms = wait.as_millis() as u64,
                "retryable status, backing off"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl GenerativeProvider for ChatCompletionsClient {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.chat(completion_body(&self.model, request)).await
    }

    async fn describe_image(
        &self,
        image: &[u8],
        media_type: &str,
        instruction: &str,
    ) -> Result<String, ProviderError> {
        if image.is_empty() {
            return Err(ProviderError::MalformedResponse("empty image payload".into()));
        }
        self.chat(vision_body(&self.vision_model, image, media_type, instruction))
            .await
    }
}

fn completion_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let mut body = json!({
        "model": model,
        "messages": [
            {"role": "system", "content": request.system},
            {"role": "user", "content": request.prompt}
        ],
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "stream": false,
        "response_format": {"type": "json_object"}
    });
    if let Some(seed) = request.seed {
        body["seed"] = json!(seed);
    }
    body
}

fn vision_body(
    model: &str,
    image: &[u8],
    media_type: &str,
    instruction: &str,
) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    let url = format!("data:{media_type};base64,{encoded}");
    json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": instruction},
                {"type": "image_url", "image_url": {"url": url}}
            ]
        }],
        "max_tokens": 300,
        "temperature": 0.0,
        "stream": false
    })
}

// --- Response types ---

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(seed: Option<u64>) -> CompletionRequest {
        CompletionRequest {
            system: "sys".into(),
            prompt: "make soup".into(),
            temperature: 0.9,
            max_tokens: 512,
            seed,
        }
    }

    #[test]
    fn completion_body_carries_seed_only_when_set() {
        let with = completion_body("m", &request(Some(7)));
        assert_eq!(with["seed"], 7);
        assert_eq!(with["messages"][1]["content"], "make soup");
        let without = completion_body("m", &request(None));
        assert!(without.get("seed").is_none());
    }

    #[test]
    fn vision_body_embeds_data_url() {
        let body = vision_body("v", b"abc", "image/png", "what food?");
        let url = body["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .expect("url is a string");
        assert_eq!(url, "data:image/png;base64,YWJj");
        assert_eq!(body["messages"][0]["content"][0]["text"], "what food?");
    }

    #[test]
    fn parses_completion_response() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"{\"a\":1}"}}],
            "usage":{"total_tokens":12}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("{\"a\":1}"));
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(12));
    }

    #[test]
    fn missing_api_key_is_unavailable() {
        let endpoint = GenerativeEndpoint {
            api_key_env: "NUTRILENS_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..GenerativeEndpoint::default()
        };
        let err = ChatCompletionsClient::from_endpoint(&endpoint)
            .err()
            .expect("should fail without key");
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
