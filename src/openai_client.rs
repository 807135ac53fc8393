//! Default [`LlmClient`] implementation: an OpenAI/LiteLLM/Ollama-compatible
//! streaming client built directly on `reqwest` (C2's HTTP edge).
//!
//! `async-openai`'s `create_byot` call (used by the teacher's driver) only
//! returns a fully-buffered [`serde_json::Value`], which can't produce the
//! per-chunk telemetry this engine needs. So the actual POST and SSE read
//! happen here via `reqwest` directly; `async-openai`'s `OpenAIConfig` is
//! still reused for the env-var/api-base conventions the teacher relies on.

use std::time::{Duration, Instant};

use async_openai::config::{Config as _, OpenAIConfig};
use rand::Rng as _;

use crate::{
    error::EngineError,
    events::Event,
    model::{LlmResult, Request, Usage},
    ports::{CostCalculator, LlmClient},
    prelude::*,
    streaming::{self, fold_sse_stream},
};

/// Build an `OpenAIConfig` from `OPENAI_API_KEY` / `OPENAI_API_BASE`, the
/// same environment variables the teacher's driver reads.
pub fn default_client_config() -> OpenAIConfig {
    let mut config = OpenAIConfig::new();
    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        config = config.with_api_key(api_key);
    }
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        config = config.with_api_base(api_base);
    }
    config
}

/// A streaming, OpenAI-compatible [`LlmClient`].
///
/// One of these is constructed per worker task (§5 "per-worker HTTP
/// clients"), so its inner `reqwest::Client` is reused across every request
/// that worker processes but never shared across workers.
#[derive(Debug)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    cost_calculator: std::sync::Arc<dyn CostCalculator>,
    on_event: std::sync::Arc<dyn Fn(Event) + Send + Sync>,
}

impl OpenAiCompatibleClient {
    /// Build a client from the default environment-derived configuration.
    pub fn new(cost_calculator: std::sync::Arc<dyn CostCalculator>, on_event: std::sync::Arc<dyn Fn(Event) + Send + Sync>) -> Result<Self, EngineError> {
        let config = default_client_config();
        Self::from_config(config, cost_calculator, on_event)
    }

    /// Build a client from an explicit `OpenAIConfig`, for hosts that want
    /// to point at a non-default gateway without environment variables.
    pub fn from_config(
        config: OpenAIConfig,
        cost_calculator: std::sync::Arc<dyn CostCalculator>,
        on_event: std::sync::Arc<dyn Fn(Event) + Send + Sync>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")
            .map_err(EngineError::ClientSetup)?;
        Ok(Self {
            http,
            api_base: config.api_base().to_owned(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            cost_calculator,
            on_event,
        })
    }

    fn endpoint(&self) -> String {
        let mut base = self.api_base.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        format!("{base}chat/completions")
    }

    async fn execute(&self, request: &Request, model: &str, tools: Option<&[Value]>) -> Result<LlmResult, EngineError> {
        let started_at = Instant::now();
        let nonce = random_nonce();
        let payload = build_payload(request, model, tools, &nonce);

        on_queued_executing(&self.on_event, &request.id);

        let mut req_builder = self
            .http
            .post(self.endpoint())
            .timeout(request.timeout)
            .json(&payload);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.bearer_auth(api_key);
        }

        let response = req_builder.send().await;
        let response = match response {
            Ok(response) => response,
            Err(err) => return Ok(transport_error_result(request, err, started_at)),
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(http_error_result(request, status, response).await);
        }

        let byte_stream = response.bytes_stream();
        let on_event = self.on_event.clone();
        let request_id = request.id.clone();
        let forward = move |event: Event| on_event(event);
        let outcome = fold_sse_stream(
            &request_id,
            byte_stream,
            request.ocr_tokens_hint(),
            request.max_tokens,
            &forward,
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(kind) => {
                let mut result = LlmResult::failure(&request.id, kind, format!("{kind} while streaming"));
                result.execution_time = started_at.elapsed();
                result.request = Some(request.clone());
                return Ok(result);
            }
        };

        Ok(self.finalize(request, model, outcome, started_at))
    }

    fn finalize(&self, request: &Request, model: &str, outcome: streaming::StreamOutcome, started_at: Instant) -> LlmResult {
        let execution_time = started_at.elapsed();
        let image_count = request
            .images
            .as_ref()
            .map(|images| images.len() as u32)
            .unwrap_or(0);

        let (usage, estimated_usage) = match outcome.usage {
            Some(usage) => (usage, false),
            None => {
                let prompt_chars: usize = request.messages.iter().map(|m| m.content.char_len()).sum();
                let completion_chars = outcome.content.len();
                (
                    Usage {
                        prompt_tokens: (prompt_chars as u64) / streaming::CHARS_PER_TOKEN_ESTIMATE,
                        completion_tokens: (completion_chars as u64) / streaming::CHARS_PER_TOKEN_ESTIMATE,
                        reasoning_tokens: 0,
                    },
                    true,
                )
            }
        };

        let cost_usd = self
            .cost_calculator
            .cost(&request.model, usage.prompt_tokens, usage.completion_tokens, image_count);

        let total_tokens = usage.total();
        (self.on_event)(Event::Completed {
            request_id: request.id.clone(),
            total_tokens,
            cost_usd,
        });

        LlmResult {
            request_id: request.id.clone(),
            success: true,
            response: outcome.content,
            usage,
            estimated_usage,
            cost_usd,
            queue_time: Duration::ZERO,
            execution_time,
            ttft: outcome.ttft,
            attempts: 1,
            model_used: Some(model.to_owned()),
            error_kind: None,
            error_message: None,
            retry_after: None,
            tool_calls: outcome.tool_calls,
            reasoning_details: outcome.reasoning_details,
            request: Some(request.clone()),
        }
    }
}

fn on_queued_executing(on_event: &std::sync::Arc<dyn Fn(Event) + Send + Sync>, request_id: &str) {
    on_event(Event::Executing {
        request_id: request_id.to_owned(),
    });
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn call(&self, request: &Request, model: &str) -> Result<LlmResult, EngineError> {
        self.execute(request, model, None).await
    }

    async fn call_with_tools(&self, request: &Request, model: &str, tools: &[Value]) -> Result<LlmResult, EngineError> {
        self.execute(request, model, Some(tools)).await
    }
}

fn random_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

/// Build the JSON payload for a streaming chat completion request,
/// appending a cache-busting nonce to the last message's text content.
fn build_payload(request: &Request, model: &str, tools: Option<&[Value]>, nonce: &str) -> Value {
    let mut messages = request.messages.clone();
    if let Some(last) = messages.last_mut() {
        last.content.append_nonce(nonce);
    }

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "temperature": request.temperature,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if let Some(max_tokens) = request.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(response_format) = &request.response_format {
        payload["response_format"] = response_format.clone();
    }
    if let Some(tools) = tools.or(request.tools.as_deref()) {
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
    }

    payload
}

fn transport_error_result(request: &Request, err: reqwest::Error, started_at: Instant) -> LlmResult {
    let kind = if err.is_timeout() {
        crate::error::ErrorKind::Timeout
    } else {
        crate::error::ErrorKind::Unknown
    };
    let mut result = LlmResult::failure(&request.id, kind, err.to_string());
    result.execution_time = started_at.elapsed();
    result.request = Some(request.clone());
    result
}

async fn http_error_result(request: &Request, status: reqwest::StatusCode, response: reqwest::Response) -> LlmResult {
    let kind = crate::error::ErrorKind::from_status(status.as_u16());
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    let mut result = LlmResult::failure(&request.id, kind, format!("HTTP {status}: {body}"));
    result.retry_after = retry_after;
    result.request = Some(request.clone());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::LiteLlmCostCalculator;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn test_request() -> Request {
        Request::new(
            "req-1",
            "gpt-4o-mini",
            vec![crate::model::Message::text("user", "hi there")],
        )
    }

    #[tokio::test]
    async fn streams_a_successful_completion() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1}}\n",
            "data: [DONE]\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let config = OpenAIConfig::new().with_api_base(server.uri());
        let client = OpenAiCompatibleClient::from_config(
            config,
            std::sync::Arc::new(LiteLlmCostCalculator::empty()),
            std::sync::Arc::new(|_event| {}),
        )
        .unwrap();

        let request = test_request();
        let result = client.call(&request, "gpt-4o-mini").await.unwrap();
        assert!(result.success);
        assert_eq!(result.response, "hi");
        assert_eq!(result.usage.prompt_tokens, 5);
    }

    #[tokio::test]
    async fn maps_429_to_rate_limit_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let config = OpenAIConfig::new().with_api_base(server.uri());
        let client = OpenAiCompatibleClient::from_config(
            config,
            std::sync::Arc::new(LiteLlmCostCalculator::empty()),
            std::sync::Arc::new(|_event| {}),
        )
        .unwrap();

        let request = test_request();
        let result = client.call(&request, "gpt-4o-mini").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(crate::error::ErrorKind::RateLimit429));
        assert_eq!(result.retry_after, Some(3));
    }
}
