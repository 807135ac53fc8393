//! The request/result data model shared by every component (§3).

use std::{
    cmp::Ordering,
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{error::ErrorKind, prelude::*};

/// One piece of multi-part message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// An image, referenced by a data URL or a remote URL.
    ImageUrl {
        /// The image URL (often a `data:` URL for inline images).
        url: String,
    },
}

/// The content of a single message: either plain text, or a list of
/// text/image parts (for multimodal requests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// A plain string.
    Text(String),
    /// Mixed text and image parts.
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Append a cache-busting nonce comment to the last text segment of this
    /// content, regardless of whether it's a plain string or multi-part.
    pub fn append_nonce(&mut self, nonce: &str) {
        match self {
            MessageContent::Text(text) => {
                text.push_str(&format!("\n<!-- request_id: {nonce} -->"));
            }
            MessageContent::Parts(parts) => {
                if let Some(ContentPart::Text { text }) =
                    parts.iter_mut().rev().find(|p| matches!(p, ContentPart::Text { .. }))
                {
                    text.push_str(&format!("\n<!-- request_id: {nonce} -->"));
                } else {
                    parts.push(ContentPart::Text {
                        text: format!("<!-- request_id: {nonce} -->"),
                    });
                }
            }
        }
    }

    /// Approximate character count, used for token estimation fallbacks.
    pub fn char_len(&self) -> usize {
        match self {
            MessageContent::Text(text) => text.len(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.len(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// `"system"`, `"user"`, `"assistant"`, or `"tool"`.
    pub role: String,
    /// The message content.
    pub content: MessageContent,
    /// Present on assistant messages that made tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Present on tool-result messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Present on assistant messages from reasoning models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Vec<Value>>,
}

impl Message {
    /// Build a plain-text message with the given role.
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            tool_call_id: None,
            reasoning_details: None,
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// The id the model assigned to this call; echoed back in the tool
    /// result message.
    pub id: String,
    /// The tool's name.
    pub name: String,
    /// The raw (unparsed) JSON-encoded arguments string, exactly as the
    /// model produced it.
    pub arguments: String,
}

/// One request to the LLM, as submitted by the host.
///
/// `retry_count` and `queued_at` are owned exclusively by the worker pool
/// once a request is admitted (§3 Ownership) — nothing else should read or
/// write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Stable, unique (within the batch) identifier.
    pub id: String,
    /// The model to call.
    pub model: String,
    /// Ordered conversation messages.
    pub messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional cap on completion tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Per-request timeout. Defaults to 120s if unset.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// Inline images, if any (also embeddable directly in `messages`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ContentPart>>,
    /// An opaque JSON Schema constraining the model's output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    /// Tool schemas available to the model (OpenAI `tools` array shape).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Models to fall back to if `model` is unavailable. The engine does not
    /// implement fallback selection itself; it's surfaced for host routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_models: Option<Vec<String>>,
    /// Host metadata bag. `metadata["ocr_tokens"]` and `metadata["stage"]`
    /// have engine-recognized meanings (§4.2); everything else passes
    /// through untouched.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,

    /// Owned by the worker pool once admitted. Not serialized.
    #[serde(skip)]
    pub(crate) retry_count: u32,
    /// Owned by the worker pool once admitted. Not serialized.
    #[serde(skip)]
    pub(crate) queued_at: Option<Instant>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Request {
    /// Build a new request with sensible defaults (temperature 0, 120s
    /// timeout, no tools/images/response-format).
    pub fn new(id: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            timeout: default_timeout(),
            images: None,
            response_format: None,
            tools: None,
            fallback_models: None,
            metadata: serde_json::Map::new(),
            retry_count: 0,
            queued_at: None,
        }
    }

    /// The `ocr_tokens` ETA hint, if the host supplied one.
    pub fn ocr_tokens_hint(&self) -> Option<u64> {
        self.metadata.get("ocr_tokens").and_then(Value::as_u64)
    }

    /// The `stage` tag, if the host supplied one.
    pub fn stage_tag(&self) -> Option<&str> {
        self.metadata.get("stage").and_then(Value::as_str)
    }
}

/// Priority-queue ordering key: requests admitted earlier sort first.
///
/// Only meaningful once `queued_at` has been set by the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedAt(pub Instant);

impl PartialOrd for QueuedAt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAt {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so a `BinaryHeap` (a max-heap) pops the *oldest* request first.
        other.0.cmp(&self.0)
    }
}

/// Token usage for one LLM call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens in the completion.
    pub completion_tokens: u64,
    /// Reasoning tokens, for models that report them separately.
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Prompt + completion + reasoning tokens.
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens + self.reasoning_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// The outcome of one LLM call (§3 `LlmResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResult {
    /// The id of the originating request.
    pub request_id: String,
    /// Did this call ultimately succeed?
    pub success: bool,
    /// The model's response text, if any.
    #[serde(default)]
    pub response: String,
    /// Token usage.
    #[serde(default)]
    pub usage: Usage,
    /// Set when `usage` had to be derived from character counts rather than
    /// the provider's own accounting.
    #[serde(default)]
    pub estimated_usage: bool,
    /// Cost in USD, from the [`CostCalculator`](crate::ports::CostCalculator)
    /// port.
    #[serde(default)]
    pub cost_usd: f64,
    /// Time spent queued before the first dequeue.
    #[serde(default)]
    pub queue_time: Duration,
    /// Time spent actually executing the (final, successful or terminally
    /// failed) attempt.
    #[serde(default)]
    pub execution_time: Duration,
    /// Time to first streamed token, if the call streamed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft: Option<Duration>,
    /// Number of attempts made (1 + retries).
    #[serde(default)]
    pub attempts: u32,
    /// The model actually used (may differ from `Request::model` if a
    /// fallback was selected upstream of this crate).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Failure classification, if `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Human-readable failure detail, if `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// `Retry-After` hint from a 429 response, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Tool calls the model made, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Reasoning detail blocks, if the model produced any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Vec<Value>>,
    /// The request that produced this result, for host convenience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
}

impl LlmResult {
    /// Build a failure result with the given kind and message.
    pub fn failure(request_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            response: String::new(),
            usage: Usage::default(),
            estimated_usage: false,
            cost_usd: 0.0,
            queue_time: Duration::ZERO,
            execution_time: Duration::ZERO,
            ttft: None,
            attempts: 0,
            model_used: None,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            retry_after: None,
            tool_calls: None,
            reasoning_details: None,
            request: None,
        }
    }
}

/// Lifecycle phase of a request inside the worker pool (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Sitting in the priority queue.
    Queued,
    /// Dequeued, waiting on the rate limiter.
    RateLimited,
    /// Popped off the queue, about to execute.
    Dequeued,
    /// The streaming call is in flight.
    Executing,
    /// Terminal: succeeded.
    Completed,
    /// Terminal: failed (permanently).
    Failed,
}

/// A snapshot of one request's lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    /// The request id this status describes.
    pub request_id: String,
    /// Current phase.
    pub phase: RequestPhase,
    /// When this request was first admitted.
    #[serde(skip)]
    pub queued_at: Option<Instant>,
    /// When it entered its current phase.
    #[serde(skip)]
    pub phase_entered_at: Option<Instant>,
    /// How many times it has been retried so far.
    pub retry_count: u32,
    /// Estimated wait, in seconds, if currently `RateLimited`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_eta: Option<f64>,
}

/// An on-demand snapshot of batch-wide progress (§3).
///
/// Computed from the worker pool's in-memory results/phase maps, never
/// maintained incrementally — this is the view the engine itself treats as
/// authoritative for any routing decision (§9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchStats {
    /// Requests with a terminal success result.
    pub completed: usize,
    /// Requests with a terminal failure result.
    pub failed: usize,
    /// Requests currently executing.
    pub in_progress: usize,
    /// Requests still queued (including rate-limited / awaiting retry).
    pub queued: usize,
    /// Sum of `cost_usd` across all terminal results so far.
    pub total_cost_usd: f64,
    /// Sum of prompt + completion + reasoning tokens across all terminal
    /// results so far.
    pub total_tokens: u64,
    /// Observed throughput, in completed-or-failed requests per second,
    /// since the batch started.
    pub throughput_per_sec: f64,
    /// Fraction of the rate limiter's capacity currently consumed.
    pub rate_limit_utilization: f64,
}

impl BatchStats {
    /// Compute a snapshot from the worker pool's result/phase maps. Pure and
    /// cheap enough to call on every host poll — nothing here is maintained
    /// incrementally (§9).
    pub fn snapshot(results: &ResultMap, phases: &PhaseMap, elapsed: Duration, rate_limit_utilization: f64) -> Self {
        let completed = results.values().filter(|r| r.success).count();
        let failed = results.values().filter(|r| !r.success).count();
        let in_progress = phases
            .values()
            .filter(|status| matches!(status.phase, RequestPhase::Dequeued | RequestPhase::Executing))
            .count();
        let queued = phases
            .values()
            .filter(|status| matches!(status.phase, RequestPhase::Queued | RequestPhase::RateLimited))
            .count();
        let total_cost_usd = results.values().map(|r| r.cost_usd).sum();
        let total_tokens = results.values().map(|r| r.usage.total()).sum();
        let terminal = (completed + failed) as f64;
        let throughput_per_sec = if elapsed.as_secs_f64() > 0.0 {
            terminal / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Self {
            completed,
            failed,
            in_progress,
            queued,
            total_cost_usd,
            total_tokens,
            throughput_per_sec,
            rate_limit_utilization,
        }
    }
}

/// Per-request phase map, keyed by request id.
pub type PhaseMap = HashMap<String, RequestStatus>;

/// Per-request result map, keyed by request id.
pub type ResultMap = HashMap<String, LlmResult>;
