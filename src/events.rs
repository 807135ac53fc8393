//! Lifecycle events emitted by the worker pool, streaming client, and agent
//! loops for host-side progress display (§6).
//!
//! Hosts subscribe by passing an `on_event: impl Fn(Event) + Send + Sync`
//! callback; nothing in this crate depends on a particular UI.

use std::time::Duration;

use crate::{model::ToolCall, prelude::*};

/// A lifecycle event for one request moving through the batch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Admitted into the worker pool's priority queue.
    Queued {
        /// The request id.
        request_id: String,
    },
    /// Blocked on the rate limiter; will be re-queued after `eta_secs`.
    RateLimited {
        /// The request id.
        request_id: String,
        /// Estimated seconds until a token is available.
        eta_secs: f64,
    },
    /// Popped off the queue and handed to a worker.
    Dequeued {
        /// The request id.
        request_id: String,
    },
    /// The streaming HTTP call started.
    Executing {
        /// The request id.
        request_id: String,
    },
    /// The first content token arrived.
    FirstToken {
        /// The request id.
        request_id: String,
        /// Time since the call started.
        ttft: Duration,
    },
    /// A throttled content delta, emitted at most once per
    /// `STREAMING_THROTTLE_INTERVAL` (§4.2).
    Streaming {
        /// The request id.
        request_id: String,
        /// Characters received so far.
        chars_received: usize,
        /// Estimated tokens received so far (`chars_received / CHARS_PER_TOKEN_ESTIMATE`).
        tokens_estimate: u64,
        /// Observed token throughput so far, in tokens/second.
        tokens_per_second: f64,
        /// Seconds until the estimated total is reached at the current rate
        /// (`(estimated_total - observed) / rate`); `0.0` at stream end.
        tokens_eta: f64,
    },
    /// The call failed and will be retried.
    RetryQueued {
        /// The request id.
        request_id: String,
        /// Which attempt is about to be retried (1-based).
        attempt: u32,
        /// Why the previous attempt failed.
        error_kind: String,
        /// How long the worker will sleep before re-queueing.
        backoff: Duration,
    },
    /// Terminal success.
    Completed {
        /// The request id.
        request_id: String,
        /// Total tokens used.
        total_tokens: u64,
        /// Cost in USD.
        cost_usd: f64,
    },
    /// Terminal failure (retries exhausted, or a non-retryable error).
    Failed {
        /// The request id.
        request_id: String,
        /// Final error classification tag.
        error_kind: String,
        /// Human-readable detail.
        error_message: String,
    },
    /// Emitted periodically by the batch controller with an overall
    /// snapshot; not tied to any one request.
    Progress {
        /// Requests completed so far (success or failure).
        done: usize,
        /// Total requests admitted to this batch.
        total: usize,
    },

    /// An agent run started.
    AgentStart {
        /// The agent's id (usually the batch entry id).
        agent_id: String,
        /// Maximum tool-call iterations allowed.
        max_iterations: u32,
    },
    /// An agent began one iteration of its reasoning loop.
    IterationStart {
        /// The agent's id.
        agent_id: String,
        /// 1-based iteration number.
        iteration: u32,
    },
    /// An agent's model turn requested a tool call.
    ToolCall {
        /// The agent's id.
        agent_id: String,
        /// 1-based iteration number.
        iteration: u32,
        /// The tool call itself.
        call: ToolCall,
    },
    /// An agent finished one iteration (model turn + any tool execution).
    IterationComplete {
        /// The agent's id.
        agent_id: String,
        /// 1-based iteration number.
        iteration: u32,
        /// Running token total for this agent.
        total_tokens: u64,
        /// Running cost total for this agent, in USD.
        total_cost_usd: f64,
    },
    /// An agent run finished, successfully or not.
    AgentComplete {
        /// The agent's id.
        agent_id: String,
        /// Whether the agent reported task completion before exhausting its
        /// iteration budget.
        success: bool,
        /// Iterations actually used.
        iterations_used: u32,
    },
    /// Synthetic summary event fired by the multi-agent batch controller
    /// after an agent finishes, carrying a coarse status label for display
    /// (e.g. `"found"` / `"not_found"`) distinct from bare success/failure.
    AgentStatusFinal {
        /// The agent's id.
        agent_id: String,
        /// A host-defined status label.
        status: String,
    },
}

/// A no-op event sink, for callers that don't want progress callbacks.
pub fn ignore_event(_event: Event) {}
