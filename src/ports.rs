//! Small trait objects for the engine's external dependencies (§6, §9).
//!
//! Duck-typed collaborators from the source design become `#[async_trait]`
//! traits here, passed around as `Arc<dyn Trait>` so they're cheap to share
//! across worker tasks. The engine depends only on these trait objects, never
//! a concrete implementation.

use std::{collections::HashMap, fmt};

use crate::{
    error::EngineError,
    model::{LlmResult, Request},
    prelude::*,
};

/// Transport to the LLM provider.
///
/// The default implementation, [`crate::openai_client::OpenAiCompatibleClient`],
/// streams the response over SSE and derives [`crate::events::Event`]s as it
/// goes; nonce injection and stream parsing are internal to that
/// implementation, not part of this trait's contract.
#[async_trait]
pub trait LlmClient: fmt::Debug + Send + Sync + 'static {
    /// Run one plain chat completion.
    async fn call(&self, request: &Request, model: &str) -> Result<LlmResult, EngineError>;

    /// Run one chat completion with tool schemas attached, returning any
    /// tool calls the model made in `LlmResult::tool_calls`.
    async fn call_with_tools(
        &self,
        request: &Request,
        model: &str,
        tools: &[Value],
    ) -> Result<LlmResult, EngineError>;
}

/// Computes the USD cost of a completion from token counts.
///
/// Must tolerate unknown models by returning `0.0` rather than failing —
/// a missing price should never abort a batch.
pub trait CostCalculator: fmt::Debug + Send + Sync + 'static {
    /// Cost, in USD, of `prompt_tokens` + `completion_tokens` (and
    /// `images` inline images, for providers that price them separately)
    /// against `model_id`.
    fn cost(&self, model_id: &str, prompt_tokens: u64, completion_tokens: u64, images: u32) -> f64;
}

/// Filesystem-ish storage for per-item results and agent run logs.
///
/// The engine only ever writes into the stage directory it was
/// constructed with; it never touches a path outside that root.
#[async_trait]
pub trait StageStorage: fmt::Debug + Send + Sync + 'static {
    /// Write `contents` to `relative_path` under this stage.
    async fn save_file(&self, relative_path: &str, contents: &[u8]) -> Result<(), EngineError>;

    /// Read `relative_path` under this stage.
    async fn load_file(&self, relative_path: &str) -> Result<Vec<u8>, EngineError>;
}

/// Per-iteration metrics sink, keyed by an opaque string (e.g.
/// `iteration_0001`).
#[async_trait]
pub trait MetricsManager: fmt::Debug + Send + Sync + 'static {
    /// Record one metrics row. `accumulate = true` adds to any existing
    /// row under `key` instead of overwriting it.
    async fn record(
        &self,
        key: &str,
        cost_usd: f64,
        elapsed: std::time::Duration,
        tokens: u64,
        custom: serde_json::Map<String, Value>,
        accumulate: bool,
    ) -> Result<(), EngineError>;

    /// Every metrics row recorded so far, keyed as passed to `record`.
    async fn get_all(&self) -> HashMap<String, Value>;
}
