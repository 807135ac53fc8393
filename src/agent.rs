//! The tool-calling agent loop (C4): a single conversation that alternates
//! model turns and tool executions until the tool set reports completion,
//! the model stops calling tools, or `max_iterations` is exhausted.
//!
//! Built directly on the same [`LlmClient`] port C3 uses, but called
//! one-at-a-time rather than through the worker pool — the agent is its own
//! serializer of calls, and gets exactly one attempt per iteration (no
//! agent-level retry; see `run`).

use std::{fmt, sync::Arc, time::Instant};

use crate::{
    error::EngineError,
    events::Event,
    model::{ContentPart, Message, Request, ToolCall, Usage},
    ports::{LlmClient, MetricsManager, StageStorage},
    prelude::*,
};

/// Above this many bytes, a reasoning block is summarized to size-only
/// metadata in the run log instead of written out in full.
const REASONING_TRUNCATION_THRESHOLD_BYTES: usize = 8 * 1024;

/// A capability bundle an [`AgentLoop`] drives between model turns.
///
/// Concrete tool sets (file search, web fetch, whatever the host needs) live
/// outside this crate; [`NullTools`] and [`EchoTools`] below exist only for
/// tests and demos.
#[async_trait]
pub trait Tools: fmt::Debug + Send + Sync + 'static {
    /// Tool schemas to attach to the next model turn, in OpenAI `tools`
    /// array shape.
    fn tool_schemas(&self) -> Vec<Value>;

    /// Images to attach to the next model turn, if this tool set produces
    /// any (e.g. a freshly-rendered page). `None` means "no opinion" and
    /// the agent falls back to its static [`AgentConfig::images`].
    fn images(&self) -> Option<Vec<ContentPart>>;

    /// Run one tool call, returning the string to feed back as the tool
    /// result message's content. Errors should be encoded into the
    /// returned string (e.g. `{"error": "..."}`) rather than propagated —
    /// a failing tool doesn't abort the agent.
    async fn execute(&self, name: &str, args: Value) -> String;

    /// Has the task been completed? Checked after every model turn that
    /// doesn't request a tool call.
    async fn is_complete(&self) -> bool;
}

/// A [`Tools`] implementation that is always complete and has nothing to
/// offer. Useful as a placeholder in tests.
#[derive(Debug, Default)]
pub struct NullTools;

#[async_trait]
impl Tools for NullTools {
    fn tool_schemas(&self) -> Vec<Value> {
        Vec::new()
    }

    fn images(&self) -> Option<Vec<ContentPart>> {
        None
    }

    async fn execute(&self, name: &str, _args: Value) -> String {
        json!({ "error": format!("no such tool: {name}") }).to_string()
    }

    async fn is_complete(&self) -> bool {
        true
    }
}

/// A [`Tools`] implementation that echoes its arguments back and completes
/// after a fixed number of calls. Useful for exercising the agent loop in
/// demos without a real tool backend.
#[derive(Debug)]
pub struct EchoTools {
    calls_until_complete: std::sync::atomic::AtomicU32,
}

impl EchoTools {
    /// Build an `EchoTools` that reports completion after `calls` tool
    /// invocations.
    pub fn new(calls: u32) -> Self {
        Self {
            calls_until_complete: std::sync::atomic::AtomicU32::new(calls),
        }
    }
}

#[async_trait]
impl Tools for EchoTools {
    fn tool_schemas(&self) -> Vec<Value> {
        vec![json!({
            "type": "function",
            "function": {
                "name": "echo",
                "description": "Echo the given arguments back",
                "parameters": { "type": "object", "properties": {} },
            }
        })]
    }

    fn images(&self) -> Option<Vec<ContentPart>> {
        None
    }

    async fn execute(&self, name: &str, args: Value) -> String {
        use std::sync::atomic::Ordering;
        self.calls_until_complete.fetch_sub(1, Ordering::SeqCst);
        json!({ "tool": name, "echoed": args }).to_string()
    }

    async fn is_complete(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.calls_until_complete.load(Ordering::SeqCst) == 0
    }
}

/// Configuration for one agent run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// An id for this agent, used to tag events, log files, and metrics
    /// keys.
    pub agent_id: String,
    /// The model to call.
    pub model: String,
    /// The conversation so far (typically a system prompt and a user
    /// turn).
    pub initial_messages: Vec<Message>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional cap on completion tokens per turn.
    pub max_tokens: Option<u32>,
    /// Static images to attach when the tool set has none of its own.
    pub images: Option<Vec<ContentPart>>,
    /// Maximum number of model-turn iterations before giving up.
    pub max_iterations: u32,
    /// Per-iteration LLM call timeout.
    pub timeout: std::time::Duration,
    /// A prefix applied to per-iteration metrics keys (e.g.
    /// `"doc-42/search/"`).
    pub metrics_key_prefix: String,
}

impl AgentConfig {
    /// Build a config with the teacher's defaults: temperature 0,
    /// `max_iterations = 15`, `timeout = 120s`.
    pub fn new(agent_id: impl Into<String>, model: impl Into<String>, initial_messages: Vec<Message>) -> Self {
        Self {
            agent_id: agent_id.into(),
            model: model.into(),
            initial_messages,
            temperature: 0.0,
            max_tokens: None,
            images: None,
            max_iterations: 15,
            timeout: std::time::Duration::from_secs(120),
            metrics_key_prefix: String::new(),
        }
    }
}

/// One iteration's record in the run log.
#[derive(Debug, Clone, Serialize)]
struct IterationLog {
    iteration: u32,
    llm_request: Value,
    llm_response: Value,
    tool_executions: Vec<Value>,
}

/// The run log written to [`StageStorage`] on termination (§4.4 "Run log").
#[derive(Debug, Clone, Serialize)]
struct RunLog {
    metadata: RunLogMetadata,
    initial_messages: Vec<Message>,
    iterations: Vec<IterationLog>,
}

#[derive(Debug, Clone, Serialize)]
struct RunLogMetadata {
    model: String,
    max_iterations: u32,
    start_time: String,
    end_time: String,
    success: bool,
    total_iterations: u32,
    total_cost_usd: f64,
    execution_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

/// The outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Did the tool set report completion before the iteration budget ran
    /// out?
    pub success: bool,
    /// Iterations actually used.
    pub iterations: u32,
    /// Total cost across every iteration's LLM call.
    pub total_cost_usd: f64,
    /// Total token usage across every iteration's LLM call.
    pub usage: Usage,
    /// Wall-clock time for the whole run.
    pub execution_time: std::time::Duration,
    /// The final conversation, including every tool call and result.
    pub final_messages: Vec<Message>,
    /// Where the run log was written, if a [`StageStorage`] was configured.
    pub run_log_path: Option<String>,
    /// Set when `success` is false.
    pub error_message: Option<String>,
}

/// Drives one [`AgentConfig`] through its conversation, calling an
/// [`LlmClient`] directly (not through the worker pool) once per iteration.
#[derive(Debug, Clone)]
pub struct AgentLoop {
    llm_client: Arc<dyn LlmClient>,
    storage: Option<Arc<dyn StageStorage>>,
    metrics: Option<Arc<dyn MetricsManager>>,
}

impl AgentLoop {
    /// Build an agent loop against the given LLM client, with optional
    /// run-log storage and per-iteration metrics recording.
    pub fn new(
        llm_client: Arc<dyn LlmClient>,
        storage: Option<Arc<dyn StageStorage>>,
        metrics: Option<Arc<dyn MetricsManager>>,
    ) -> Self {
        Self {
            llm_client,
            storage,
            metrics,
        }
    }

    /// Run the agent to completion (success, failure, or exhausted
    /// iterations), calling `on_event` for every lifecycle event along the
    /// way.
    #[instrument(level = "info", skip_all, fields(agent_id = %config.agent_id, model = %config.model))]
    pub async fn run(
        &self,
        config: &AgentConfig,
        tools: &dyn Tools,
        on_event: &(dyn Fn(Event) + Send + Sync),
    ) -> AgentResult {
        let started_at = Instant::now();
        let start_time = now_iso8601();
        let mut messages = config.initial_messages.clone();
        let mut run_log = RunLog {
            metadata: RunLogMetadata {
                model: config.model.clone(),
                max_iterations: config.max_iterations,
                start_time: start_time.clone(),
                end_time: String::new(),
                success: false,
                total_iterations: 0,
                total_cost_usd: 0.0,
                execution_time_seconds: 0.0,
                error_message: None,
            },
            initial_messages: messages.clone(),
            iterations: Vec::new(),
        };

        on_event(Event::AgentStart {
            agent_id: config.agent_id.clone(),
            max_iterations: config.max_iterations,
        });

        let mut total_usage = Usage::default();
        let mut total_cost_usd = 0.0;

        for iteration in 1..=config.max_iterations {
            on_event(Event::IterationStart {
                agent_id: config.agent_id.clone(),
                iteration,
            });

            let images = tools.images().or_else(|| config.images.clone());
            let tool_schemas = tools.tool_schemas();
            let request = build_request(config, &messages, images, iteration);

            let iteration_started = Instant::now();
            let call_result = if tool_schemas.is_empty() {
                self.llm_client.call(&request, &config.model).await
            } else {
                self.llm_client.call_with_tools(&request, &config.model, &tool_schemas).await
            };

            let result = match call_result {
                Ok(result) => result,
                Err(err) => {
                    run_log.iterations.push(IterationLog {
                        iteration,
                        llm_request: llm_request_summary(config, iteration),
                        llm_response: json!({ "error": err.to_string() }),
                        tool_executions: Vec::new(),
                    });
                    return self
                        .finalize(
                            config,
                            run_log,
                            messages,
                            false,
                            Some(format!("LLM call failed in iteration {iteration}: {err}")),
                            started_at,
                            total_cost_usd,
                            total_usage,
                            iteration,
                        )
                        .await;
                }
            };

            total_cost_usd += result.cost_usd;
            total_usage += result.usage;

            let mut assistant = Message::text("assistant", result.response.clone());
            assistant.tool_calls = result.tool_calls.clone();
            assistant.reasoning_details = result.reasoning_details.clone();
            messages.push(assistant);

            run_log.iterations.push(IterationLog {
                iteration,
                llm_request: llm_request_summary(config, iteration),
                llm_response: json!({
                    "content": result.response,
                    "tool_calls": result.tool_calls,
                    "reasoning_details": truncate_reasoning(result.reasoning_details.as_deref()),
                    "prompt_tokens": result.usage.prompt_tokens,
                    "completion_tokens": result.usage.completion_tokens,
                    "total_tokens": result.usage.total(),
                    "reasoning_tokens": result.usage.reasoning_tokens,
                    "cost_usd": result.cost_usd,
                }),
                tool_executions: Vec::new(),
            });

            let Some(tool_calls) = result.tool_calls.filter(|calls| !calls.is_empty()) else {
                if tools.is_complete().await {
                    on_event(Event::AgentComplete {
                        agent_id: config.agent_id.clone(),
                        success: true,
                        iterations_used: iteration,
                    });
                    return self
                        .finalize(
                            config, run_log, messages, true, None, started_at, total_cost_usd,
                            total_usage, iteration,
                        )
                        .await;
                }
                messages.push(Message::text(
                    "user",
                    "Please continue using the available tools to complete your task.",
                ));
                self.record_iteration_metrics(config, iteration, &result.usage, result.cost_usd, 0, iteration_started)
                    .await;
                continue;
            };

            let mut tool_executions = Vec::new();
            for call in &tool_calls {
                let tool_start = Instant::now();
                let arguments: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                let tool_result = tools.execute(&call.name, arguments.clone()).await;
                let tool_elapsed = tool_start.elapsed();

                on_event(Event::ToolCall {
                    agent_id: config.agent_id.clone(),
                    iteration,
                    call: call.clone(),
                });

                tool_executions.push(json!({
                    "tool_call_id": call.id,
                    "tool_name": call.name,
                    "arguments": arguments,
                    "result": tool_result,
                    "execution_time_seconds": tool_elapsed.as_secs_f64(),
                }));

                let mut tool_message = Message::text("tool", tool_result);
                tool_message.tool_call_id = Some(call.id.clone());
                messages.push(tool_message);
            }
            if let Some(last) = run_log.iterations.last_mut() {
                last.tool_executions = tool_executions;
            }

            on_event(Event::IterationComplete {
                agent_id: config.agent_id.clone(),
                iteration,
                total_tokens: total_usage.total(),
                total_cost_usd,
            });

            self.record_iteration_metrics(
                config,
                iteration,
                &result.usage,
                result.cost_usd,
                tool_calls.len(),
                iteration_started,
            )
            .await;

            if tools.is_complete().await {
                on_event(Event::AgentComplete {
                    agent_id: config.agent_id.clone(),
                    success: true,
                    iterations_used: iteration,
                });
                return self
                    .finalize(
                        config, run_log, messages, true, None, started_at, total_cost_usd, total_usage,
                        iteration,
                    )
                    .await;
            }
        }

        on_event(Event::AgentComplete {
            agent_id: config.agent_id.clone(),
            success: false,
            iterations_used: config.max_iterations,
        });
        self.finalize(
            config,
            run_log,
            messages,
            false,
            Some(format!("agent did not complete within {} iterations", config.max_iterations)),
            started_at,
            total_cost_usd,
            total_usage,
            config.max_iterations,
        )
        .await
    }

    async fn record_iteration_metrics(
        &self,
        config: &AgentConfig,
        iteration: u32,
        usage: &Usage,
        cost_usd: f64,
        tool_call_count: usize,
        iteration_started: Instant,
    ) {
        let Some(metrics) = &self.metrics else { return };
        let key = format!("{}iteration_{iteration:04}", config.metrics_key_prefix);
        let custom = json!({
            "iteration": iteration,
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "reasoning_tokens": usage.reasoning_tokens,
            "tool_calls": tool_call_count,
        });
        let Some(custom) = custom.as_object().cloned() else { return };
        if let Err(err) = metrics
            .record(&key, cost_usd, iteration_started.elapsed(), usage.total(), custom, false)
            .await
        {
            warn!(%err, agent_id = %config.agent_id, "failed to record agent iteration metrics");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        config: &AgentConfig,
        mut run_log: RunLog,
        final_messages: Vec<Message>,
        success: bool,
        error_message: Option<String>,
        started_at: Instant,
        total_cost_usd: f64,
        usage: Usage,
        iterations: u32,
    ) -> AgentResult {
        let elapsed = started_at.elapsed();
        run_log.metadata.end_time = now_iso8601();
        run_log.metadata.success = success;
        run_log.metadata.total_iterations = iterations;
        run_log.metadata.total_cost_usd = total_cost_usd;
        run_log.metadata.execution_time_seconds = elapsed.as_secs_f64();
        run_log.metadata.error_message = error_message.clone();

        let run_log_path = self.save_run_log(config, &run_log).await;

        AgentResult {
            success,
            iterations,
            total_cost_usd,
            usage,
            execution_time: elapsed,
            final_messages,
            run_log_path,
            error_message,
        }
    }

    async fn save_run_log(&self, config: &AgentConfig, run_log: &RunLog) -> Option<String> {
        let storage = self.storage.as_ref()?;
        let cleaned = clean_run_log_for_storage(run_log);
        let body = match serde_json::to_vec_pretty(&cleaned) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, agent_id = %config.agent_id, "failed to serialize agent run log");
                return None;
            }
        };
        let relative_path = format!("logs/agents/{}/run-{}.json", config.agent_id, run_log.metadata.start_time);
        match storage.save_file(&relative_path, &body).await {
            Ok(()) => Some(relative_path),
            Err(err) => {
                warn!(%err, agent_id = %config.agent_id, "failed to save agent run log");
                None
            }
        }
    }
}

/// Build the chat-completions request for one iteration.
fn build_request(config: &AgentConfig, messages: &[Message], images: Option<Vec<ContentPart>>, iteration: u32) -> Request {
    let mut request = Request::new(format!("{}-iter{iteration}", config.agent_id), &config.model, messages.to_vec());
    request.temperature = config.temperature;
    request.max_tokens = config.max_tokens;
    request.images = images;
    request.timeout = config.timeout;
    request
}

/// A small, loggable summary of the per-iteration request (we never log the
/// full message history per-iteration; it's already captured once in
/// `initial_messages` plus each iteration's own appended turns).
fn llm_request_summary(config: &AgentConfig, iteration: u32) -> Value {
    json!({
        "model": config.model,
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
        "iteration": iteration,
    })
}

/// Strip base64 image payloads and over-threshold reasoning blobs from a
/// run log before it's written to storage (§4.4 "Run log").
fn clean_run_log_for_storage(run_log: &RunLog) -> Value {
    let mut value = serde_json::to_value(run_log).unwrap_or(Value::Null);
    if let Some(initial) = value.get_mut("initial_messages") {
        strip_images_in_place(initial);
    }
    value
}

fn strip_images_in_place(messages: &mut Value) {
    let Some(array) = messages.as_array_mut() else { return };
    for message in array {
        let Some(content) = message.get_mut("content") else { continue };
        let Some(parts) = content.as_array_mut() else { continue };
        for part in parts {
            if part.get("type").and_then(Value::as_str) != Some("image_url") {
                continue;
            }
            let original_len = part
                .get("url")
                .and_then(Value::as_str)
                .map(str::len)
                .unwrap_or(0);
            if let Some(obj) = part.as_object_mut() {
                obj.insert("url".to_owned(), json!("[IMAGE_DATA_REMOVED]"));
                obj.insert("original_size_bytes".to_owned(), json!(original_len));
            }
        }
    }
}

/// Summarize reasoning blocks over [`REASONING_TRUNCATION_THRESHOLD_BYTES`]
/// to size-only metadata.
fn truncate_reasoning(details: Option<&[Value]>) -> Option<Vec<Value>> {
    let details = details?;
    Some(
        details
            .iter()
            .map(|detail| {
                let size = detail.to_string().len();
                if size > REASONING_TRUNCATION_THRESHOLD_BYTES {
                    json!({ "truncated_reasoning_bytes": size })
                } else {
                    detail.clone()
                }
            })
            .collect(),
    )
}

fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}", since_epoch.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LlmResult;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct ScriptedAgentClient {
        tool_calls_remaining: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for ScriptedAgentClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, EngineError> {
            Ok(LlmResult {
                request: Some(request.clone()),
                ..success_result(request, String::new(), None)
            })
        }

        async fn call_with_tools(&self, request: &Request, _model: &str, _tools: &[Value]) -> Result<LlmResult, EngineError> {
            let remaining = self.tool_calls_remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(success_result(request, "all done".to_owned(), None));
            }
            self.tool_calls_remaining.fetch_sub(1, Ordering::SeqCst);
            let calls = vec![ToolCall {
                id: "call-1".to_owned(),
                name: "echo".to_owned(),
                arguments: "{}".to_owned(),
            }];
            Ok(success_result(request, String::new(), Some(calls)))
        }
    }

    fn success_result(request: &Request, response: String, tool_calls: Option<Vec<ToolCall>>) -> LlmResult {
        LlmResult {
            request_id: request.id.clone(),
            success: true,
            response,
            usage: Usage { prompt_tokens: 10, completion_tokens: 5, reasoning_tokens: 0 },
            estimated_usage: false,
            cost_usd: 0.001,
            queue_time: std::time::Duration::ZERO,
            execution_time: std::time::Duration::from_millis(5),
            ttft: None,
            attempts: 1,
            model_used: Some(request.model.clone()),
            error_kind: None,
            error_message: None,
            retry_after: None,
            tool_calls,
            reasoning_details: None,
            request: None,
        }
    }

    #[tokio::test]
    async fn completes_after_tool_calls_and_is_complete() {
        let client: Arc<dyn LlmClient> = Arc::new(ScriptedAgentClient { tool_calls_remaining: AtomicU32::new(2) });
        let agent_loop = AgentLoop::new(client, None, None);
        let config = AgentConfig::new("agent-1", "gpt-4o", vec![Message::text("user", "find the thing")]);
        let tools = EchoTools::new(2);

        let result = agent_loop.run(&config, &tools, &(|_event: Event| {})).await;
        assert!(result.success);
        // Completion is checked after every iteration, including ones that
        // made tool calls, so the agent returns as soon as the 2nd tool
        // call satisfies `EchoTools::is_complete` rather than waiting for a
        // 3rd, tool-call-free turn.
        assert_eq!(result.iterations, 2);
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn exhausting_iterations_without_completion_is_a_failure() {
        let client: Arc<dyn LlmClient> = Arc::new(ScriptedAgentClient { tool_calls_remaining: AtomicU32::new(100) });
        let agent_loop = AgentLoop::new(client, None, None);
        let mut config = AgentConfig::new("agent-2", "gpt-4o", vec![Message::text("user", "find the thing")]);
        config.max_iterations = 3;
        let tools = EchoTools::new(100);

        let result = agent_loop.run(&config, &tools, &(|_event: Event| {})).await;
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert!(result.error_message.unwrap().contains("3 iterations"));
    }

    #[derive(Debug)]
    struct AlwaysErrorClient;

    #[async_trait]
    impl LlmClient for AlwaysErrorClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, EngineError> {
            let _ = request;
            Err(EngineError::ClientSetup(anyhow!("boom")))
        }

        async fn call_with_tools(&self, request: &Request, _model: &str, _tools: &[Value]) -> Result<LlmResult, EngineError> {
            self.call(request, _model).await
        }
    }

    #[tokio::test]
    async fn llm_failure_aborts_with_no_retry() {
        let client: Arc<dyn LlmClient> = Arc::new(AlwaysErrorClient);
        let agent_loop = AgentLoop::new(client, None, None);
        let config = AgentConfig::new("agent-3", "gpt-4o", vec![Message::text("user", "hi")]);
        let tools = NullTools;

        let result = agent_loop.run(&config, &tools, &(|_event: Event| {})).await;
        assert!(!result.success);
        assert_eq!(result.iterations, 1);
        assert!(result.error_message.unwrap().contains("iteration 1"));
    }
}
