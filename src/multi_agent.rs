//! Multi-agent batch execution (C5): run many [`AgentLoop`]s concurrently
//! under a fixed-size pool, with aggregated progress events.
//!
//! The async equivalent of the teacher's per-request worker pool, but one
//! level up: instead of a priority queue of `Request`s, this drains a
//! `Vec<AgentConfig>` through a `Semaphore`-gated `JoinSet`.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    agent::{AgentConfig, AgentLoop, AgentResult, Tools},
    events::Event,
    model::Usage,
    prelude::*,
};

/// Parameters for a multi-agent batch.
#[derive(Debug, Clone, Copy)]
pub struct MultiAgentBatchConfig {
    /// How many agents may run concurrently.
    pub max_workers: usize,
}

impl Default for MultiAgentBatchConfig {
    fn default() -> Self {
        Self { max_workers: 5 }
    }
}

/// The outcome of one [`MultiAgentBatch::run`] call (§4.5 "Aggregate
/// result").
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Every agent's individual result, in completion order (not submission
    /// order).
    pub results: Vec<AgentResult>,
    /// Total number of agents run.
    pub total_agents: usize,
    /// Agents that reported success.
    pub successful: usize,
    /// Agents that did not.
    pub failed: usize,
    /// Sum of `total_cost_usd` across all agents.
    pub total_cost_usd: f64,
    /// Wall-clock time for the whole batch.
    pub total_time: std::time::Duration,
    /// Sum of token usage across all agents.
    pub total_usage: Usage,
    /// Mean iterations per agent; `0.0` when `total_agents == 0`.
    pub avg_iterations: f64,
    /// Mean cost per agent; `0.0` when `total_agents == 0`.
    pub avg_cost_per_agent: f64,
    /// Mean wall-clock time per agent; `0.0` when `total_agents == 0`.
    pub avg_time_per_agent: f64,
}

/// Runs a fixed-size pool of [`AgentLoop`] instances over a list of
/// [`AgentConfig`]s, sharing one `on_event` callback across all of them.
///
/// Each config also carries its own [`Tools`] implementation, since tool
/// sets are usually stateful and per-instance (a search agent's tool set
/// tracks its own search history, say).
#[derive(Debug, Clone)]
pub struct MultiAgentBatch {
    config: MultiAgentBatchConfig,
    agent_loop: Arc<AgentLoop>,
}

/// One agent config paired with the tool set that drives it.
pub struct AgentEntry {
    /// The agent's configuration.
    pub config: AgentConfig,
    /// The tool set this agent's loop should drive.
    pub tools: Arc<dyn Tools>,
}

impl MultiAgentBatch {
    /// Build a multi-agent batch runner sharing one [`AgentLoop`] (and
    /// therefore one [`crate::ports::LlmClient`]) across every agent.
    pub fn new(config: MultiAgentBatchConfig, agent_loop: Arc<AgentLoop>) -> Self {
        Self { config, agent_loop }
    }

    /// Run every entry to completion, concurrency-capped at
    /// `config.max_workers`.
    ///
    /// `on_event` receives every event from every agent, tagged by that
    /// agent's own `agent_id` field — it's the caller's job to demux by id
    /// if it wants a per-agent view. After each agent's [`Event::AgentComplete`],
    /// this also fires a synthetic [`Event::AgentStatusFinal`] so a progress
    /// display can distinguish "finished running" from "final verdict"
    /// without double-counting completions (§4.5 "Progress aggregation").
    #[instrument(level = "info", skip_all, fields(n = entries.len(), max_workers = self.config.max_workers))]
    pub async fn run(&self, entries: Vec<AgentEntry>, on_event: Arc<dyn Fn(Event) + Send + Sync>) -> BatchResult {
        let started_at = std::time::Instant::now();
        let total_agents = entries.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for entry in entries {
            let semaphore = Arc::clone(&semaphore);
            let agent_loop = Arc::clone(&self.agent_loop);
            let on_event = Arc::clone(&on_event);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                let agent_id = entry.config.agent_id.clone();
                let result = agent_loop.run(&entry.config, entry.tools.as_ref(), on_event.as_ref()).await;

                let status = if result.success { "found" } else { "not_found" };
                on_event(Event::AgentStatusFinal {
                    agent_id,
                    status: status.to_owned(),
                });

                result
            });
        }

        let mut results = Vec::with_capacity(total_agents);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    // A panic inside one agent task becomes that agent's
                    // failure; other agents are unaffected (§4.5 "Failure
                    // isolation"). We don't know which agent_id panicked —
                    // the task closure owned it — so the message just names
                    // the join error.
                    error!(%join_err, "agent task panicked");
                    results.push(AgentResult {
                        success: false,
                        iterations: 0,
                        total_cost_usd: 0.0,
                        usage: Usage::default(),
                        execution_time: std::time::Duration::ZERO,
                        final_messages: Vec::new(),
                        run_log_path: None,
                        error_message: Some(format!("agent task panicked: {join_err}")),
                    });
                }
            }
        }

        summarize(results, total_agents, started_at.elapsed())
    }
}

fn summarize(results: Vec<AgentResult>, total_agents: usize, total_time: std::time::Duration) -> BatchResult {
    let successful = results.iter().filter(|r| r.success).count();
    let failed = results.len() - successful;
    let total_cost_usd: f64 = results.iter().map(|r| r.total_cost_usd).sum();
    let mut total_usage = Usage::default();
    for result in &results {
        total_usage += result.usage;
    }
    let count = results.len() as f64;
    let avg_iterations = if count > 0.0 {
        results.iter().map(|r| r.iterations as f64).sum::<f64>() / count
    } else {
        0.0
    };
    let avg_cost_per_agent = if count > 0.0 { total_cost_usd / count } else { 0.0 };
    let avg_time_per_agent = if count > 0.0 { total_time.as_secs_f64() / count } else { 0.0 };

    BatchResult {
        results,
        total_agents,
        successful,
        failed,
        total_cost_usd,
        total_time,
        total_usage,
        avg_iterations,
        avg_cost_per_agent,
        avg_time_per_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{EchoTools, NullTools},
        error::EngineError,
        model::{LlmResult, Message, Request, Usage as ModelUsage},
        ports::LlmClient,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct AlwaysSucceedsClient;

    #[async_trait]
    impl LlmClient for AlwaysSucceedsClient {
        async fn call(&self, request: &Request, _model: &str) -> Result<LlmResult, EngineError> {
            Ok(LlmResult {
                request_id: request.id.clone(),
                success: true,
                response: "done".to_owned(),
                usage: ModelUsage { prompt_tokens: 3, completion_tokens: 2, reasoning_tokens: 0 },
                estimated_usage: false,
                cost_usd: 0.0005,
                queue_time: std::time::Duration::ZERO,
                execution_time: std::time::Duration::from_millis(1),
                ttft: None,
                attempts: 1,
                model_used: Some(request.model.clone()),
                error_kind: None,
                error_message: None,
                retry_after: None,
                tool_calls: None,
                reasoning_details: None,
                request: None,
            })
        }

        async fn call_with_tools(&self, request: &Request, model: &str, _tools: &[Value]) -> Result<LlmResult, EngineError> {
            self.call(request, model).await
        }
    }

    fn entry(id: &str) -> AgentEntry {
        AgentEntry {
            config: AgentConfig::new(id, "gpt-4o", vec![Message::text("user", "go")]),
            tools: Arc::new(NullTools),
        }
    }

    #[tokio::test]
    async fn runs_twenty_agents_with_five_workers() {
        let llm_client: Arc<dyn LlmClient> = Arc::new(AlwaysSucceedsClient);
        let agent_loop = Arc::new(AgentLoop::new(llm_client, None, None));
        let batch = MultiAgentBatch::new(MultiAgentBatchConfig { max_workers: 5 }, agent_loop);

        let entries: Vec<_> = (0..20).map(|i| entry(&format!("agent-{i}"))).collect();
        let status_count = Arc::new(AtomicU32::new(0));
        let status_count_clone = Arc::clone(&status_count);
        let on_event: Arc<dyn Fn(Event) + Send + Sync> = Arc::new(move |event| {
            if matches!(event, Event::AgentStatusFinal { .. }) {
                status_count_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = batch.run(entries, on_event).await;
        assert_eq!(result.total_agents, 20);
        assert_eq!(result.successful, 20);
        assert_eq!(result.failed, 0);
        assert_eq!(status_count.load(Ordering::SeqCst), 20);
        let expected_avg = result.results.iter().map(|r| r.iterations as f64).sum::<f64>() / 20.0;
        assert!((result.avg_iterations - expected_avg).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_batch_has_zero_averages_not_a_panic() {
        let llm_client: Arc<dyn LlmClient> = Arc::new(AlwaysSucceedsClient);
        let agent_loop = Arc::new(AgentLoop::new(llm_client, None, None));
        let batch = MultiAgentBatch::new(MultiAgentBatchConfig::default(), agent_loop);

        let result = batch.run(Vec::new(), Arc::new(|_event| {})).await;
        assert_eq!(result.total_agents, 0);
        assert_eq!(result.avg_iterations, 0.0);
        assert_eq!(result.avg_cost_per_agent, 0.0);
        assert_eq!(result.avg_time_per_agent, 0.0);
    }

    #[tokio::test]
    async fn a_tool_driven_agent_runs_alongside_null_tools_agents() {
        let llm_client: Arc<dyn LlmClient> = Arc::new(AlwaysSucceedsClient);
        let agent_loop = Arc::new(AgentLoop::new(llm_client, None, None));
        let batch = MultiAgentBatch::new(MultiAgentBatchConfig { max_workers: 2 }, agent_loop);

        let mut entries = vec![entry("plain-1"), entry("plain-2")];
        entries.push(AgentEntry {
            config: AgentConfig::new("echo-1", "gpt-4o", vec![Message::text("user", "go")]),
            tools: Arc::new(EchoTools::new(0)),
        });

        let result = batch.run(entries, Arc::new(|_event| {})).await;
        assert_eq!(result.total_agents, 3);
        assert_eq!(result.successful, 3);
    }
}
