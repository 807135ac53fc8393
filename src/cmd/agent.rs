//! The `agent` subcommand: drive one or many tool-calling agents (C4/C5)
//! against a JSONL file of starting prompts.
//!
//! Tool execution itself is out of scope for this crate (§ Non-goals);
//! [`EchoTools`](crate::agent::EchoTools) stands in as a minimal tool set so
//! the demo exercises the real loop and batch machinery end to end.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use clap::Args;
use futures::TryStreamExt as _;

use crate::{
    agent::{AgentConfig, AgentLoop, EchoTools, Tools},
    async_utils::io::read_jsonl,
    cost::LiteLlmCostCalculator,
    model::Message,
    multi_agent::{AgentEntry, MultiAgentBatch, MultiAgentBatchConfig},
    openai_client::OpenAiCompatibleClient,
    prelude::*,
    storage::{FsStageStorage, InMemoryMetricsManager},
    ui::{AgentBoard, Ui},
};

/// One starting prompt for an agent run, as read from the input file.
#[derive(Debug, Clone, Deserialize)]
struct AgentTask {
    /// An id for this agent, used to tag events and the run log file name.
    agent_id: String,
    /// The user's initial prompt.
    prompt: String,
    /// How many tool calls `EchoTools` should allow before reporting
    /// completion. Defaults to 1.
    #[serde(default = "default_tool_calls")]
    tool_calls: u32,
}

fn default_tool_calls() -> u32 {
    1
}

/// `agent` command line arguments.
#[derive(Debug, Args)]
pub struct AgentOpts {
    /// Input tasks, one JSON [`AgentTask`] per line.
    pub input_path: PathBuf,

    /// Model to use.
    #[clap(short = 'm', long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// Maximum tool-calling iterations per agent.
    #[clap(long, default_value = "15")]
    pub max_iterations: u32,

    /// How many agents may run concurrently.
    #[clap(short = 'w', long, default_value = "5")]
    pub max_workers: usize,

    /// Directory to write per-agent run logs under. If unset, run logs
    /// aren't written.
    #[clap(long)]
    pub run_log_dir: Option<PathBuf>,
}

/// Run the `agent` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_agent(ui: &Ui, opts: &AgentOpts) -> Result<()> {
    let tasks: Vec<AgentTask> = read_jsonl::<AgentTask>(&opts.input_path).await?.try_collect().await?;

    let board = Arc::new(AgentBoard::new(ui, tasks.len(), opts.max_workers, 3.0));
    // `AgentResult` doesn't carry an `agent_id` (results come back in
    // completion order, not submission order — see `BatchResult::results`),
    // so we recover the per-agent final verdict from `AgentStatusFinal`
    // events instead, for the summary printed below.
    let final_statuses: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
    let on_event: Arc<dyn Fn(crate::events::Event) + Send + Sync> = {
        let board = Arc::clone(&board);
        let final_statuses = Arc::clone(&final_statuses);
        Arc::new(move |event| {
            if let crate::events::Event::AgentStatusFinal { agent_id, status } = &event {
                final_statuses.lock().expect("not poisoned").insert(agent_id.clone(), status.clone());
            }
            board.on_event(&event);
        })
    };

    let storage: Option<Arc<dyn crate::ports::StageStorage>> = opts
        .run_log_dir
        .as_ref()
        .map(|dir| Arc::new(FsStageStorage::new(dir.clone())) as Arc<dyn crate::ports::StageStorage>);
    let metrics: Arc<dyn crate::ports::MetricsManager> = Arc::new(InMemoryMetricsManager::new());

    let llm_client = Arc::new(
        OpenAiCompatibleClient::new(Arc::new(LiteLlmCostCalculator::empty()), on_event.clone())
            .context("failed to build LLM client")?,
    );
    let agent_loop = Arc::new(AgentLoop::new(llm_client, storage, Some(metrics)));

    let batch = MultiAgentBatch::new(MultiAgentBatchConfig { max_workers: opts.max_workers }, agent_loop);

    let entries: Vec<AgentEntry> = tasks
        .into_iter()
        .map(|task| {
            board.register(&task.agent_id, opts.max_iterations);
            let mut config = AgentConfig::new(task.agent_id, opts.model.as_str(), vec![Message::text("user", task.prompt)]);
            config.max_iterations = opts.max_iterations;
            AgentEntry {
                config,
                tools: Arc::new(EchoTools::new(task.tool_calls)) as Arc<dyn Tools>,
            }
        })
        .collect();

    let result = batch.run(entries, on_event).await;
    board.finish();

    info!(
        total_agents = result.total_agents,
        successful = result.successful,
        failed = result.failed,
        total_cost_usd = result.total_cost_usd,
        avg_iterations = result.avg_iterations,
        "agent batch finished"
    );

    let final_statuses = final_statuses.lock().expect("not poisoned");
    for (agent_id, status) in final_statuses.iter() {
        println!("{}", json!({"agent_id": agent_id, "status": status}));
    }

    Ok(())
}
