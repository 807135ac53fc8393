//! The `batch` subcommand: run a JSONL file of [`Request`]s through the
//! worker pool (C3) and write a JSONL file of [`LlmResult`]s back out.

use std::sync::Arc;

use clap::Args;
use futures::TryStreamExt as _;

use crate::{
    async_utils::io::{read_jsonl, write_jsonl},
    cost::LiteLlmCostCalculator,
    openai_client::OpenAiCompatibleClient,
    prelude::*,
    rate_limiter::RateLimiter,
    ui::{BatchProgress, Ui},
    worker_pool::{WorkerPool, WorkerPoolConfig},
};

/// `batch` command line arguments.
#[derive(Debug, Args)]
pub struct BatchOpts {
    /// Input requests, one JSON [`crate::model::Request`] per line.
    pub input_path: PathBuf,

    /// Model to use.
    #[clap(short = 'm', long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// Output location, in JSONL format. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Requests per minute the rate limiter allows.
    #[clap(long, default_value = "600")]
    pub requests_per_minute: u32,

    /// Stream-related options.
    #[clap(flatten)]
    pub stream_opts: super::StreamOpts,
}

/// Run the `batch` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_batch(ui: &Ui, opts: &BatchOpts) -> Result<()> {
    let input = read_jsonl::<crate::model::Request>(&opts.input_path).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);
    let requests: Vec<crate::model::Request> = input.try_collect().await?;

    let progress = BatchProgress::new(ui, requests.len());
    let on_event: Arc<dyn Fn(crate::events::Event) + Send + Sync> = {
        let progress = progress.clone();
        Arc::new(move |event| progress.on_event(&event))
    };

    let pool = WorkerPool::new(
        WorkerPoolConfig {
            max_workers: opts.stream_opts.job_count,
            ..Default::default()
        },
        Arc::new(RateLimiter::new(opts.requests_per_minute)),
        Arc::new(
            OpenAiCompatibleClient::new(Arc::new(LiteLlmCostCalculator::empty()), on_event.clone())
                .context("failed to build LLM client")?,
        ),
    );

    let results = pool.process_batch(requests, &opts.model, |_result| {}, on_event).await;
    progress.finish();

    let failed = results.values().filter(|r| !r.success).count();
    let total = results.len();
    if opts.stream_opts.exceeds_allowed_failure_rate(failed, total) {
        warn!(failed, total, "batch exceeded its allowed failure rate");
    }

    let mut ordered: Vec<_> = results.into_values().collect();
    ordered.sort_by(|a, b| a.request_id.cmp(&b.request_id));

    match &opts.output_path {
        Some(path) => {
            let items: Vec<Result<crate::model::LlmResult>> = ordered.into_iter().map(Ok).collect();
            write_jsonl(path, futures::stream::iter(items)).await?;
        }
        None => {
            for result in ordered {
                println!("{}", serde_json::to_string(&result)?);
            }
        }
    }

    Ok(())
}
