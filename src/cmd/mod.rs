//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{async_utils::BoxedStream, prelude::*};

pub mod agent;
pub mod batch;

/// Common options for subcommands that process a batch of requests.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Number of requests to run concurrently.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// Limit processing to the first N records.
    #[clap(long, alias = "take-first")]
    pub limit: Option<usize>,

    /// Offset the start of processing by N records.
    #[clap(long, default_value = "0")]
    pub offset: usize,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply offset/limit to an input stream of records, before they're
    /// collected into a batch.
    pub fn apply_stream_input_opts<T>(&self, input: BoxedStream<Result<T>>) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        let input = input.skip(self.offset);
        if let Some(limit) = self.limit {
            input.take(limit).boxed()
        } else {
            input.boxed()
        }
    }

    /// Does `failed` out of `total` terminal results exceed the allowed
    /// failure rate?
    pub fn exceeds_allowed_failure_rate(&self, failed: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        (failed as f32 / total as f32) > self.allowed_failure_rate
    }
}
