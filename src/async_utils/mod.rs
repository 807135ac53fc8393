//! Small async plumbing shared across the crate.
//!
//! Kept intentionally thin: most of the concurrency architecture lives in
//! [`crate::worker_pool`] and [`crate::multi_agent`] themselves, not here.

use std::pin::Pin;

use futures::Stream;

pub mod io;

/// A boxed, type-erased stream.
pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;
