//! Minimal JSON line I/O.
//!
//! The host pipeline (CSV ingestion, format auto-detection, record
//! counting for progress bars) is out of scope here — this crate only
//! needs to read a batch of [`Request`](crate::model::Request)s from JSONL
//! and write [`LlmResult`](crate::model::LlmResult)s back out, which the
//! demo binary uses directly.

use futures::{Stream, StreamExt as _, TryStreamExt as _};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, BufWriter};
use tokio_stream::wrappers::LinesStream;

use crate::prelude::*;

use super::BoxedStream;

/// Read one JSON value per line from `path`.
pub async fn read_jsonl<T>(path: &Path) -> Result<BoxedStream<Result<T>>>
where
    T: serde::de::DeserializeOwned + Send + 'static,
{
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {path:?}"))?;
    let lines = LinesStream::new(BufReader::new(file).lines());
    Ok(lines
        .map_err(anyhow::Error::from)
        .and_then(|line| async move {
            serde_json::from_str::<T>(&line).with_context(|| format!("failed to parse JSON line: {line:?}"))
        })
        .boxed())
}

/// Write a stream of JSON-serializable values to `path`, one per line.
pub async fn write_jsonl<T, S>(path: &Path, stream: S) -> Result<()>
where
    T: Serialize,
    S: Stream<Item = Result<T>> + Unpin,
{
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {path:?}"))?;
    let mut writer = BufWriter::new(file);
    let mut stream = stream;
    while let Some(item) = stream.next().await {
        let item = item?;
        let line = serde_json::to_string(&item).context("failed to serialize JSON line")?;
        writer.write_all(line.as_bytes()).await.context("failed to write JSON line")?;
        writer.write_all(b"\n").await.context("failed to write newline")?;
    }
    writer.flush().await.context("failed to flush output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn round_trips_jsonl() {
        let dir = std::env::temp_dir().join(format!("llm-batch-engine-io-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("out.jsonl");

        let items: Vec<Result<serde_json::Value>> = vec![Ok(json!({"a": 1})), Ok(json!({"a": 2}))];
        write_jsonl(&path, stream::iter(items)).await.unwrap();

        let read_back: Vec<serde_json::Value> = read_jsonl::<serde_json::Value>(&path)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(read_back, vec![json!({"a": 1}), json!({"a": 2})]);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
