//! Default filesystem-backed [`StageStorage`] and in-memory
//! [`MetricsManager`], adapted from the teacher's async file I/O helpers.
//!
//! The engine writes only into the stage directory it's constructed with;
//! callers pass relative paths and this module is the only place that
//! joins them to a root.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    fs,
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    sync::Mutex,
};

use crate::{
    error::EngineError,
    ports::{MetricsManager, StageStorage},
    prelude::*,
};

/// A [`StageStorage`] backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStageStorage {
    root: Arc<PathBuf>,
}

impl FsStageStorage {
    /// Build a storage port rooted at `root`. The directory is created
    /// lazily on first write, not at construction.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    fn resolve(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }
}

#[async_trait]
impl StageStorage for FsStageStorage {
    async fn save_file(&self, relative_path: &str, contents: &[u8]) -> Result<(), EngineError> {
        let path = self.resolve(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {parent:?}"))
                .map_err(EngineError::Storage)?;
        }
        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create file {path:?}"))
            .map_err(EngineError::Storage)?;
        file.write_all(contents)
            .await
            .with_context(|| format!("failed to write file {path:?}"))
            .map_err(EngineError::Storage)?;
        Ok(())
    }

    async fn load_file(&self, relative_path: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.resolve(relative_path);
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open file {path:?}"))
            .map_err(EngineError::Storage)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .with_context(|| format!("failed to read file {path:?}"))
            .map_err(EngineError::Storage)?;
        Ok(buf)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
struct MetricsRow {
    cost_usd: f64,
    elapsed_secs: f64,
    tokens: u64,
    custom: serde_json::Map<String, Value>,
}

/// An in-memory [`MetricsManager`], suitable for agent runs and tests. Rows
/// are never persisted; the host reads them via `get_all` at the end of a
/// run and decides what (if anything) to write to disk.
#[derive(Debug, Default)]
pub struct InMemoryMetricsManager {
    rows: Mutex<HashMap<String, MetricsRow>>,
}

impl InMemoryMetricsManager {
    /// Build an empty metrics manager.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsManager for InMemoryMetricsManager {
    async fn record(
        &self,
        key: &str,
        cost_usd: f64,
        elapsed: Duration,
        tokens: u64,
        custom: serde_json::Map<String, Value>,
        accumulate: bool,
    ) -> Result<(), EngineError> {
        let mut rows = self.rows.lock().await;
        let entry = rows.entry(key.to_owned()).or_default();
        if accumulate {
            entry.cost_usd += cost_usd;
            entry.elapsed_secs += elapsed.as_secs_f64();
            entry.tokens += tokens;
            entry.custom.extend(custom);
        } else {
            entry.cost_usd = cost_usd;
            entry.elapsed_secs = elapsed.as_secs_f64();
            entry.tokens = tokens;
            entry.custom = custom;
        }
        Ok(())
    }

    async fn get_all(&self) -> HashMap<String, Value> {
        let rows = self.rows.lock().await;
        rows.iter()
            .map(|(key, row)| (key.clone(), json!(row)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_storage_round_trips() {
        let dir = tempfile_dir();
        let storage = FsStageStorage::new(&dir);
        storage.save_file("a/b.txt", b"hello").await.unwrap();
        let contents = storage.load_file("a/b.txt").await.unwrap();
        assert_eq!(contents, b"hello");
        fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn metrics_manager_accumulates() {
        let metrics = InMemoryMetricsManager::new();
        metrics
            .record("iteration_0001", 0.01, Duration::from_millis(100), 50, serde_json::Map::new(), false)
            .await
            .unwrap();
        metrics
            .record("iteration_0001", 0.02, Duration::from_millis(50), 25, serde_json::Map::new(), true)
            .await
            .unwrap();
        let all = metrics.get_all().await;
        let row = &all["iteration_0001"];
        assert_eq!(row["tokens"], 75);
        assert!((row["cost_usd"].as_f64().unwrap() - 0.03).abs() < 1e-9);
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir().join(format!("llm-batch-engine-test-{}", uuid::Uuid::new_v4()))
    }
}
