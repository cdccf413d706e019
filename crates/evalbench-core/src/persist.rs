//! Record-keeping contract for finished calls, comparisons and batch progress.
//!
//! Sinks are fire-and-forget from the caller's point of view: a failing sink
//! is logged and never changes what the event stream reports.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::batch::BatchSnapshot;
use crate::compare::ComparisonResult;
use crate::errors::EvalError;
use crate::model::GenerationParams;
use crate::outcome::CallOutcome;

/// One finished single-mode call.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallRecord {
    pub call_id: uuid::Uuid,
    pub target_name: String,
    pub model_id: String,
    pub input_text: Option<String>,
    pub media_count: usize,
    pub params: GenerationParams,
    pub outcome: CallOutcome,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    async fn persist_call(&self, record: &CallRecord) -> Result<(), EvalError>;

    async fn persist_comparison(&self, result: &ComparisonResult) -> Result<(), EvalError>;

    async fn persist_batch(&self, snapshot: &BatchSnapshot) -> Result<(), EvalError>;
}

/// Discards every record.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

#[async_trait::async_trait]
impl RecordSink for NoopSink {
    async fn persist_call(&self, _record: &CallRecord) -> Result<(), EvalError> {
        Ok(())
    }

    async fn persist_comparison(&self, _result: &ComparisonResult) -> Result<(), EvalError> {
        Ok(())
    }

    async fn persist_batch(&self, _snapshot: &BatchSnapshot) -> Result<(), EvalError> {
        Ok(())
    }
}

#[derive(serde::Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
enum Line<'a> {
    Call(&'a CallRecord),
    Comparison(&'a ComparisonResult),
    Batch(&'a BatchSnapshot),
}

/// Read side of `Line`; only batch snapshots are decoded.
#[derive(serde::Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
enum StoredLine {
    Call(serde::de::IgnoredAny),
    Comparison(serde::de::IgnoredAny),
    Batch(BatchSnapshot),
}

/// Appends one JSON object per record to a file.
///
/// Lines look like `{"kind":"call","record":{...}}`. Appends from concurrent
/// tasks are serialized so lines never interleave.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every batch snapshot in file order.
    ///
    /// Blank lines are skipped; a line that does not decode is an error
    /// naming its line number.
    pub async fn read_batch_snapshots(&self) -> Result<Vec<BatchSnapshot>, EvalError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| EvalError::Persist(format!("{}: {e}", self.path.display())))?;
        let mut snapshots = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let stored: StoredLine = serde_json::from_str(line).map_err(|e| {
                EvalError::Persist(format!("{}:{}: {e}", self.path.display(), number + 1))
            })?;
            if let StoredLine::Batch(snapshot) = stored {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn append(&self, line: Line<'_>) -> Result<(), EvalError> {
        let mut encoded = serde_json::to_vec(&line)
            .map_err(|e| EvalError::Persist(format!("failed to encode record: {e}")))?;
        encoded.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EvalError::Persist(format!("{}: {e}", parent.display())))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EvalError::Persist(format!("{}: {e}", self.path.display())))?;
        file.write_all(&encoded)
            .await
            .map_err(|e| EvalError::Persist(format!("{}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| EvalError::Persist(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), bytes = encoded.len(), "appended record");
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordSink for JsonlSink {
    async fn persist_call(&self, record: &CallRecord) -> Result<(), EvalError> {
        self.append(Line::Call(record)).await
    }

    async fn persist_comparison(&self, result: &ComparisonResult) -> Result<(), EvalError> {
        self.append(Line::Comparison(result)).await
    }

    async fn persist_batch(&self, snapshot: &BatchSnapshot) -> Result<(), EvalError> {
        self.append(Line::Batch(snapshot)).await
    }
}

pub(crate) fn log_persist_failure(kind: &'static str, result: Result<(), EvalError>) {
    if let Err(err) = result {
        warn!(kind, error = %err, "failed to persist record");
    }
}
