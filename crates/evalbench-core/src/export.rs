//! Tabular export of batch results.

use crate::batch::{BatchItemRecord, BatchSnapshot, ItemStatus};
use crate::errors::EvalError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// One processed batch item, flattened for export.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ExportRow {
    pub index: usize,
    pub item: String,
    pub status: ItemStatus,
    pub output: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

impl From<&BatchItemRecord> for ExportRow {
    fn from(record: &BatchItemRecord) -> Self {
        Self {
            index: record.index,
            item: record.item.clone(),
            status: ItemStatus::from(record.outcome.status),
            output: record.outcome.output_text.clone(),
            input_tokens: record.outcome.input_tokens,
            output_tokens: record.outcome.output_tokens,
            error: record.outcome.error.clone(),
        }
    }
}

const CSV_HEADER: [&str; 6] = ["item", "status", "output", "input_tokens", "output_tokens", "error"];

/// Collects the items of one batch from persisted snapshots, ordered by index.
///
/// With no `batch_id` the batch of the most recent snapshot is used. Returns
/// `None` when there is no matching snapshot.
pub fn batch_items(
    snapshots: &[BatchSnapshot],
    batch_id: Option<uuid::Uuid>,
) -> Option<(uuid::Uuid, Vec<BatchItemRecord>)> {
    let batch_id = batch_id.or_else(|| snapshots.last().map(|s| s.batch_id))?;
    let mut found = false;
    let mut items: Vec<BatchItemRecord> = Vec::new();
    for snapshot in snapshots.iter().filter(|s| s.batch_id == batch_id) {
        found = true;
        if let Some(item) = &snapshot.last_item {
            items.push(item.clone());
        }
    }
    if !found {
        return None;
    }
    items.sort_by_key(|item| item.index);
    items.dedup_by_key(|item| item.index);
    Some((batch_id, items))
}

/// Renders `items` as CSV (header plus one line per item) or a JSON array.
pub fn render(items: &[BatchItemRecord], format: ExportFormat) -> Result<String, EvalError> {
    let rows: Vec<ExportRow> = items.iter().map(ExportRow::from).collect();
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(&rows)
            .map_err(|e| EvalError::Persist(format!("failed to encode export: {e}"))),
        ExportFormat::Csv => Ok(render_csv(&rows)),
    }
}

fn render_csv(rows: &[ExportRow]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for row in rows {
        let status = match row.status {
            ItemStatus::Success => "success",
            ItemStatus::Failed => "failed",
        };
        let fields = [
            csv_field(&row.item),
            status.to_string(),
            csv_field(&row.output),
            row.input_tokens.to_string(),
            row.output_tokens.to_string(),
            csv_field(row.error.as_deref().unwrap_or_default()),
        ];
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
