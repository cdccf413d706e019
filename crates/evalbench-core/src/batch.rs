//! Sequential batch runs: one prompt template, many substitution values.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tracing::{Instrument as _, info, info_span, warn};

use crate::content::InputPayload;
use crate::credentials::Credentials;
use crate::driver::CallDriver;
use crate::errors::{CallFailure, EvalError};
use crate::model::{GenerationParams, ModelTarget};
use crate::outcome::{CallOutcome, CallStatus};
use crate::persist::{RecordSink, log_persist_failure};

/// Placeholder replaced by each item's value.
pub const KEYWORD_PLACEHOLDER: &str = "{keyword}";

/// Characters of output kept in `ItemResult::output_preview`.
pub const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Replaces every `{keyword}` in `template` with `item`.
pub fn render_prompt(template: &str, item: &str) -> String {
    template.replace(KEYWORD_PLACEHOLDER, item)
}

#[derive(Clone, Debug)]
pub struct BatchRequest {
    pub items: Vec<String>,
    pub template: String,
    pub target: ModelTarget,
    pub params: GenerationParams,
    pub credentials: Option<Credentials>,
}

impl BatchRequest {
    pub fn new(target: ModelTarget, template: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            items,
            template: template.into(),
            target,
            params: GenerationParams::default(),
            credentials: None,
        }
    }

    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-item status. Timeouts count as failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Failed,
}

impl From<CallStatus> for ItemStatus {
    fn from(status: CallStatus) -> Self {
        match status {
            CallStatus::Success => ItemStatus::Success,
            CallStatus::Failed | CallStatus::TimedOut => ItemStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    /// Sent before the item's call starts.
    Progress {
        completed_count: usize,
        total_count: usize,
        index: usize,
        current_item: String,
    },
    ItemResult {
        index: usize,
        item: String,
        output_preview: String,
        status: ItemStatus,
        input_tokens: u64,
        output_tokens: u64,
        elapsed_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Exactly once, last.
    Done {
        completed_count: usize,
        failed_count: usize,
        status: BatchStatus,
    },
}

/// One processed item, as persisted.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchItemRecord {
    pub index: usize,
    pub item: String,
    pub prompt: String,
    pub outcome: CallOutcome,
}

/// Progress of a batch at one point in time.
///
/// Persisted after every item (with `last_item` set) and once more when the
/// batch ends.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: uuid::Uuid,
    pub model_id: String,
    pub template: String,
    pub total_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_item: Option<BatchItemRecord>,
    pub recorded_at: DateTime<Utc>,
}

/// Final counters of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSummary {
    pub completed_count: usize,
    pub failed_count: usize,
    pub status: BatchStatus,
}

/// Requests that a running batch stop before its next item.
///
/// The item in flight finishes normally; the batch then ends with
/// `BatchStatus::Cancelled`.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Runs batches on top of a `CallDriver`, one item at a time.
#[derive(Clone)]
pub struct BatchSequencer {
    driver: CallDriver,
    sink: Arc<dyn RecordSink>,
}

impl BatchSequencer {
    pub fn new(driver: CallDriver, sink: Arc<dyn RecordSink>) -> Self {
        Self { driver, sink }
    }

    /// Returns the batch as a pull-driven event stream.
    ///
    /// Nothing runs until the stream is polled, and each poll advances the
    /// batch by one event: an item's call starts only after its `Progress`
    /// has been read. Dropping the stream stops the batch.
    pub fn run(&self, request: BatchRequest) -> BatchStream {
        let batch_id = uuid::Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let span = info_span!("batch", %batch_id, model = %request.target.model_id);
        let run = BatchRun {
            batch_id,
            driver: self.driver.clone(),
            sink: self.sink.clone(),
            cancel: cancel_rx,
            request,
            next_index: 0,
            completed_count: 0,
            failed_count: 0,
            step: Step::Start,
        };
        let events = stream::unfold(run, move |mut run| {
            let span = span.clone();
            async move {
                let event = run.advance().instrument(span).await?;
                Some((event, run))
            }
        });

        BatchStream {
            batch_id,
            events: Box::pin(events),
            cancel: CancelHandle {
                tx: Arc::new(cancel_tx),
            },
            status: BatchStatus::Pending,
        }
    }
}

enum Step {
    Start,
    NextItem,
    RunItem { index: usize, item: String },
    Finish(BatchStatus),
    Over,
}

struct BatchRun {
    batch_id: uuid::Uuid,
    driver: CallDriver,
    sink: Arc<dyn RecordSink>,
    cancel: watch::Receiver<bool>,
    request: BatchRequest,
    next_index: usize,
    completed_count: usize,
    failed_count: usize,
    step: Step,
}

impl BatchRun {
    /// Produces the next event, or `None` once `Done` has been returned.
    async fn advance(&mut self) -> Option<BatchEvent> {
        let total_count = self.request.items.len();
        loop {
            match std::mem::replace(&mut self.step, Step::Over) {
                Step::Start => {
                    info!(total_count, "starting batch");
                    self.step = Step::NextItem;
                }
                Step::NextItem => {
                    let cancelled = *self.cancel.borrow();
                    if cancelled {
                        info!(completed_count = self.completed_count, total_count, "batch cancelled");
                        self.step = Step::Finish(BatchStatus::Cancelled);
                        continue;
                    }
                    let index = self.next_index;
                    let Some(item) = self.request.items.get(index).cloned() else {
                        self.step = Step::Finish(BatchStatus::Completed);
                        continue;
                    };
                    self.next_index += 1;
                    self.step = Step::RunItem {
                        index,
                        item: item.clone(),
                    };
                    return Some(BatchEvent::Progress {
                        completed_count: self.completed_count,
                        total_count,
                        index,
                        current_item: item,
                    });
                }
                Step::RunItem { index, item } => {
                    let event = self
                        .run_item(index, item)
                        .instrument(info_span!("item", index))
                        .await;
                    self.step = Step::NextItem;
                    return Some(event);
                }
                Step::Finish(status) => {
                    info!(
                        completed_count = self.completed_count,
                        failed_count = self.failed_count,
                        status = status.as_str(),
                        "batch finished"
                    );
                    let snapshot = self.snapshot(status, None);
                    log_persist_failure("batch", self.sink.persist_batch(&snapshot).await);
                    return Some(BatchEvent::Done {
                        completed_count: self.completed_count,
                        failed_count: self.failed_count,
                        status,
                    });
                }
                Step::Over => return None,
            }
        }
    }

    async fn run_item(&mut self, index: usize, item: String) -> BatchEvent {
        let prompt = render_prompt(&self.request.template, &item);
        let outcome = self.call(&prompt).await;

        self.completed_count += 1;
        let status = ItemStatus::from(outcome.status);
        if status == ItemStatus::Failed {
            self.failed_count += 1;
            warn!(index, item = %item, error = ?outcome.error, "batch item failed");
        }

        let event = BatchEvent::ItemResult {
            index,
            item: item.clone(),
            output_preview: outcome.output_preview(OUTPUT_PREVIEW_CHARS),
            status,
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            elapsed_ms: outcome.elapsed_ms,
            error: outcome.error.clone(),
        };
        let snapshot = self.snapshot(
            BatchStatus::Running,
            Some(BatchItemRecord {
                index,
                item,
                prompt,
                outcome,
            }),
        );
        log_persist_failure("batch", self.sink.persist_batch(&snapshot).await);
        event
    }

    async fn call(&self, prompt: &str) -> CallOutcome {
        let request = &self.request;
        let started = self
            .driver
            .run(
                &request.target,
                &InputPayload::text(prompt),
                &request.params,
                request.credentials.as_ref(),
            )
            .await;
        let call = match started {
            Ok(call) => call,
            Err(err) => return CallOutcome::failed_before_start(CallFailure::from(&err).to_string()),
        };
        call.finish()
            .await
            .unwrap_or_else(|err| CallOutcome::failed_before_start(err.to_string()))
    }

    fn snapshot(&self, status: BatchStatus, last_item: Option<BatchItemRecord>) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.batch_id,
            model_id: self.request.target.model_id.clone(),
            template: self.request.template.clone(),
            total_count: self.request.items.len(),
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            status,
            last_item,
            recorded_at: Utc::now(),
        }
    }
}

/// Event stream of a batch.
pub struct BatchStream {
    batch_id: uuid::Uuid,
    events: BoxStream<'static, BatchEvent>,
    cancel: CancelHandle,
    status: BatchStatus,
}

impl BatchStream {
    pub fn batch_id(&self) -> uuid::Uuid {
        self.batch_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Status as observed through the events read so far.
    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        let event = self.events.next().await;
        if let Some(event) = &event {
            self.observe(event);
        }
        event
    }

    fn observe(&mut self, event: &BatchEvent) {
        self.status = match event {
            BatchEvent::Done { status, .. } => *status,
            _ => BatchStatus::Running,
        };
    }

    /// Drives the batch to the end and returns the final counters.
    pub async fn finish(mut self) -> Result<BatchSummary, EvalError> {
        while let Some(event) = self.next_event().await {
            if let BatchEvent::Done {
                completed_count,
                failed_count,
                status,
            } = event
            {
                return Ok(BatchSummary {
                    completed_count,
                    failed_count,
                    status,
                });
            }
        }
        Err(EvalError::protocol_msg(format!(
            "batch {} closed without a Done event",
            self.batch_id
        )))
    }
}

impl futures::Stream for BatchStream {
    type Item = BatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.events.poll_next_unpin(cx);
        if let Poll::Ready(Some(event)) = &polled {
            self.observe(event);
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::testing::*;
    use crate::errors::ProviderError;
    use crate::persist::testing::MemorySink;

    fn sequencer(provider: Arc<ScriptedProvider>, sink: Arc<MemorySink>) -> BatchSequencer {
        BatchSequencer::new(driver_with(provider, Duration::from_secs(60)), sink)
    }

    fn request(items: &[&str]) -> BatchRequest {
        BatchRequest::new(
            ModelTarget::new("qwen-turbo"),
            "Write a slogan about {keyword}.",
            items.iter().map(|s| s.to_string()).collect(),
        )
    }

    async fn collect(mut stream: BatchStream) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn render_replaces_every_placeholder() {
        assert_eq!(
            render_prompt("{keyword} and {keyword}", "tea"),
            "tea and tea"
        );
        assert_eq!(render_prompt("no placeholder", "tea"), "no placeholder");
    }

    #[tokio::test]
    async fn failing_item_is_counted_and_batch_continues() {
        let provider = Arc::new(ScriptedProvider::default().prompt(
            "Write a slogan about coffee.",
            Script::Reject(ProviderError::provider("scripted", "content blocked", Some(400))),
        ));
        let sink = Arc::new(MemorySink::default());
        let events = collect(sequencer(provider.clone(), sink.clone()).run(request(&[
            "tea", "coffee", "juice",
        ])))
        .await;

        let results: Vec<(usize, ItemStatus)> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::ItemResult { index, status, .. } => Some((*index, *status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            results,
            vec![
                (0, ItemStatus::Success),
                (1, ItemStatus::Failed),
                (2, ItemStatus::Success)
            ]
        );
        assert_eq!(
            events.last(),
            Some(&BatchEvent::Done {
                completed_count: 3,
                failed_count: 1,
                status: BatchStatus::Completed
            })
        );
        assert_eq!(
            events.iter().filter(|e| matches!(e, BatchEvent::Done { .. })).count(),
            1
        );

        let prompts: Vec<String> = provider
            .seen
            .lock()
            .expect("seen")
            .iter()
            .filter_map(|r| r.text.clone())
            .collect();
        assert_eq!(prompts[1], "Write a slogan about coffee.");

        let snapshots = sink.batches.lock().expect("batches");
        assert_eq!(snapshots.len(), 4);
        assert_eq!(
            snapshots[1].last_item.as_ref().map(|i| i.item.as_str()),
            Some("coffee")
        );
        assert_eq!(snapshots[3].status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn progress_precedes_each_result_and_counts_increase() {
        let provider = Arc::new(ScriptedProvider::default());
        let events = collect(
            sequencer(provider, Arc::new(MemorySink::default())).run(request(&["a", "b"])),
        )
        .await;

        let mut expected_completed = 0;
        let mut last_was_progress = false;
        for event in &events {
            match event {
                BatchEvent::Progress {
                    completed_count,
                    total_count,
                    ..
                } => {
                    assert_eq!(*completed_count, expected_completed);
                    assert_eq!(*total_count, 2);
                    last_was_progress = true;
                }
                BatchEvent::ItemResult { .. } => {
                    assert!(last_was_progress);
                    expected_completed += 1;
                    last_was_progress = false;
                }
                BatchEvent::Done {
                    completed_count,
                    failed_count,
                    ..
                } => {
                    assert_eq!(*completed_count, 2);
                    assert!(failed_count <= completed_count);
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure_and_keeps_partial_preview() {
        let provider = Arc::new(ScriptedProvider::default().prompt(
            "Write a slogan about slow.",
            Script::Stall(vec![crate::provider::ChatChunk::text("half a slo")]),
        ));
        let events = collect(
            sequencer(provider, Arc::new(MemorySink::default())).run(request(&["slow"])),
        )
        .await;
        match &events[1] {
            BatchEvent::ItemResult {
                status,
                output_preview,
                error,
                ..
            } => {
                assert_eq!(*status, ItemStatus::Failed);
                assert_eq!(output_preview, "half a slo");
                assert!(error.as_deref().is_some_and(|e| e.contains("timed out")));
            }
            other => panic!("expected item result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_after_first_progress_runs_only_that_item() {
        let provider = Arc::new(ScriptedProvider::default());
        let sink = Arc::new(MemorySink::default());
        let mut stream = sequencer(provider.clone(), sink.clone()).run(request(&["a", "b", "c"]));
        assert_eq!(stream.status(), BatchStatus::Pending);
        let cancel = stream.cancel_handle();

        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            if matches!(event, BatchEvent::Progress { index: 0, .. }) {
                cancel.cancel();
            }
            events.push(event);
        }

        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], BatchEvent::ItemResult { index: 0, .. }));
        assert_eq!(
            events[2],
            BatchEvent::Done {
                completed_count: 1,
                failed_count: 0,
                status: BatchStatus::Cancelled
            }
        );
        assert!(cancel.is_cancelled());
        assert_eq!(stream.status(), BatchStatus::Cancelled);
        assert_eq!(provider.seen.lock().expect("seen").len(), 1);

        let snapshots = sink.batches.lock().expect("batches");
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[1].status, BatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_before_first_poll_runs_nothing() {
        let provider = Arc::new(ScriptedProvider::default());
        let stream = sequencer(provider.clone(), Arc::new(MemorySink::default()))
            .run(request(&["a", "b"]));
        stream.cancel_handle().cancel();
        let summary = stream.finish().await.expect("summary");
        assert_eq!(
            summary,
            BatchSummary {
                completed_count: 0,
                failed_count: 0,
                status: BatchStatus::Cancelled
            }
        );
        assert!(provider.seen.lock().expect("seen").is_empty());
    }

    #[tokio::test]
    async fn call_starts_only_when_the_result_is_pulled() {
        let provider = Arc::new(ScriptedProvider::default());
        let sink = Arc::new(MemorySink::default());
        let mut stream = sequencer(provider.clone(), sink.clone()).run(request(&["a", "b"]));
        assert!(provider.seen.lock().expect("seen").is_empty());

        let first = stream.next_event().await;
        assert!(matches!(first, Some(BatchEvent::Progress { index: 0, .. })));
        assert!(provider.seen.lock().expect("seen").is_empty());

        drop(stream);
        assert!(provider.seen.lock().expect("seen").is_empty());
        assert!(sink.batches.lock().expect("batches").is_empty());
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let summary = sequencer(
            Arc::new(ScriptedProvider::default()),
            Arc::new(MemorySink::default()),
        )
        .run(request(&[]))
        .finish()
        .await
        .expect("summary");
        assert_eq!(
            summary,
            BatchSummary {
                completed_count: 0,
                failed_count: 0,
                status: BatchStatus::Completed
            }
        );
    }
}
