//! Side-by-side comparison of two targets on one shared input.
//!
//! Both groups run as independent tasks feeding one bounded channel. A
//! supervisor waits for both, persists the result once, sends
//! `ComparisonEvent::Finished` and drops the last sender, which closes the
//! stream.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::content::InputPayload;
use crate::credentials::Credentials;
use crate::driver::{CallDriver, PreparedInput};
use crate::errors::{CallFailure, EvalError};
use crate::model::{GenerationParams, ModelTarget};
use crate::outcome::CallOutcome;
use crate::persist::{RecordSink, log_persist_failure};
use crate::stream::{Group, GroupEvent, StreamEvent};

/// Target, parameters and optional explicit credentials for one group.
#[derive(Clone, Debug)]
pub struct ComparisonGroupSpec {
    pub target: ModelTarget,
    pub params: GenerationParams,
    pub credentials: Option<Credentials>,
}

impl ComparisonGroupSpec {
    pub fn new(target: ModelTarget) -> Self {
        Self {
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
pub enum ComparisonStatus {
    Running,
    /// Both groups succeeded.
    Completed,
    Failed,
}

impl ComparisonStatus {
    pub fn from_outcomes(outcomes: &[CallOutcome; 2]) -> Self {
        if outcomes.iter().all(|o| o.status.is_success()) {
            ComparisonStatus::Completed
        } else {
            ComparisonStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComparisonStatus::Running => "running",
            ComparisonStatus::Completed => "completed",
            ComparisonStatus::Failed => "failed",
        }
    }
}

/// Aggregate of a finished comparison, indexed by group.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ComparisonResult {
    pub comparison_id: uuid::Uuid,
    pub status: ComparisonStatus,
    pub model_ids: [String; 2],
    pub input_text: Option<String>,
    pub outcomes: [CallOutcome; 2],
    pub recorded_at: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn outcome(&self, group: Group) -> &CallOutcome {
        &self.outcomes[group.index()]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ComparisonEvent {
    Group(GroupEvent),
    /// Last item of every comparison stream.
    Finished(ComparisonResult),
}

/// Runs comparisons on top of a `CallDriver`.
#[derive(Clone)]
pub struct ComparisonOrchestrator {
    driver: CallDriver,
    sink: Arc<dyn RecordSink>,
}

impl ComparisonOrchestrator {
    pub fn new(driver: CallDriver, sink: Arc<dyn RecordSink>) -> Self {
        Self { driver, sink }
    }

    /// Starts both groups on the shared input.
    ///
    /// Media is materialized once up front; failing that is the only error
    /// returned here. Per-group setup failures (such as missing credentials)
    /// surface as that group's `Error` event.
    pub async fn run(
        &self,
        groups: [ComparisonGroupSpec; 2],
        input: &InputPayload,
    ) -> Result<ComparisonStream, EvalError> {
        let prepared = Arc::new(self.driver.prepare(input).await?);
        let comparison_id = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.driver.buffer_capacity());
        let model_ids = [
            groups[0].target.model_id.clone(),
            groups[1].target.model_id.clone(),
        ];
        info!(%comparison_id, model_0 = %model_ids[0], model_1 = %model_ids[1], "starting comparison");

        let [spec_0, spec_1] = groups;
        let handles = [
            self.spawn_group(Group::Zero, spec_0, prepared.clone(), tx.clone(), comparison_id),
            self.spawn_group(Group::One, spec_1, prepared, tx.clone(), comparison_id),
        ];

        let supervisor = Supervisor {
            comparison_id,
            model_ids,
            input_text: input.text.clone(),
            sink: self.sink.clone(),
        };
        tokio::spawn(
            supervisor
                .run(handles, tx)
                .instrument(info_span!("comparison", %comparison_id)),
        );

        Ok(ComparisonStream {
            comparison_id,
            rx,
            status: ComparisonStatus::Running,
        })
    }

    fn spawn_group(
        &self,
        group: Group,
        spec: ComparisonGroupSpec,
        prepared: Arc<PreparedInput>,
        tx: mpsc::Sender<ComparisonEvent>,
        comparison_id: uuid::Uuid,
    ) -> JoinHandle<CallOutcome> {
        let driver = self.driver.clone();
        let span = info_span!("group", %comparison_id, group = group.index(), model = %spec.target.model_id);
        tokio::spawn(
            async move {
                run_group(driver, group, spec, &prepared, tx).await
            }
            .instrument(span),
        )
    }
}

async fn run_group(
    driver: CallDriver,
    group: Group,
    spec: ComparisonGroupSpec,
    prepared: &PreparedInput,
    tx: mpsc::Sender<ComparisonEvent>,
) -> CallOutcome {
    let mut forward = Forwarder { group, tx, open: true };
    let mut call = match driver.start(
        &spec.target,
        prepared,
        &spec.params,
        spec.credentials.as_ref(),
    ) {
        Ok(call) => call,
        Err(err) => {
            let failure = CallFailure::from(&err);
            warn!(error = %failure, "group could not start");
            forward.send(StreamEvent::from_failure(&failure, 0)).await;
            return CallOutcome::failed_before_start(failure.to_string());
        }
    };

    while let Some(event) = call.next_event().await {
        forward.send(event).await;
    }
    match call.finish().await {
        Ok(outcome) => outcome,
        Err(err) => CallOutcome::failed_before_start(err.to_string()),
    }
}

struct Forwarder {
    group: Group,
    tx: mpsc::Sender<ComparisonEvent>,
    open: bool,
}

impl Forwarder {
    /// Once the consumer is gone the call keeps draining so the result is
    /// still persisted.
    async fn send(&mut self, event: StreamEvent) {
        if !self.open {
            return;
        }
        let item = ComparisonEvent::Group(GroupEvent {
            group: self.group,
            event,
        });
        if self.tx.send(item).await.is_err() {
            debug!(group = self.group.index(), "comparison consumer dropped");
            self.open = false;
        }
    }
}

struct Supervisor {
    comparison_id: uuid::Uuid,
    model_ids: [String; 2],
    input_text: Option<String>,
    sink: Arc<dyn RecordSink>,
}

impl Supervisor {
    async fn run(self, handles: [JoinHandle<CallOutcome>; 2], tx: mpsc::Sender<ComparisonEvent>) {
        let [h0, h1] = handles;
        let (r0, r1) = tokio::join!(h0, h1);
        let outcomes = [joined_outcome(Group::Zero, r0), joined_outcome(Group::One, r1)];
        let status = ComparisonStatus::from_outcomes(&outcomes);
        let result = ComparisonResult {
            comparison_id: self.comparison_id,
            status,
            model_ids: self.model_ids,
            input_text: self.input_text,
            outcomes,
            recorded_at: Utc::now(),
        };
        info!(
            status = status.as_str(),
            group_0 = result.outcomes[0].status.as_str(),
            group_1 = result.outcomes[1].status.as_str(),
            "comparison finished"
        );

        log_persist_failure("comparison", self.sink.persist_comparison(&result).await);
        let _ = tx.send(ComparisonEvent::Finished(result)).await;
    }
}

fn joined_outcome(
    group: Group,
    joined: Result<CallOutcome, tokio::task::JoinError>,
) -> CallOutcome {
    joined.unwrap_or_else(|err| {
        warn!(group = group.index(), error = %err, "group task failed");
        CallOutcome::failed_before_start(format!("group {group} task failed: {err}"))
    })
}

/// Merged event stream of a running comparison.
///
/// Events of one group keep their order; the interleaving between groups
/// follows arrival time.
pub struct ComparisonStream {
    comparison_id: uuid::Uuid,
    rx: mpsc::Receiver<ComparisonEvent>,
    status: ComparisonStatus,
}

impl ComparisonStream {
    pub fn comparison_id(&self) -> uuid::Uuid {
        self.comparison_id
    }

    /// `Running` until the `Finished` item has been read.
    pub fn status(&self) -> ComparisonStatus {
        self.status
    }

    pub async fn next_event(&mut self) -> Option<ComparisonEvent> {
        let item = self.rx.recv().await;
        self.observe(item.as_ref());
        item
    }

    fn observe(&mut self, item: Option<&ComparisonEvent>) {
        if let Some(ComparisonEvent::Finished(result)) = item {
            self.status = result.status;
        }
    }

    /// Drains the stream and returns the aggregate result.
    pub async fn finish(mut self) -> Result<ComparisonResult, EvalError> {
        while let Some(item) = self.next_event().await {
            if let ComparisonEvent::Finished(result) = item {
                return Ok(result);
            }
        }
        Err(EvalError::protocol_msg(format!(
            "comparison {} closed without a result",
            self.comparison_id
        )))
    }
}

impl futures::Stream for ComparisonStream {
    type Item = ComparisonEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(ComparisonEvent::Finished(result))) = &polled {
            self.status = result.status;
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
    use crate::outcome::CallStatus;
    use crate::persist::testing::{FailingSink, MemorySink};
    use crate::provider::ChatChunk;

    fn orchestrator(
        provider: ScriptedProvider,
        sink: Arc<dyn RecordSink>,
    ) -> ComparisonOrchestrator {
        ComparisonOrchestrator::new(driver_with(Arc::new(provider), Duration::from_secs(60)), sink)
    }

    fn groups(model_0: &str, model_1: &str) -> [ComparisonGroupSpec; 2] {
        [
            ComparisonGroupSpec::new(ModelTarget::new(model_0)),
            ComparisonGroupSpec::new(ModelTarget::new(model_1)),
        ]
    }

    async fn collect(mut stream: ComparisonStream) -> (Vec<GroupEvent>, Vec<ComparisonResult>) {
        let mut events = Vec::new();
        let mut finished = Vec::new();
        while let Some(item) = stream.next_event().await {
            match item {
                ComparisonEvent::Group(event) => {
                    assert!(finished.is_empty(), "group event after Finished");
                    events.push(event);
                }
                ComparisonEvent::Finished(result) => finished.push(result),
            }
        }
        (events, finished)
    }

    fn for_group(events: &[GroupEvent], group: Group) -> Vec<StreamEvent> {
        events
            .iter()
            .filter(|e| e.group == group)
            .map(|e| e.event.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_in_one_group_fails_aggregate_only() {
        let sink = Arc::new(MemorySink::default());
        let provider = ScriptedProvider::default()
            .model("fast", hello_chunks())
            .model("slow", Script::Stall(vec![ChatChunk::text("partial")]));
        let stream = orchestrator(provider, sink.clone())
            .run(groups("fast", "slow"), &InputPayload::text("Hello"))
            .await
            .expect("start");
        let (events, finished) = collect(stream).await;

        assert_eq!(finished.len(), 1);
        let result = &finished[0];
        assert_eq!(result.status, ComparisonStatus::Failed);
        assert_eq!(result.outcome(Group::Zero).status, CallStatus::Success);
        assert_eq!(result.outcome(Group::Zero).output_text, "Hello");
        assert_eq!(result.outcome(Group::One).status, CallStatus::TimedOut);
        assert_eq!(result.outcome(Group::One).output_text, "partial");

        let zero = for_group(&events, Group::Zero);
        assert!(matches!(zero.last(), Some(StreamEvent::Done { .. })));
        let one = for_group(&events, Group::One);
        assert!(matches!(
            one.last(),
            Some(StreamEvent::Error {
                is_timeout: true,
                ..
            })
        ));

        let persisted = sink.comparisons.lock().expect("comparisons");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], *result);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_holds_back_both_providers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        const CHUNKS: usize = 2000;
        let pulled_0 = Arc::new(AtomicUsize::new(0));
        let pulled_1 = Arc::new(AtomicUsize::new(0));
        let provider = ScriptedProvider::default()
            .model(
                "m0",
                Script::Counted {
                    pulled: pulled_0.clone(),
                    chunks: CHUNKS,
                },
            )
            .model(
                "m1",
                Script::Counted {
                    pulled: pulled_1.clone(),
                    chunks: CHUNKS,
                },
            );
        let mut stream = orchestrator(provider, Arc::new(MemorySink::default()))
            .run(groups("m0", "m1"), &InputPayload::text("x"))
            .await
            .expect("start");

        // Nobody reads; producers stall once the bounded buffers fill.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let early = pulled_0.load(Ordering::SeqCst) + pulled_1.load(Ordering::SeqCst);
        assert!(early < 100, "providers ran ahead by {early} chunks");

        let first = stream.next_event().await.expect("first event");
        assert!(matches!(first, ComparisonEvent::Group(_)));
        let (events, finished) = collect(stream).await;
        assert_eq!(events.len() + 1, 2 * (CHUNKS + 1));
        assert_eq!(finished[0].status, ComparisonStatus::Completed);
        for group in [Group::Zero, Group::One] {
            assert_eq!(finished[0].outcome(group).output_text.len(), CHUNKS);
        }
        assert_eq!(pulled_0.load(Ordering::SeqCst), CHUNKS);
        assert_eq!(pulled_1.load(Ordering::SeqCst), CHUNKS);
    }

    #[tokio::test]
    async fn per_group_order_matches_standalone_run() {
        let script = || {
            Script::Chunks(vec![
                Ok(ChatChunk::text("a")),
                Ok(ChatChunk::text("b")),
                Ok(ChatChunk::text("c")),
                Ok(ChatChunk::usage(3, 3)),
            ])
        };
        let provider = ScriptedProvider::default()
            .model("m0", script())
            .model("m1", hello_chunks());
        let stream = orchestrator(provider, Arc::new(MemorySink::default()))
            .run(groups("m0", "m1"), &InputPayload::text("x"))
            .await
            .expect("start");
        let (events, finished) = collect(stream).await;
        assert_eq!(finished[0].status, ComparisonStatus::Completed);

        let strip = |events: Vec<StreamEvent>| -> Vec<StreamEvent> {
            events
                .into_iter()
                .map(|e| match e {
                    StreamEvent::Done { .. } => StreamEvent::Done {
                        elapsed_ms: 0,
                        debug_chunks: Vec::new(),
                    },
                    other => other,
                })
                .collect()
        };
        let done = StreamEvent::Done {
            elapsed_ms: 0,
            debug_chunks: Vec::new(),
        };
        assert_eq!(
            strip(for_group(&events, Group::Zero)),
            vec![
                StreamEvent::Token { text: "a".into() },
                StreamEvent::Token { text: "b".into() },
                StreamEvent::Token { text: "c".into() },
                StreamEvent::Usage {
                    input_tokens: 3,
                    output_tokens: 3
                },
                done.clone(),
            ]
        );
        assert_eq!(
            strip(for_group(&events, Group::One)),
            vec![
                StreamEvent::Token { text: "Hel".into() },
                StreamEvent::Token { text: "lo".into() },
                StreamEvent::Usage {
                    input_tokens: 5,
                    output_tokens: 2
                },
                done,
            ]
        );
    }

    #[tokio::test]
    async fn setup_failure_is_confined_to_its_group() {
        let provider = ScriptedProvider::default().model("ok", hello_chunks());
        let mut specs = groups("ok", "custom");
        // A blank explicit key is a configuration error for that group only.
        specs[1].credentials = Some(Credentials::new("", "https://other.test/v1"));
        let result = orchestrator(provider, Arc::new(MemorySink::default()))
            .run(specs, &InputPayload::text("x"))
            .await
            .expect("start")
            .finish()
            .await
            .expect("result");
        assert_eq!(result.status, ComparisonStatus::Failed);
        assert_eq!(result.outcomes[0].status, CallStatus::Success);
        assert_eq!(result.outcomes[1].status, CallStatus::Failed);
        assert!(result.outcomes[1].error.is_some());
    }

    #[tokio::test]
    async fn provider_error_and_failing_sink_still_finish() {
        let provider = ScriptedProvider::default().model(
            "bad",
            Script::Reject(ProviderError::provider("scripted", "quota exceeded", Some(429))),
        );
        let mut stream = orchestrator(provider, Arc::new(FailingSink))
            .run(groups("bad", "good"), &InputPayload::text("x"))
            .await
            .expect("start");
        assert_eq!(stream.status(), ComparisonStatus::Running);
        let mut last = None;
        while let Some(item) = stream.next_event().await {
            last = Some(item);
        }
        assert!(matches!(last, Some(ComparisonEvent::Finished(_))));
        assert_eq!(stream.status(), ComparisonStatus::Failed);
    }
}
