//! Single-call driver: one model call against one target, end to end.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::content::{InlineMedia, InputPayload};
use crate::credentials::{CredentialStore, Credentials};
use crate::errors::{CallFailure, EvalError};
use crate::media::MediaMaterializer;
use crate::model::{GenerationParams, ModelTarget};
use crate::normalize::{CallClock, normalize};
use crate::outcome::{CallOutcome, OutcomeAccumulator};
use crate::provider::{ChatProvider, ChatRequest};
use crate::stream::StreamEvent;

/// Input whose media has already been turned into inline payloads.
///
/// Comparison runs prepare once and share the result between both groups.
#[derive(Clone, Debug, Default)]
pub struct PreparedInput {
    pub text: Option<String>,
    pub media: Vec<InlineMedia>,
}

/// Executes single calls. Cheap to clone; every call owns its own task,
/// accumulator and channel.
#[derive(Clone)]
pub struct CallDriver {
    provider: Arc<dyn ChatProvider>,
    credentials: Arc<CredentialStore>,
    media: Arc<dyn MediaMaterializer>,
    timeout: Duration,
    buffer_capacity: usize,
}

impl CallDriver {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        credentials: Arc<CredentialStore>,
        media: Arc<dyn MediaMaterializer>,
        timeout: Duration,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            provider,
            credentials,
            media,
            timeout,
            buffer_capacity: buffer_capacity.max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Materializes every media reference of `input`, in order.
    pub async fn prepare(&self, input: &InputPayload) -> Result<PreparedInput, EvalError> {
        let mut media = Vec::with_capacity(input.media.len());
        for item in &input.media {
            media.push(self.media.materialize(item).await?);
        }
        Ok(PreparedInput {
            text: input.text.clone(),
            media,
        })
    }

    /// Prepares `input` and starts the call.
    pub async fn run(
        &self,
        target: &ModelTarget,
        input: &InputPayload,
        params: &GenerationParams,
        explicit: Option<&Credentials>,
    ) -> Result<CallStream, EvalError> {
        let prepared = self.prepare(input).await?;
        self.start(target, &prepared, params, explicit)
    }

    /// Starts a call on already prepared input.
    ///
    /// Credential resolution happens here, so a missing key surfaces as
    /// `EvalError::Config` before any event is produced. Everything after
    /// that point is reported through the returned stream.
    pub fn start(
        &self,
        target: &ModelTarget,
        prepared: &PreparedInput,
        params: &GenerationParams,
        explicit: Option<&Credentials>,
    ) -> Result<CallStream, EvalError> {
        let credentials = self.credentials.resolve(target, explicit)?;
        let request = ChatRequest {
            call_id: uuid::Uuid::new_v4(),
            model_id: target.model_id.clone(),
            credentials,
            text: prepared.text.clone(),
            media: prepared.media.clone(),
            params: params.merged_over(&target.default_params),
        };
        let call_id = request.call_id;

        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let span = info_span!("call", call_id = %call_id, target = %target.name, model = %target.model_id);
        tokio::spawn(
            call_task(
                self.provider.clone(),
                request,
                self.timeout,
                tx,
                outcome_tx,
            )
            .instrument(span),
        );

        Ok(CallStream {
            call_id,
            rx,
            outcome_rx,
            saw_terminal: false,
        })
    }
}

/// Event stream of one running call.
///
/// Consume with `next_event()` (or as a `futures::Stream`), then call
/// `finish()` for the accumulated `CallOutcome`.
pub struct CallStream {
    call_id: uuid::Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    pub(crate) outcome_rx: oneshot::Receiver<CallOutcome>,
    saw_terminal: bool,
}

impl CallStream {
    pub fn call_id(&self) -> uuid::Uuid {
        self.call_id
    }

    /// Waits for the next event. Returns `None` once the call has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await;
        if event.as_ref().is_some_and(StreamEvent::is_terminal) {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events and returns the finalized outcome.
    pub async fn finish(mut self) -> Result<CallOutcome, EvalError> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(event) if event.is_terminal() => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        self.outcome_rx.await.map_err(|_| {
            EvalError::protocol_msg(format!("call {} ended without an outcome", self.call_id))
        })
    }
}

impl futures::Stream for CallStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(Some(event)) = &polled
            && event.is_terminal()
        {
            self.saw_terminal = true;
        }
        polled
    }
}

async fn call_task(
    provider: Arc<dyn ChatProvider>,
    request: ChatRequest,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
    outcome_tx: oneshot::Sender<CallOutcome>,
) {
    let clock = CallClock::start(timeout);
    let mut acc = OutcomeAccumulator::new();
    debug!(media = request.media.len(), timeout_secs = timeout.as_secs(), "starting call");

    let opened = tokio::time::timeout_at(clock.deadline, provider.open_stream(request)).await;
    let chunks = match opened {
        Ok(Ok(chunks)) => chunks,
        Ok(Err(err)) => {
            warn!(error = %err, "provider rejected call");
            let event = StreamEvent::from_failure(&CallFailure::from(&err), clock.elapsed_ms());
            emit_terminal(event, acc, &tx, outcome_tx).await;
            return;
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "call deadline exceeded before response");
            let event = StreamEvent::from_failure(&clock.timeout_failure(), clock.elapsed_ms());
            emit_terminal(event, acc, &tx, outcome_tx).await;
            return;
        }
    };

    let mut events = std::pin::pin!(normalize(chunks, clock));
    while let Some(event) = events.next().await {
        acc.observe(&event);
        if !send_event(&tx, event).await {
            debug!("call stream receiver dropped; cancelling call");
            return;
        }
    }

    let outcome = acc.finish();
    info!(status = outcome.status.as_str(), elapsed_ms = outcome.elapsed_ms, input_tokens = outcome.input_tokens, output_tokens = outcome.output_tokens, "call finished");
    let _ = outcome_tx.send(outcome);
}

async fn emit_terminal(
    event: StreamEvent,
    mut acc: OutcomeAccumulator,
    tx: &mpsc::Sender<StreamEvent>,
    outcome_tx: oneshot::Sender<CallOutcome>,
) {
    acc.observe(&event);
    let _ = send_event(tx, event).await;
    let outcome = acc.finish();
    info!(status = outcome.status.as_str(), elapsed_ms = outcome.elapsed_ms, "call finished");
    let _ = outcome_tx.send(outcome);
}

async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}
