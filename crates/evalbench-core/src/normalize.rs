//! Turns a provider chunk stream into the closed `StreamEvent` vocabulary.
//!
//! The produced sequence is lazy, finite and single-pass. It ends with
//! exactly one terminal event: `Done` when the provider stream drains
//! cleanly, `Error` on a transport/decode failure or when the call deadline
//! passes. `Usage` is buffered and released once, right before `Done`.

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::CallFailure;
use crate::provider::{ChatChunk, ChunkStream};
use crate::stream::{DEBUG_CONTENT_LIMIT, DebugChunk, StreamEvent, TokenUsage};

/// Upper bound on debug records kept for one call.
pub const MAX_DEBUG_CHUNKS: usize = 4096;

/// Wall-clock bookkeeping shared by the driver and the normalizer.
#[derive(Clone, Copy, Debug)]
pub struct CallClock {
    pub started: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
}

impl CallClock {
    pub fn start(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
            timeout,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn timeout_failure(&self) -> CallFailure {
        CallFailure::Timeout {
            timeout: self.timeout,
        }
    }
}

struct Normalizer {
    chunks: ChunkStream,
    clock: CallClock,
    usage: Option<TokenUsage>,
    debug_chunks: Vec<DebugChunk>,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl Normalizer {
    fn on_chunk(&mut self, chunk: ChatChunk) {
        self.record_debug(&chunk);
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if let Some(text) = chunk.delta.filter(|t| !t.is_empty()) {
            self.pending.push_back(StreamEvent::Token { text });
        }
        if let Some(url) = chunk.audio_url.filter(|u| !u.is_empty()) {
            self.pending.push_back(StreamEvent::Audio { url });
        }
    }

    fn record_debug(&mut self, chunk: &ChatChunk) {
        if self.debug_chunks.len() >= MAX_DEBUG_CHUNKS {
            return;
        }
        let record = DebugChunk {
            id: chunk.id.clone(),
            model: chunk.model.clone(),
            role: chunk.role.clone(),
            content: chunk
                .delta
                .as_deref()
                .map(|text| text.chars().take(DEBUG_CONTENT_LIMIT).collect()),
            finish_reason: chunk.finish_reason.clone(),
            usage: chunk.usage,
        };
        // Records that cannot be represented as JSON are dropped, never fatal.
        match serde_json::to_value(&record) {
            Ok(_) => self.debug_chunks.push(record),
            Err(e) => debug!(error = %e, "skipping unserializable debug chunk"),
        }
    }

    fn on_complete(&mut self) {
        self.finished = true;
        if let Some(usage) = self.usage.take().filter(|u| !u.is_zero()) {
            self.pending.push_back(StreamEvent::Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }
        self.pending.push_back(StreamEvent::Done {
            elapsed_ms: self.clock.elapsed_ms(),
            debug_chunks: std::mem::take(&mut self.debug_chunks),
        });
    }

    fn on_failure(&mut self, failure: CallFailure) {
        self.finished = true;
        self.pending
            .push_back(StreamEvent::from_failure(&failure, self.clock.elapsed_ms()));
    }
}

/// Normalizes `chunks` into events, enforcing `clock.deadline` on every
/// await of the next chunk. Dropping the returned stream drops `chunks`.
pub fn normalize(
    chunks: ChunkStream,
    clock: CallClock,
) -> impl futures::Stream<Item = StreamEvent> + Send {
    stream::unfold(
        Normalizer {
            chunks,
            clock,
            usage: None,
            debug_chunks: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }

                match tokio::time::timeout_at(state.clock.deadline, state.chunks.next()).await {
                    Ok(Some(Ok(chunk))) => state.on_chunk(chunk),
                    Ok(Some(Err(err))) => {
                        warn!(error = %err, "provider stream failed");
                        state.on_failure(CallFailure::from(&err));
                    }
                    Ok(None) => state.on_complete(),
                    Err(_) => {
                        warn!(timeout_secs = state.clock.timeout.as_secs(), "call deadline exceeded while streaming");
                        let failure = state.clock.timeout_failure();
                        state.on_failure(failure);
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProviderError;

    fn chunks(items: Vec<Result<ChatChunk, ProviderError>>) -> ChunkStream {
        Box::pin(stream::iter(items))
    }

    async fn collect(stream: ChunkStream, timeout: Duration) -> Vec<StreamEvent> {
        normalize(stream, CallClock::start(timeout)).collect().await
    }

    fn texts(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn hello_scenario_yields_tokens_usage_done() {
        let events = collect(
            chunks(vec![
                Ok(ChatChunk::text("Hel")),
                Ok(ChatChunk::text("lo")),
                Ok(ChatChunk::usage(5, 2)),
            ]),
            Duration::from_secs(60),
        )
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::Token { text: "Hel".into() });
        assert_eq!(events[1], StreamEvent::Token { text: "lo".into() });
        assert_eq!(
            events[2],
            StreamEvent::Usage {
                input_tokens: 5,
                output_tokens: 2
            }
        );
        assert!(matches!(events[3], StreamEvent::Done { .. }));
        assert_eq!(texts(&events), "Hello");
    }

    #[tokio::test]
    async fn usage_on_text_chunk_is_still_released_last() {
        let mut last = ChatChunk::text("!");
        last.usage = Some(TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
        });
        last.finish_reason = Some("stop".into());
        let events = collect(
            chunks(vec![Ok(ChatChunk::text("hi")), Ok(last)]),
            Duration::from_secs(60),
        )
        .await;
        let kinds: Vec<_> = events
            .iter()
            .map(|e| match e {
                StreamEvent::Token { .. } => "token",
                StreamEvent::Usage { .. } => "usage",
                StreamEvent::Done { .. } => "done",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["token", "token", "usage", "done"]);
    }

    #[tokio::test]
    async fn zero_usage_is_not_emitted() {
        let events = collect(
            chunks(vec![Ok(ChatChunk::text("a")), Ok(ChatChunk::usage(0, 0))]),
            Duration::from_secs(60),
        )
        .await;
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Usage { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn empty_stream_completes_with_done_only() {
        let events = collect(chunks(Vec::new()), Duration::from_secs(60)).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn transport_error_ends_with_single_error_and_keeps_prior_tokens() {
        let events = collect(
            chunks(vec![
                Ok(ChatChunk::text("par")),
                Err(ProviderError::transport("t", "connection reset")),
                Ok(ChatChunk::text("never")),
            ]),
            Duration::from_secs(60),
        )
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(texts(&events), "par");
        assert!(matches!(
            &events[1],
            StreamEvent::Error { message, is_timeout: false, .. } if message == "connection reset"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_without_done() {
        let stalled: ChunkStream = Box::pin(
            stream::iter(vec![Ok::<_, ProviderError>(ChatChunk::text("slow"))])
                .chain(stream::pending()),
        );
        let events = collect(stalled, Duration::from_secs(60)).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            StreamEvent::Error {
                is_timeout: true,
                ..
            }
        ));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn debug_chunks_are_truncated_and_attached_to_done() {
        let long = "x".repeat(DEBUG_CONTENT_LIMIT + 50);
        let mut first = ChatChunk::text(long.clone());
        first.id = Some("chatcmpl-9".into());
        first.model = Some("qwen-plus".into());
        let events = collect(chunks(vec![Ok(first)]), Duration::from_secs(60)).await;

        match events.last() {
            Some(StreamEvent::Done { debug_chunks, .. }) => {
                assert_eq!(debug_chunks.len(), 1);
                assert_eq!(debug_chunks[0].id.as_deref(), Some("chatcmpl-9"));
                assert_eq!(
                    debug_chunks[0].content.as_ref().map(|c| c.chars().count()),
                    Some(DEBUG_CONTENT_LIMIT)
                );
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert_eq!(texts(&events), long);
    }

    #[tokio::test]
    async fn repeated_usage_chunks_yield_one_usage_with_latest_counts() {
        let events = collect(
            chunks(vec![
                Ok(ChatChunk::usage(5, 1)),
                Ok(ChatChunk::text("a")),
                Ok(ChatChunk::usage(5, 2)),
                Ok(ChatChunk::usage(5, 3)),
            ]),
            Duration::from_secs(60),
        )
        .await;
        let usages: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Usage { .. }))
            .collect();
        assert_eq!(
            usages,
            vec![&StreamEvent::Usage {
                input_tokens: 5,
                output_tokens: 3
            }]
        );
        assert!(matches!(events[events.len() - 2], StreamEvent::Usage { .. }));
    }

    #[tokio::test]
    async fn usage_before_a_failure_is_never_released() {
        let events = collect(
            chunks(vec![
                Ok(ChatChunk::text("par")),
                Ok(ChatChunk::usage(7, 1)),
                Err(ProviderError::transport("t", "connection reset")),
            ]),
            Duration::from_secs(60),
        )
        .await;
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Usage { .. })));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn debug_records_stop_at_the_cap_but_tokens_keep_flowing() {
        let total = MAX_DEBUG_CHUNKS + 10;
        let items = (0..total).map(|_| Ok(ChatChunk::text("t"))).collect();
        let events = collect(chunks(items), Duration::from_secs(60)).await;

        let tokens = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Token { .. }))
            .count();
        assert_eq!(tokens, total);
        match events.last() {
            Some(StreamEvent::Done { debug_chunks, .. }) => {
                assert_eq!(debug_chunks.len(), MAX_DEBUG_CHUNKS)
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn audio_chunks_become_audio_events() {
        let chunk = ChatChunk {
            audio_url: Some("https://cdn.example/out.wav".into()),
            ..ChatChunk::default()
        };
        let events = collect(chunks(vec![Ok(chunk)]), Duration::from_secs(60)).await;
        assert_eq!(
            events[0],
            StreamEvent::Audio {
                url: "https://cdn.example/out.wav".into()
            }
        );
    }
}
