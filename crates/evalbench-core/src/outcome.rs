use tracing::warn;

use crate::stream::{DebugChunk, StreamEvent};

/// Terminal status of one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
    TimedOut,
}

impl CallStatus {
    pub fn is_success(self) -> bool {
        matches!(self, CallStatus::Success)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Failed => "failed",
            CallStatus::TimedOut => "timed_out",
        }
    }
}

/// Accumulated result of one call, finalized by its terminal event.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallOutcome {
    pub output_text: String,
    pub audio_urls: Vec<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub elapsed_ms: u64,
    pub status: CallStatus,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug_chunks: Vec<DebugChunk>,
}

impl CallOutcome {
    /// Outcome for a call that never reached the provider.
    pub fn failed_before_start(message: impl Into<String>) -> Self {
        Self {
            output_text: String::new(),
            audio_urls: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            elapsed_ms: 0,
            status: CallStatus::Failed,
            error: Some(message.into()),
            debug_chunks: Vec::new(),
        }
    }

    /// First `limit` characters of the output.
    pub fn output_preview(&self, limit: usize) -> String {
        preview(&self.output_text, limit)
    }
}

pub(crate) fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Builds a `CallOutcome` incrementally from the events of one call.
#[derive(Debug, Default)]
pub struct OutcomeAccumulator {
    text: String,
    audio_urls: Vec<String>,
    input_tokens: u64,
    output_tokens: u64,
    finalized: Option<CallOutcome>,
}

impl OutcomeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        if self.finalized.is_some() {
            warn!("event observed after terminal event; ignoring");
            return;
        }
        match event {
            StreamEvent::Token { text } => self.text.push_str(text),
            StreamEvent::Audio { url } => self.audio_urls.push(url.clone()),
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.input_tokens = *input_tokens;
                self.output_tokens = *output_tokens;
            }
            StreamEvent::Done {
                elapsed_ms,
                debug_chunks,
            } => self.finalize(CallStatus::Success, *elapsed_ms, None, debug_chunks.clone()),
            StreamEvent::Error {
                message,
                is_timeout,
                elapsed_ms,
            } => {
                let status = if *is_timeout {
                    CallStatus::TimedOut
                } else {
                    CallStatus::Failed
                };
                self.finalize(status, *elapsed_ms, Some(message.clone()), Vec::new());
            }
        }
    }

    fn finalize(
        &mut self,
        status: CallStatus,
        elapsed_ms: u64,
        error: Option<String>,
        debug_chunks: Vec<DebugChunk>,
    ) {
        self.finalized = Some(CallOutcome {
            output_text: std::mem::take(&mut self.text),
            audio_urls: std::mem::take(&mut self.audio_urls),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            elapsed_ms,
            status,
            error,
            debug_chunks,
        });
    }

    /// Returns the finalized outcome, or a failed one if no terminal event
    /// was ever observed.
    pub fn finish(self) -> CallOutcome {
        match self.finalized {
            Some(outcome) => outcome,
            None => CallOutcome {
                output_text: self.text,
                audio_urls: self.audio_urls,
                input_tokens: self.input_tokens,
                output_tokens: self.output_tokens,
                elapsed_ms: 0,
                status: CallStatus::Failed,
                error: Some("call ended without a terminal event".into()),
                debug_chunks: Vec::new(),
            },
        }
    }
}
