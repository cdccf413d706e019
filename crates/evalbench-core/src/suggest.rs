//! Prompt autocompletion through a small, fast model.
//!
//! Suggestions are advisory: every failure (no key, provider error, slow
//! reply) yields an empty list and is only logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::model::ModelTarget;
use crate::provider::{ChatProvider, CompletionRequest};

pub const DEFAULT_SUGGEST_MODEL: &str = "qwen-turbo";
pub const SUGGEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const SUGGEST_MAX_TOKENS: u32 = 100;
pub const DEFAULT_SUGGESTIONS: usize = 3;
/// Requests asking for more are clamped to this.
pub const MAX_SUGGESTIONS: usize = 5;

const SUGGEST_TEMPERATURE: f32 = 0.3;
/// Shorter input (after trimming) gets no suggestions.
const MIN_INPUT_CHARS: usize = 2;

/// Asks a completion model how the user's prompt might continue.
#[derive(Clone)]
pub struct Suggester {
    provider: Arc<dyn ChatProvider>,
    credentials: Arc<CredentialStore>,
    model_id: String,
}

impl Suggester {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        credentials: Arc<CredentialStore>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            credentials,
            model_id: model_id.into(),
        }
    }

    /// Returns at most `max_suggestions` (clamped to `1..=MAX_SUGGESTIONS`)
    /// continuations of `text`, without the text itself.
    pub async fn suggest(&self, text: &str, max_suggestions: usize) -> Vec<String> {
        let max_suggestions = max_suggestions.clamp(1, MAX_SUGGESTIONS);
        if text.trim().chars().count() < MIN_INPUT_CHARS {
            return Vec::new();
        }
        let credentials = match self
            .credentials
            .resolve(&ModelTarget::new(&self.model_id), None)
        {
            Ok(credentials) => credentials,
            Err(err) => {
                debug!(error = %err, "no credentials for suggestions");
                return Vec::new();
            }
        };
        let request = CompletionRequest {
            model_id: self.model_id.clone(),
            credentials,
            system: system_prompt(max_suggestions),
            user: format!("Complete the following text:\n{text}"),
            max_tokens: SUGGEST_MAX_TOKENS,
            temperature: SUGGEST_TEMPERATURE,
        };

        match tokio::time::timeout(SUGGEST_TIMEOUT, self.provider.complete(request)).await {
            Ok(Ok(reply)) => split_suggestions(&reply, max_suggestions),
            Ok(Err(err)) => {
                warn!(model = %self.model_id, error = %err, "suggestion request failed");
                Vec::new()
            }
            Err(_) => {
                warn!(model = %self.model_id, timeout_secs = SUGGEST_TIMEOUT.as_secs(), "suggestion request timed out");
                Vec::new()
            }
        }
    }
}

fn system_prompt(max_suggestions: usize) -> String {
    format!(
        "You are a text completion assistant. The user is typing a prompt. \
         Suggest the most likely continuations of what they have typed so far. \
         Return only the continuation (without the text already typed), at most \
         {max_suggestions} of them, one per line, with no numbering or commentary."
    )
}

fn split_suggestions(reply: &str, max_suggestions: usize) -> Vec<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(max_suggestions)
        .map(str::to_owned)
        .collect()
}
