use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::credentials::Credentials;
use crate::errors::{EvalError, ProviderError};
use crate::model::{Modality, ProviderId, audio_format_from_mime};
use crate::provider::{ChatChunk, ChatProvider, ChatRequest, ChunkStream, CompletionRequest};

use super::transport::{FrameOutcome, SseMessage, SseReader, map_chat_message, map_completion_json};

const OPENAI_COMPAT_PROVIDER: &str = "openai-compat";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Provider adapter for OpenAI-compatible `chat/completions` streaming.
///
/// Endpoint and key come with each request, so one adapter serves both the
/// default endpoint and user-supplied custom endpoints.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new() -> Result<Self, EvalError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EvalError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn id(&self) -> ProviderId {
        ProviderId::new(OPENAI_COMPAT_PROVIDER)
    }

    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let provider_id = self.id();
        let body = build_request_body(&request);
        debug!(call_id = %request.call_id, model = %request.model_id, media = request.media.len(), "opening chat completions stream");
        let response = self.post(&request.credentials, &body).await?;
        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(chunk_stream(provider_id, bytes_stream)))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        let body = build_completion_body(&request);
        debug!(model = %request.model_id, "requesting chat completion");
        let response = self.post(&request.credentials, &body).await?;
        let value: serde_json::Value = response.json().await.map_err(|e| {
            ProviderError::protocol(self.id(), format!("invalid completion reply: {e}"))
        })?;
        map_completion_json(&self.id(), &value)
    }
}

impl OpenAiCompatProvider {
    /// POSTs `body` to `{base}/chat/completions`; non-2xx statuses become
    /// provider errors carrying the response body.
    async fn post(
        &self,
        credentials: &Credentials,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let provider_id = self.id();
        let url = chat_completions_url(&credentials.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(credentials.api_key.expose())
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::transport(provider_id.clone(), format!("request to {url} failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(ProviderError::provider(
            provider_id,
            format!("chat completions request failed with status {status}: {detail}"),
            Some(status.as_u16()),
        ))
    }
}

pub(crate) fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Non-streaming body with a system instruction and one plain user message.
pub(crate) fn build_completion_body(request: &CompletionRequest) -> serde_json::Value {
    serde_json::json!({
        "model": request.model_id,
        "messages": [
            { "role": "system", "content": request.system },
            { "role": "user", "content": request.user },
        ],
        "stream": false,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

/// Builds the JSON body: one user message whose content is a text part
/// followed by one part per media item.
pub(crate) fn build_request_body(request: &ChatRequest) -> serde_json::Value {
    let mut content = vec![serde_json::json!({
        "type": "text",
        "text": request.text.clone().unwrap_or_default(),
    })];
    for media in &request.media {
        let part = match media.modality {
            Modality::Image => serde_json::json!({
                "type": "image_url",
                "image_url": { "url": media.url },
            }),
            Modality::Video => serde_json::json!({
                "type": "video_url",
                "video_url": { "url": media.url },
            }),
            Modality::Audio => serde_json::json!({
                "type": "input_audio",
                "input_audio": {
                    "data": media.url,
                    "format": audio_format_from_mime(&media.mime_type),
                },
            }),
            Modality::Text => serde_json::json!({
                "type": "text",
                "text": media.url,
            }),
        };
        content.push(part);
    }

    serde_json::json!({
        "model": request.model_id,
        "messages": [{ "role": "user", "content": content }],
        "stream": true,
        "stream_options": { "include_usage": true },
        "temperature": request.params.effective_temperature(),
        "max_tokens": request.params.effective_max_tokens(),
        "top_p": request.params.effective_top_p(),
    })
}

fn chunk_stream(
    provider_id: ProviderId,
    body: ByteStream,
) -> impl futures::Stream<Item = Result<ChatChunk, ProviderError>> + Send {
    struct Pump {
        provider_id: ProviderId,
        body: ByteStream,
        reader: SseReader,
        ready: VecDeque<ChatChunk>,
        ended: bool,
    }

    impl Pump {
        fn accept(&mut self, message: SseMessage) -> Result<(), ProviderError> {
            match map_chat_message(&self.provider_id, &message)? {
                FrameOutcome::Chunk(chunk) if !self.ended => self.ready.push_back(chunk),
                FrameOutcome::End => self.ended = true,
                FrameOutcome::Chunk(_) | FrameOutcome::Skip => {}
            }
            Ok(())
        }
    }

    let pump = Pump {
        provider_id,
        body,
        reader: SseReader::default(),
        ready: VecDeque::new(),
        ended: false,
    };

    stream::try_unfold(pump, |mut pump| async move {
        while pump.ready.is_empty() && !pump.ended {
            let Some(read) = pump.body.next().await else {
                if let Some(message) = pump.reader.flush() {
                    pump.accept(message)?;
                }
                pump.ended = true;
                break;
            };
            let bytes = read.map_err(|e| {
                ProviderError::transport(
                    pump.provider_id.clone(),
                    format!("streaming read failed: {e}"),
                )
            })?;
            for message in pump.reader.feed(&bytes) {
                pump.accept(message)?;
            }
        }
        Ok(pump.ready.pop_front().map(|chunk| (chunk, pump)))
    })
}
