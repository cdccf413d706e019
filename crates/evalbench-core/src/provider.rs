use std::pin::Pin;

use crate::content::InlineMedia;
use crate::credentials::Credentials;
use crate::errors::ProviderError;
use crate::model::{GenerationParams, ProviderId};
use crate::stream::TokenUsage;

/// Fully resolved request for one streaming call.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub call_id: uuid::Uuid,
    pub model_id: String,
    pub credentials: Credentials,
    /// User text; sent as an empty text part when absent.
    pub text: Option<String>,
    /// Materialized media, in input order.
    pub media: Vec<InlineMedia>,
    pub params: GenerationParams,
}

/// Short non-streaming request: one system instruction and one user message.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model_id: String,
    pub credentials: Credentials,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Raw incremental chunk decoded from the provider stream.
///
/// Adapters fill what the wire format carries; the normalizer decides what
/// becomes an event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    pub role: Option<String>,
    /// Incremental text for this chunk only.
    pub delta: Option<String>,
    pub audio_url: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn usage(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            usage: Some(TokenUsage {
                input_tokens,
                output_tokens,
            }),
            ..Self::default()
        }
    }
}

/// Lazy, single-pass stream of provider chunks.
pub type ChunkStream =
    Pin<Box<dyn futures::Stream<Item = Result<ChatChunk, ProviderError>> + Send + 'static>>;

/// Contract implemented by each endpoint family.
///
/// `open_stream` issues the request and returns once response headers are
/// in; the body is consumed lazily through the returned stream. Dropping
/// the stream cancels the underlying network operation.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn open_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError>;

    /// Runs a non-streaming request and returns the reply text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;
}
