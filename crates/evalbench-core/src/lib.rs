//! Streaming evaluation engine for OpenAI-compatible chat models.
//!
//! Three entry points share one event vocabulary (`StreamEvent`):
//! single calls, two-target comparisons and sequential batches.
//!
//! ```no_run
//! use evalbench_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), EvalError> {
//! let evaluator = Evaluator::from_config(&EvalConfig::from_env()?)?.build()?;
//!
//! let mut call = evaluator
//!     .infer(
//!         &ModelTarget::new("qwen-turbo"),
//!         &InputPayload::text("Say hello"),
//!         &GenerationParams::default(),
//!         None,
//!     )
//!     .await?;
//! while let Some(event) = call.next_event().await {
//!     if let StreamEvent::Token { text } = event {
//!         print!("{text}");
//!     }
//! }
//! let outcome = call.finish().await?;
//! println!("\n{} tokens out", outcome.output_tokens);
//! # Ok(())
//! # }
//! ```

/// Sequential batch runs over a prompt template.
pub mod batch;
/// Two-target comparison runs.
pub mod compare;
/// Environment-driven engine configuration.
pub mod config;
/// Input payload and media references.
pub mod content;
/// Credential precedence and the runtime key override.
pub mod credentials;
/// Single-call driver and its event stream handle.
pub mod driver;
/// Public error types.
pub mod errors;
/// Batch result export.
pub mod export;
/// Engine entry point and builder.
pub mod evaluator;
/// Media materialization into inline payloads.
pub mod media;
/// Targets, modalities, generation parameters and API keys.
pub mod model;
/// Chunk-to-event normalization.
pub mod normalize;
/// Process-wide tracing setup.
pub mod observability;
/// Call outcomes and their accumulator.
pub mod outcome;
/// Record sinks for finished runs.
pub mod persist;
/// Common imports for typical usage.
pub mod prelude;
/// Provider contract implemented by endpoint adapters.
pub mod provider;
/// Normalized stream events.
pub mod stream;
/// Prompt autocompletion.
pub mod suggest;
/// Endpoint adapters.
pub mod vendors;

pub use batch::{
    BatchEvent, BatchItemRecord, BatchRequest, BatchSequencer, BatchSnapshot, BatchStatus, BatchStream,
    BatchSummary, CancelHandle, ItemStatus, render_prompt,
};
pub use compare::{
    ComparisonEvent, ComparisonGroupSpec, ComparisonOrchestrator, ComparisonResult,
    ComparisonStatus, ComparisonStream,
};
pub use config::EvalConfig;
pub use content::{InputPayload, MediaRef, MediaSource, StoredFile};
pub use credentials::{CredentialStore, Credentials, KeySource, KeyStatus};
pub use driver::{CallDriver, CallStream};
pub use errors::{CallFailure, EvalError, ProviderError};
pub use evaluator::{Evaluator, EvaluatorBuilder};
pub use export::{ExportFormat, ExportRow};
pub use media::{FsMediaStore, MediaMaterializer};
pub use model::{ApiKey, GenerationParams, Modality, ModelTarget, ProviderId};
pub use observability::init_observability;
pub use outcome::{CallOutcome, CallStatus};
pub use persist::{CallRecord, JsonlSink, NoopSink, RecordSink};
pub use provider::{ChatChunk, ChatProvider, ChatRequest, ChunkStream, CompletionRequest};
pub use stream::{Group, GroupEvent, StreamEvent};
pub use suggest::Suggester;
pub use uuid::Uuid;
