//! OpenAI-compatible `chat/completions` integration.
//!
//! Works with any endpoint speaking that protocol, including DashScope's
//! compatible mode, which also accepts `video_url` and `input_audio` parts.
mod adapter;
pub(crate) mod transport;

pub use adapter::OpenAiCompatProvider;
