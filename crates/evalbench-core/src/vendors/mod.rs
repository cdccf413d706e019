/// OpenAI-compatible chat completions.
pub mod openai;
