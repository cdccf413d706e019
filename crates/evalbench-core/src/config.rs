use std::path::PathBuf;
use std::time::Duration;

use crate::errors::EvalError;
use crate::model::ApiKey;
use crate::suggest::DEFAULT_SUGGEST_MODEL;

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STREAM_BUFFER: usize = 128;

/// Process configuration for the evaluation engine.
#[derive(Clone, Debug)]
pub struct EvalConfig {
    /// Static default key; may be absent when every target brings its own.
    pub api_key: Option<ApiKey>,
    /// Default OpenAI-compatible base URL.
    pub base_url: String,
    /// Wall-clock budget for one call, including draining the stream.
    pub call_timeout: Duration,
    /// Bounded buffer size for every event channel.
    pub stream_buffer_capacity: usize,
    /// Root directory that stored media references are relative to.
    pub upload_dir: PathBuf,
    /// Light model used for prompt suggestions.
    pub suggest_model: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER,
            upload_dir: PathBuf::from("uploads"),
            suggest_model: DEFAULT_SUGGEST_MODEL.to_string(),
        }
    }
}

impl EvalConfig {
    /// Builds a config from `EVALBENCH_*` environment variables.
    ///
    /// - `EVALBENCH_API_KEY` (falls back to `DASHSCOPE_API_KEY`)
    /// - `EVALBENCH_BASE_URL` (falls back to `DASHSCOPE_BASE_URL`)
    /// - `EVALBENCH_TIMEOUT_SECS`
    /// - `EVALBENCH_STREAM_BUFFER`
    /// - `EVALBENCH_UPLOAD_DIR`
    /// - `EVALBENCH_SUGGEST_MODEL` (falls back to `AUTOCOMPLETE_MODEL`)
    pub fn from_env() -> Result<Self, EvalError> {
        let mut config = Self::default();
        if let Some(key) = first_env(&["EVALBENCH_API_KEY", "DASHSCOPE_API_KEY"]) {
            config.api_key = Some(ApiKey::new(key));
        }
        if let Some(url) = first_env(&["EVALBENCH_BASE_URL", "DASHSCOPE_BASE_URL"]) {
            config.base_url = url;
        }
        if let Some(raw) = first_env(&["EVALBENCH_TIMEOUT_SECS"]) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                EvalError::Config(format!("EVALBENCH_TIMEOUT_SECS must be an integer, got {raw:?}"))
            })?;
            config.call_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = first_env(&["EVALBENCH_STREAM_BUFFER"]) {
            config.stream_buffer_capacity = raw.trim().parse().map_err(|_| {
                EvalError::Config(format!("EVALBENCH_STREAM_BUFFER must be an integer, got {raw:?}"))
            })?;
        }
        if let Some(dir) = first_env(&["EVALBENCH_UPLOAD_DIR"]) {
            config.upload_dir = PathBuf::from(dir);
        }
        if let Some(model) = first_env(&["EVALBENCH_SUGGEST_MODEL", "AUTOCOMPLETE_MODEL"]) {
            config.suggest_model = model;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn api_key(mut self, api_key: impl Into<ApiKey>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    pub fn suggest_model(mut self, model_id: impl Into<String>) -> Self {
        self.suggest_model = model_id.into();
        self
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        if self.stream_buffer_capacity == 0 {
            return Err(EvalError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(EvalError::Config("call_timeout must be greater than 0".into()));
        }
        if self.suggest_model.trim().is_empty() {
            return Err(EvalError::Config("suggest_model must not be empty".into()));
        }
        Ok(())
    }
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = EvalConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert_eq!(config.stream_buffer_capacity, 128);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.suggest_model, "qwen-turbo");
        assert!(config.validate().is_ok());
        assert!(config.suggest_model(" ").validate().is_err());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let err = EvalConfig::default()
            .stream_buffer_capacity(0)
            .validate()
            .expect_err("zero buffer");
        assert!(matches!(err, EvalError::Config(msg) if msg.contains("stream_buffer_capacity")));
    }
}
