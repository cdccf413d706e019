use std::sync::RwLock;

use tracing::info;

use crate::config::EvalConfig;
use crate::errors::EvalError;
use crate::model::{ApiKey, ModelTarget};

/// Key and endpoint a single call is made with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: ApiKey,
    pub base_url: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<ApiKey>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

/// Which layer the active default key currently comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    Runtime,
    Default,
    None,
}

/// Masked description of the active key, safe to show to an operator.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct KeyStatus {
    pub source: KeySource,
    pub masked: Option<String>,
}

/// Process-wide credential configuration.
///
/// Precedence for a call: explicit override, then the target's own custom
/// key/URL, then the runtime key set by the operator, then the static default.
#[derive(Debug)]
pub struct CredentialStore {
    default_key: Option<ApiKey>,
    default_base_url: String,
    runtime_key: RwLock<Option<ApiKey>>,
}

impl CredentialStore {
    pub fn new(default_key: Option<ApiKey>, default_base_url: impl Into<String>) -> Self {
        Self {
            default_key: default_key.filter(|k| !k.is_blank()),
            default_base_url: default_base_url.into(),
            runtime_key: RwLock::new(None),
        }
    }

    pub fn from_config(config: &EvalConfig) -> Self {
        Self::new(config.api_key.clone(), config.base_url.clone())
    }

    pub fn default_base_url(&self) -> &str {
        &self.default_base_url
    }

    /// Sets or clears the runtime key that overrides the static default.
    pub fn set_runtime_key(&self, key: Option<ApiKey>) {
        let key = key.filter(|k| !k.is_blank());
        match &key {
            Some(k) => info!(masked = %k.masked(), "runtime api key set"),
            None => info!("runtime api key cleared"),
        }
        *self.runtime_key.write().unwrap_or_else(|e| e.into_inner()) = key;
    }

    fn runtime_key(&self) -> Option<ApiKey> {
        self.runtime_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn key_status(&self) -> KeyStatus {
        if let Some(key) = self.runtime_key() {
            return KeyStatus {
                source: KeySource::Runtime,
                masked: Some(key.masked()),
            };
        }
        match &self.default_key {
            Some(key) => KeyStatus {
                source: KeySource::Default,
                masked: Some(key.masked()),
            },
            None => KeyStatus {
                source: KeySource::None,
                masked: None,
            },
        }
    }

    /// Resolves the credentials for one call against `target`.
    pub fn resolve(
        &self,
        target: &ModelTarget,
        explicit: Option<&Credentials>,
    ) -> Result<Credentials, EvalError> {
        if let Some(explicit) = explicit {
            if explicit.api_key.is_blank() {
                return Err(EvalError::Config(format!(
                    "explicit credentials for {} have an empty api key",
                    target.name
                )));
            }
            if explicit.base_url.trim().is_empty() {
                return Err(EvalError::Config(format!(
                    "explicit credentials for {} have an empty base url",
                    target.name
                )));
            }
            return Ok(explicit.clone());
        }

        let api_key = target
            .api_key
            .clone()
            .filter(|k| !k.is_blank())
            .or_else(|| self.runtime_key())
            .or_else(|| self.default_key.clone())
            .ok_or_else(|| {
                EvalError::Config(format!(
                    "no api key configured for {}; set EVALBENCH_API_KEY or a runtime key",
                    target.name
                ))
            })?;
        let base_url = target
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.default_base_url.clone());
        if base_url.trim().is_empty() {
            return Err(EvalError::Config(format!(
                "no base url configured for {}",
                target.name
            )));
        }
        Ok(Credentials { api_key, base_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://default.example/v1";

    #[test]
    fn runtime_key_overrides_default_and_can_be_cleared() {
        let store = CredentialStore::new(Some("default-key-0001".into()), BASE);
        let target = ModelTarget::new("m");
        assert_eq!(
            store.resolve(&target, None).expect("default").api_key.expose(),
            "default-key-0001"
        );

        store.set_runtime_key(Some("runtime-key-0002".into()));
        assert_eq!(
            store.resolve(&target, None).expect("runtime").api_key.expose(),
            "runtime-key-0002"
        );
        assert_eq!(store.key_status().source, KeySource::Runtime);

        store.set_runtime_key(None);
        assert_eq!(store.key_status().source, KeySource::Default);
    }

    #[test]
    fn custom_target_and_explicit_override_win() {
        let store = CredentialStore::new(Some("default-key-0001".into()), BASE);
        store.set_runtime_key(Some("runtime-key-0002".into()));

        let custom = ModelTarget::new("m").custom_endpoint("https://custom.example/v1", "custom-key-0003");
        let resolved = store.resolve(&custom, None).expect("custom");
        assert_eq!(resolved.api_key.expose(), "custom-key-0003");
        assert_eq!(resolved.base_url, "https://custom.example/v1");

        let explicit = Credentials::new("explicit-key-0004", "https://explicit.example/v1");
        let resolved = store.resolve(&custom, Some(&explicit)).expect("explicit");
        assert_eq!(resolved, explicit);
    }

    #[test]
    fn explicit_credentials_need_a_base_url() {
        let store = CredentialStore::new(Some("default-key-0001".into()), BASE);
        let explicit = Credentials::new("sk-abcdefgh", "  ");
        let err = store
            .resolve(&ModelTarget::new("m"), Some(&explicit))
            .expect_err("blank url");
        assert!(matches!(err, EvalError::Config(msg) if msg.contains("empty base url")));
    }

    #[test]
    fn missing_key_is_config_error() {
        let store = CredentialStore::new(Some("   ".into()), BASE);
        let err = store.resolve(&ModelTarget::new("m"), None).expect_err("no key");
        assert!(matches!(err, EvalError::Config(msg) if msg.contains("no api key")));
        assert_eq!(store.key_status().source, KeySource::None);
    }
}
