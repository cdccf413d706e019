use std::time::Duration;

use crate::model::ProviderId;

/// Errors returned by a provider adapter before they are normalized into a
/// terminal `StreamEvent::Error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Endpoint returned an application-level failure (HTTP status, auth, quota).
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: ProviderId,
        message: String,
        status_code: Option<u16>,
    },
    /// Transport or stream I/O failed.
    #[error("transport error ({provider}): {message}")]
    Transport {
        provider: ProviderId,
        message: String,
    },
    /// Response framing or chunk JSON was invalid.
    #[error("protocol error ({provider}): {message}")]
    Protocol {
        provider: ProviderId,
        message: String,
    },
}

impl ProviderError {
    /// Creates a provider-level error.
    pub fn provider(
        provider: impl Into<ProviderId>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Creates a transport-level error.
    pub fn transport(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(provider: impl Into<ProviderId>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns the raw message without the provider prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Provider { message, .. }
            | Self::Transport { message, .. }
            | Self::Protocol { message, .. } => message,
        }
    }

    /// HTTP status returned by the endpoint, when there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Provider { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

/// Classification of a call-ending failure.
///
/// Every failure that terminates a call becomes exactly one
/// `StreamEvent::Error`, built from this type. `Display` yields the raw
/// message that is shown to the operator and stored with the record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum CallFailure {
    /// The call exceeded its wall-clock budget.
    #[error("request timed out after {}s", timeout.as_secs())]
    Timeout { timeout: Duration },
    /// Endpoint-level failure.
    #[error("{message}")]
    Provider { provider: String, message: String },
    /// Network or stream read failure.
    #[error("{message}")]
    Transport { provider: String, message: String },
    /// Malformed stream content.
    #[error("{message}")]
    Protocol { message: String },
    /// The call could not be started (credentials, media).
    #[error("{message}")]
    Setup { message: String },
}

impl CallFailure {
    /// Whether this failure is a wall-clock timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<&ProviderError> for CallFailure {
    fn from(err: &ProviderError) -> Self {
        match err {
            ProviderError::Provider {
                provider, message, ..
            } => CallFailure::Provider {
                provider: provider.to_string(),
                message: message.clone(),
            },
            ProviderError::Transport { provider, message } => CallFailure::Transport {
                provider: provider.to_string(),
                message: message.clone(),
            },
            ProviderError::Protocol { provider, message } => CallFailure::Protocol {
                message: format!("{provider}: {message}"),
            },
        }
    }
}

impl From<&EvalError> for CallFailure {
    fn from(err: &EvalError) -> Self {
        match err {
            EvalError::Provider(provider_err) => CallFailure::from(provider_err),
            EvalError::CallFailed(failure) => failure.clone(),
            other => CallFailure::Setup {
                message: other.to_string(),
            },
        }
    }
}

/// Top-level error type for the public evaluation API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// No usable credential or endpoint; fatal, never retried.
    #[error("config error: {0}")]
    Config(String),
    /// Malformed request shape, rejected before a call is started.
    #[error("validation error: {0}")]
    Validation(String),
    /// Provider failure surfaced outside an event stream.
    #[error(transparent)]
    Provider(ProviderError),
    /// A stored media reference could not be turned into an inline payload.
    #[error("media error: {0}")]
    Media(String),
    /// Terminal failure returned from a started call.
    #[error(transparent)]
    CallFailed(CallFailure),
    /// A record sink failed to store a record.
    #[error("persist error: {0}")]
    Persist(String),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl EvalError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<ProviderError> for EvalError {
    fn from(value: ProviderError) -> Self {
        EvalError::Provider(value)
    }
}

impl From<CallFailure> for EvalError {
    fn from(value: CallFailure) -> Self {
        EvalError::CallFailed(value)
    }
}
