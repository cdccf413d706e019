use std::collections::BTreeSet;
use std::fmt;

use crate::content::InputPayload;

/// Stable identifier for a provider implementation (for example `openai-compat`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Kind of an input media item.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

impl Modality {
    /// Maps an accepted upload MIME type to its modality.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_type {
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" => Some(Self::Image),
            "video/mp4" | "video/webm" => Some(Self::Video),
            "audio/webm" | "audio/wav" | "audio/mp3" | "audio/mpeg" | "audio/ogg" => {
                Some(Self::Audio)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio container name sent alongside inline audio; unknown types fall back to `wav`.
pub fn audio_format_from_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mp3" | "audio/mpeg" => "mp3",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/aac" => "aac",
        _ => "wav",
    }
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2048;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Sampling parameters for one call. Unset fields inherit from the target's
/// defaults, then from the request defaults above.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerationParams {
    pub fn temperature(mut self, value: f32) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn max_tokens(mut self, value: u32) -> Self {
        self.max_tokens = Some(value);
        self
    }

    pub fn top_p(mut self, value: f32) -> Self {
        self.top_p = Some(value);
        self
    }

    /// Returns `self` with any unset field taken from `defaults`.
    pub fn merged_over(&self, defaults: &GenerationParams) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature.or(defaults.temperature),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            top_p: self.top_p.or(defaults.top_p),
        }
    }

    pub fn effective_temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn effective_top_p(&self) -> f32 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }
}

/// Opaque API credential. Formatting never reveals the full value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret for use in an `Authorization` header only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// `abc****wxyz`, or `****` for keys shorter than eight characters.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < 8 {
            return "****".to_string();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}****{tail}")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.masked())
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ApiKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// One model endpoint a call is made against.
///
/// Targets with their own `base_url`/`api_key` are custom endpoints; those
/// values take precedence over the process-wide credential configuration.
#[derive(Clone, Debug)]
pub struct ModelTarget {
    /// Display name used in logs and records.
    pub name: String,
    /// Provider-specific model identifier (for example `qwen-vl-max`).
    pub model_id: String,
    pub base_url: Option<String>,
    pub api_key: Option<ApiKey>,
    pub default_params: GenerationParams,
    pub supported_modalities: BTreeSet<Modality>,
}

impl ModelTarget {
    /// Creates a text-only target using the configured default endpoint.
    pub fn new(model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        Self {
            name: model_id.clone(),
            model_id,
            base_url: None,
            api_key: None,
            default_params: GenerationParams::default(),
            supported_modalities: BTreeSet::from([Modality::Text]),
        }
    }

    /// Points the target at a user-supplied endpoint.
    pub fn custom_endpoint(mut self, base_url: impl Into<String>, api_key: impl Into<ApiKey>) -> Self {
        self.base_url = Some(base_url.into());
        self.api_key = Some(api_key.into());
        self
    }

    pub fn default_params(mut self, params: GenerationParams) -> Self {
        self.default_params = params;
        self
    }

    pub fn modalities(mut self, modalities: impl IntoIterator<Item = Modality>) -> Self {
        self.supported_modalities = modalities.into_iter().collect();
        self.supported_modalities.insert(Modality::Text);
        self
    }

    /// Returns the first media modality in `input` this target does not declare.
    pub fn unsupported_modality(&self, input: &InputPayload) -> Option<Modality> {
        input
            .media
            .iter()
            .map(|media| media.modality)
            .find(|modality| !self.supported_modalities.contains(modality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{MediaRef, MediaSource};

    #[test]
    fn audio_format_defaults_to_wav() {
        assert_eq!(audio_format_from_mime("audio/mpeg"), "mp3");
        assert_eq!(audio_format_from_mime("audio/x-wav"), "wav");
        assert_eq!(audio_format_from_mime("audio/flac"), "wav");
    }

    #[test]
    fn request_params_override_target_defaults() {
        let defaults = GenerationParams::default().temperature(0.2).max_tokens(512);
        let merged = GenerationParams::default().temperature(0.9).merged_over(&defaults);
        assert_eq!(merged.temperature, Some(0.9));
        assert_eq!(merged.max_tokens, Some(512));
        assert_eq!(merged.effective_top_p(), DEFAULT_TOP_P);
    }

    #[test]
    fn api_key_debug_is_masked() {
        let key = ApiKey::new("sk-1234567890abcdef");
        assert_eq!(key.masked(), "sk-****cdef");
        assert!(!format!("{key:?}").contains("1234567890"));
        assert_eq!(ApiKey::new("short").masked(), "****");
    }

    #[test]
    fn unsupported_modality_is_reported() {
        let target = ModelTarget::new("qwen-vl").modalities([Modality::Image]);
        let input = InputPayload::text("describe").with_media(MediaRef::new(
            Modality::Audio,
            "audio/wav",
            MediaSource::Inline("data:;base64,AAAA".into()),
        ));
        assert_eq!(target.unsupported_modality(&input), Some(Modality::Audio));
    }
}
