use crate::model::Modality;

/// A file previously stored by the upload layer, addressed relative to the
/// upload root.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoredFile {
    pub relative_path: String,
}

impl StoredFile {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
        }
    }
}

/// Where the bytes of a media item come from.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MediaSource {
    /// Ready-to-send URL or data URL.
    Inline(String),
    /// Stored file that must be materialized before the request is built.
    Stored(StoredFile),
}

/// One media item attached to an input.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MediaRef {
    pub modality: Modality,
    pub mime_type: String,
    pub source: MediaSource,
}

impl MediaRef {
    pub fn new(modality: Modality, mime_type: impl Into<String>, source: MediaSource) -> Self {
        Self {
            modality,
            mime_type: mime_type.into(),
            source,
        }
    }

    /// Builds a stored-file reference, deriving the modality from the MIME type.
    pub fn stored(mime_type: impl Into<String>, relative_path: impl Into<String>) -> Option<Self> {
        let mime_type = mime_type.into();
        let modality = Modality::from_mime(&mime_type)?;
        Some(Self::new(
            modality,
            mime_type,
            MediaSource::Stored(StoredFile::new(relative_path)),
        ))
    }
}

/// Input shared by every call of a single, comparison, or batch run.
///
/// Built once and never mutated; media order is preserved in the request.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InputPayload {
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
}

impl InputPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: Vec::new(),
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media.push(media);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty()) && self.media.is_empty()
    }
}

/// Provider-consumable media item after materialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineMedia {
    pub modality: Modality,
    pub mime_type: String,
    pub url: String,
}
