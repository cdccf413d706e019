//! Conversion of media references into inline payloads the endpoint accepts.

use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::content::{InlineMedia, MediaRef, MediaSource, StoredFile};
use crate::errors::EvalError;
use crate::model::Modality;

/// Turns a media reference into a URL or data URL the provider can consume.
#[async_trait::async_trait]
pub trait MediaMaterializer: Send + Sync {
    async fn materialize(&self, media: &MediaRef) -> Result<InlineMedia, EvalError>;
}

/// Reads stored uploads from a local directory and base64-encodes them.
#[derive(Clone, Debug)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, file: &StoredFile) -> Result<PathBuf, EvalError> {
        let relative = Path::new(&file.relative_path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(EvalError::Media(format!(
                "stored file path must stay under the upload root: {}",
                file.relative_path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl MediaMaterializer for FsMediaStore {
    async fn materialize(&self, media: &MediaRef) -> Result<InlineMedia, EvalError> {
        let url = match &media.source {
            MediaSource::Inline(url) => url.clone(),
            MediaSource::Stored(file) => {
                let path = self.resolve(file)?;
                let bytes = tokio::fs::read(&path).await.map_err(|e| {
                    EvalError::Media(format!("failed to read {}: {e}", path.display()))
                })?;
                debug!(path = %path.display(), bytes = bytes.len(), modality = %media.modality, "materialized stored media");
                data_url(media.modality, &media.mime_type, &bytes)
            }
        };
        Ok(InlineMedia {
            modality: media.modality,
            mime_type: media.mime_type.clone(),
            url,
        })
    }
}

/// Images carry their MIME type in the data URL; audio and video use a bare
/// `data:;base64,` prefix.
pub fn data_url(modality: Modality, mime_type: &str, bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    if modality == Modality::Image || mime_type.starts_with("image/") {
        format!("data:{mime_type};base64,{encoded}")
    } else {
        format!("data:;base64,{encoded}")
    }
}
