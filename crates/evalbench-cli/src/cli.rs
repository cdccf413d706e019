//! Command-line surface of the `evalbench` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use evalbench_core::suggest::DEFAULT_SUGGESTIONS;
use evalbench_core::{
    ApiKey, ComparisonGroupSpec, Credentials, ExportFormat, GenerationParams, InputPayload,
    MediaRef, ModelTarget, Uuid,
};

#[derive(Debug, Parser)]
#[command(name = "evalbench", version, about = "Stream, compare and batch-evaluate chat models")]
pub struct Cli {
    /// Runtime API key; overrides EVALBENCH_API_KEY for this process.
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    /// Append JSON records of finished runs to this file.
    #[arg(long, global = true)]
    pub records: Option<PathBuf>,

    /// Print events as JSON lines instead of plain text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream one call.
    Infer {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Run two models side by side on the same input.
    Compare {
        /// Model for group 0.
        #[arg(long)]
        model_a: String,
        /// Model for group 1.
        #[arg(long)]
        model_b: String,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        input: InputArgs,
    },
    /// Run one prompt template over many keywords, one at a time.
    Batch {
        #[command(flatten)]
        target: TargetArgs,
        /// Template containing `{keyword}`.
        #[arg(long)]
        template: String,
        /// Keyword to substitute; repeatable.
        #[arg(long = "item")]
        items: Vec<String>,
        /// File with one keyword per line.
        #[arg(long)]
        items_file: Option<PathBuf>,
    },
    /// Suggest continuations of a half-typed prompt.
    Suggest {
        text: String,
        /// Number of suggestions, 1 to 5.
        #[arg(long, default_value_t = DEFAULT_SUGGESTIONS)]
        max: usize,
    },
    /// Export the processed items of a batch recorded with --records.
    Export {
        /// Batch to export; defaults to the most recent one.
        #[arg(long)]
        batch_id: Option<Uuid>,
        #[arg(long, value_enum, default_value_t = FormatArg::Csv)]
        format: FormatArg,
        /// Write here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Inspect the active API key.
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum KeyAction {
    /// Show where the active key comes from, masked.
    Status,
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Model identifier, for example `qwen-turbo`.
    #[arg(long)]
    pub model: String,
    /// Custom endpoint base URL; requires --endpoint-key.
    #[arg(long, requires = "endpoint_key")]
    pub endpoint: Option<String>,
    /// Key for the custom endpoint.
    #[arg(long)]
    pub endpoint_key: Option<String>,
    #[command(flatten)]
    pub params: ParamArgs,
}

impl TargetArgs {
    pub fn target(&self, input: &InputPayload) -> ModelTarget {
        ModelTarget::new(&self.model).modalities(input.media.iter().map(|m| m.modality))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.endpoint, &self.endpoint_key) {
            (Some(url), Some(key)) => Some(Credentials::new(ApiKey::new(key.clone()), url.clone())),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Args)]
pub struct ParamArgs {
    #[arg(long)]
    pub temperature: Option<f32>,
    #[arg(long)]
    pub max_tokens: Option<u32>,
    #[arg(long)]
    pub top_p: Option<f32>,
}

impl ParamArgs {
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
        }
    }
}

#[derive(Debug, Args)]
pub struct InputArgs {
    /// Prompt text.
    #[arg(long, short)]
    pub prompt: Option<String>,
    /// Media file relative to EVALBENCH_UPLOAD_DIR; repeatable.
    #[arg(long = "media")]
    pub media: Vec<String>,
}

impl InputArgs {
    pub fn payload(&self) -> Result<InputPayload, String> {
        let mut payload = InputPayload {
            text: self.prompt.clone(),
            media: Vec::new(),
        };
        for path in &self.media {
            let mime = mime_from_path(path)
                .ok_or_else(|| format!("cannot tell the media type of {path}"))?;
            let media = MediaRef::stored(mime, path.clone())
                .ok_or_else(|| format!("{path} is not image, audio or video"))?;
            payload = payload.with_media(media);
        }
        Ok(payload)
    }
}

pub fn comparison_groups(
    model_a: &str,
    model_b: &str,
    params: &ParamArgs,
    input: &InputPayload,
) -> Vec<ComparisonGroupSpec> {
    [model_a, model_b]
        .into_iter()
        .map(|model| {
            ComparisonGroupSpec::new(
                ModelTarget::new(model).modalities(input.media.iter().map(|m| m.modality)),
            )
            .params(params.params())
        })
        .collect()
}

fn mime_from_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    })
}
