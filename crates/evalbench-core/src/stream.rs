use crate::errors::CallFailure;

/// Compact per-chunk record kept for debugging a call after the fact.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DebugChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content snippet, truncated to `DEBUG_CONTENT_LIMIT` characters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

pub const DEBUG_CONTENT_LIMIT: usize = 200;

/// Prompt/completion token counts reported by the endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Normalized events produced by one call, in the order they happened.
///
/// `Done` and `Error` are terminal: exactly one of them ends every call and
/// nothing follows it.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental generated text (never cumulative).
    Token { text: String },
    /// Generated audio available at `url`.
    Audio { url: String },
    /// Token accounting; at most once, immediately before the terminal event.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Successful completion.
    Done {
        elapsed_ms: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        debug_chunks: Vec<DebugChunk>,
    },
    /// Call-ending failure; partial output already streamed stays valid.
    Error {
        message: String,
        is_timeout: bool,
        elapsed_ms: u64,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub(crate) fn from_failure(failure: &CallFailure, elapsed_ms: u64) -> Self {
        Self::Error {
            message: failure.to_string(),
            is_timeout: failure.is_timeout(),
            elapsed_ms,
        }
    }
}

/// One side of a comparison run; serialized as its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Group {
    Zero,
    One,
}

impl Group {
    pub const BOTH: [Group; 2] = [Group::Zero, Group::One];

    pub fn index(self) -> usize {
        match self {
            Group::Zero => 0,
            Group::One => 1,
        }
    }
}

impl From<Group> for u8 {
    fn from(group: Group) -> Self {
        match group {
            Group::Zero => 0,
            Group::One => 1,
        }
    }
}

impl TryFrom<u8> for Group {
    type Error = String;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        match index {
            0 => Ok(Group::Zero),
            1 => Ok(Group::One),
            other => Err(format!("comparison group must be 0 or 1, got {other}")),
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// A call event tagged with the comparison group that produced it.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct GroupEvent {
    pub group: Group,
    pub event: StreamEvent,
}
