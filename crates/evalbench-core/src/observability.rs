use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "evalbench.logs.jsonl";

/// Logging settings read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// Explicit filter directive; falls back to `RUST_LOG`, then `info`.
    pub level: Option<String>,
    /// JSON lines go here when set; otherwise compact console output on stderr.
    pub json_path: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("EVALBENCH_OBSERVABILITY")
                .ok()
                .map(|v| parse_bool_env(&v).unwrap_or(true))
                .unwrap_or(true),
            level: std::env::var("EVALBENCH_LOG_LEVEL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            json_path: std::env::var("EVALBENCH_JSON_LOG_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        if let Some(level) = &self.level
            && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
        {
            return filter;
        }
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    const ON: [&str; 5] = ["1", "true", "yes", "on", "enabled"];
    const OFF: [&str; 5] = ["0", "false", "no", "off", "disabled"];
    let value = value.trim().to_ascii_lowercase();
    if ON.contains(&value.as_str()) {
        Some(true)
    } else if OFF.contains(&value.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Opens the JSON log file, creating its directory; a bare file name lands in `.`.
fn json_log_appender(path: &Path) -> std::io::Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            parent
        }
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    tracing_appender::rolling::RollingFileAppender::builder()
        .filename_prefix(file_name)
        .build(dir)
        .map_err(std::io::Error::other)
}

/// The JSON appender, or `None` (with a note on stderr) when the file cannot be opened.
fn open_json_log(path: &Path) -> Option<RollingFileAppender> {
    match json_log_appender(path) {
        Ok(appender) => Some(appender),
        Err(err) => {
            // No subscriber is installed yet.
            eprintln!(
                "evalbench: cannot open JSON log {}: {err}; logging to stderr",
                path.display()
            );
            None
        }
    }
}

/// Installs the process-wide subscriber once, using `LogSettings::from_env`.
///
/// - `EVALBENCH_OBSERVABILITY`: `false`/`0`/`off` disables logging entirely.
/// - `EVALBENCH_LOG_LEVEL`: filter directive (`debug`, `evalbench_core=trace`, ...).
/// - `RUST_LOG`: used when `EVALBENCH_LOG_LEVEL` is unset or invalid.
/// - `EVALBENCH_JSON_LOG_PATH`: write JSON lines to this file instead of stderr.
pub fn init_observability() {
    init_with(LogSettings::from_env());
}

pub fn init_with(settings: LogSettings) {
    INIT.get_or_init(|| {
        if !settings.enabled {
            return;
        }
        // Exactly one of the two layers is present.
        let json = settings.json_path.as_deref().and_then(open_json_log).map(|appender| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(appender)
        });
        let console = json.is_none().then(|| {
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr)
        });
        let _ = tracing_subscriber::registry()
            .with(settings.env_filter())
            .with(json)
            .with(console)
            .try_init();
    });
}
