//! Tracing/logging initialization.
//!
//! Output is JSON by default (one object per line, UTC timestamps); `compact` is
//! meant for local development. Filtering follows `RUST_LOG`.

use tracing_subscriber::EnvFilter;

pub const LOG_FORMAT_ENV: &str = "CHRONICLE_LOG_FORMAT";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "compact" | "text" => Some(LogFormat::Compact),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    pub format: LogFormat,
    pub with_target: bool,
    /// Unrecognized format name, reported once the subscriber is installed.
    pub rejected_format: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            format: LogFormat::Json,
            with_target: false,
            rejected_format: None,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(raw) => config.with_format_name(&raw),
            Err(_) => config,
        }
    }

    /// Falls back to JSON on an unknown name and keeps the name for [`init_with`].
    pub fn with_format_name(mut self, raw: &str) -> Self {
        match LogFormat::parse(raw) {
            Some(format) => {
                self.format = format;
                self.rejected_format = None;
            }
            None => {
                self.format = LogFormat::Json;
                self.rejected_format = Some(raw.to_string());
            }
        }
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }
}

/// Install the global subscriber. Safe to call multiple times (subsequent calls are no-ops).
pub fn init_with(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };

    if installed.is_ok() {
        if let Some(raw) = &config.rejected_format {
            ::tracing::warn!(env = LOG_FORMAT_ENV, value = %raw, "unknown log format, using json");
        }
    }
}
