//! Tracing setup for the worker crates.
//!
//! Directives come from, in order: the `STORYBOOK_LOG` environment variable,
//! the configured `directives`, then [`DEFAULT_DIRECTIVES`].

use serde::Deserialize;
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Environment variable that overrides the configured directives.
pub const LOG_ENV: &str = "STORYBOOK_LOG";

/// Worker lifecycle at `info`, HTTP client internals quiet.
pub const DEFAULT_DIRECTIVES: &str = "storybook_sw=info,storybook_net=info,reqwest=warn,hyper=warn";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-readable.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event, RFC 3339 UTC timestamps.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,

    /// `EnvFilter` directives, e.g. `"storybook_sw=debug"`.
    pub directives: String,

    /// Include file and line of each event.
    pub with_location: bool,

    /// Write through the libtest capture instead of stdout.
    #[serde(skip)]
    pub test_writer: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            directives: DEFAULT_DIRECTIVES.to_string(),
            with_location: false,
            test_writer: false,
        }
    }
}

impl LogConfig {
    /// Routing decisions at `debug`, cache hits at `trace`.
    pub fn verbose() -> Self {
        Self {
            directives: "storybook_sw=trace,storybook_net=debug,reqwest=warn".to_string(),
            with_location: true,
            ..Default::default()
        }
    }

    /// JSON output for log shipping.
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    /// Compact output captured per test.
    pub fn for_tests() -> Self {
        Self {
            format: LogFormat::Compact,
            directives: "storybook_sw=debug,storybook_net=debug".to_string(),
            test_writer: true,
            ..Default::default()
        }
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = directives.into();
        self
    }

    /// Filter from `STORYBOOK_LOG`, else the configured directives.
    /// Unparsable directives fall back to [`DEFAULT_DIRECTIVES`].
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(&self.directives))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(true)
            .with_file(self.with_location)
            .with_line_number(self.with_location);

        match (self.format, self.test_writer) {
            (LogFormat::Pretty, false) => layer.pretty().boxed(),
            (LogFormat::Pretty, true) => layer.pretty().with_test_writer().boxed(),
            (LogFormat::Compact, false) => layer.compact().boxed(),
            (LogFormat::Compact, true) => layer.compact().with_test_writer().boxed(),
            (LogFormat::Json, false) => layer.json().with_timer(ChronoUtc::rfc_3339()).boxed(),
            (LogFormat::Json, true) => layer
                .json()
                .with_timer(ChronoUtc::rfc_3339())
                .with_test_writer()
                .boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` if one was already installed; the existing one is kept.
pub fn init_logging(config: &LogConfig) -> bool {
    let layer = config.fmt_layer().with_filter(config.env_filter());
    tracing_subscriber::registry().with(layer).try_init().is_ok()
}
