//! Logging setup.
//!
//! `RUST_LOG` controls levels; the default keeps the crate and the HTTP
//! trace layer at `info`.

use std::path::Path;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "riskflow=info,tower_http=info";
pub const VERBOSE_FILTER: &str = "riskflow=debug,tower_http=debug";

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown log format: {}", other)),
        }
    }
}

/// Install the global subscriber.
///
/// With a `directory`, logs go to a daily-rolling `riskflow.log` there and the
/// returned guard must be held until exit so buffered lines are flushed.
/// `verbose` only changes the default used when `RUST_LOG` is unset.
/// Later calls are no-ops and return `None`.
pub fn init_logging(
    format: LogFormat,
    directory: Option<&Path>,
    verbose: bool,
) -> Option<WorkerGuard> {
    let mut guard = None;
    INIT.call_once(|| {
        let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

        let (writer, ansi) = match directory {
            Some(dir) => {
                let appender = tracing_appender::rolling::daily(dir, "riskflow.log");
                let (non_blocking, worker) = tracing_appender::non_blocking(appender);
                guard = Some(worker);
                (BoxMakeWriter::new(non_blocking), false)
            }
            None => (BoxMakeWriter::new(std::io::stderr), true),
        };

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(writer))
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_ansi(ansi).with_writer(writer))
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("Logging already initialised: {}", e);
        }
    });
    guard
}
