//! Logging setup for the gepsim binary.
//!
//! Library crates log through `tracing`; this installs the subscriber that prints those
//! events to stderr, human-readable by default or JSON with `GEPSIM_LOG_FORMAT=json`.
//! The level is controlled with `RUST_LOG` and defaults to `info`.

use std::env;
use std::sync::OnceLock;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FORMAT_ENV: &str = "GEPSIM_LOG_FORMAT";

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Errors raised while setting up logging.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log format variable is not valid UTF-8.
    #[error("environment variable `{name}` contained invalid UTF-8: {source}")]
    InvalidUnicode {
        /// Name of the variable.
        name: &'static str,
        #[source]
        source: env::VarError,
    },
    /// `GEPSIM_LOG_FORMAT` names a format other than `human` or `json`.
    #[error("unsupported log format `{provided}`; expected `human` or `json`")]
    UnsupportedFormat {
        /// Value found in the environment.
        provided: String,
    },
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Human,
    Json,
}

/// Install the global subscriber, once.
///
/// Events go to stderr so that output printed by a subcommand on stdout stays clean.
/// Calling this again is a no-op. When another subscriber is already installed it is
/// kept and a note is printed.
///
/// # Errors
/// Returns [`LoggingError`] when `GEPSIM_LOG_FORMAT` is not UTF-8 or names an unknown
/// format.
pub fn init_logging() -> Result<(), LoggingError> {
    if INITIALISED.get().is_some() {
        return Ok(());
    }

    let format = match env::var(LOG_FORMAT_ENV) {
        Ok(raw) => parse_log_format(&raw)?,
        Err(env::VarError::NotPresent) => LogFormat::Human,
        Err(err @ env::VarError::NotUnicode(_)) => {
            return Err(LoggingError::InvalidUnicode {
                name: LOG_FORMAT_ENV,
                source: err,
            });
        }
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let fmt_layer = match format {
        LogFormat::Json => fmt_layer.json().boxed(),
        LogFormat::Human => fmt_layer.boxed(),
    };

    // a subscriber installed elsewhere (e.g. by a test harness) keeps precedence
    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        eprintln!("logging already configured: {}", e);
    }
    let _ = INITIALISED.set(());
    Ok(())
}

fn parse_log_format(raw: &str) -> Result<LogFormat, LoggingError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "human" | "" => Ok(LogFormat::Human),
        "json" => Ok(LogFormat::Json),
        other => Err(LoggingError::UnsupportedFormat {
            provided: other.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::*;

    #[rstest]
    #[case("human", LogFormat::Human)]
    #[case("", LogFormat::Human)]
    #[case(" JSON ", LogFormat::Json)]
    fn test_parse_log_format(#[case] raw: &str, #[case] expected: LogFormat) {
        assert_eq!(parse_log_format(raw).unwrap(), expected);
    }

    #[rstest]
    fn test_unknown_log_format() {
        match parse_log_format("xml") {
            Err(LoggingError::UnsupportedFormat { provided }) => assert_eq!(provided, "xml"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    fn test_init_logging_twice() {
        init_logging().unwrap();
        init_logging().unwrap();
    }
}
