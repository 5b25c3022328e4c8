//! # Structured Logging
//!
//! One `tracing` subscriber for the whole process, written to stderr. Stdout
//! is kept for what the commands print (peer id, addresses, `version`).
//!
//! The protocol crate logs inside a `node` span carrying the peer id and
//! network id. The JSON format keeps that span on every line.

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// libp2p internals that are chatty at `info` on a healthy node.
const QUIET_DEPENDENCIES: &[&str] = &[
    "libp2p_swarm=warn",
    "libp2p_tcp=warn",
    "multistream_select=warn",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// `"json"` in any case selects JSON, anything else is pretty.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log directive: {0}")]
    Directive(#[from] ParseError),

    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(#[from] TryInitError),
}

/// The filter used when `RUST_LOG` is unset: our own directives plus the
/// libp2p noise floor. Anything in `RUST_LOG` replaces all of it.
fn filter(rust_log: Option<&str>, default_directives: &str) -> Result<EnvFilter, ParseError> {
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => {
            let mut directives = vec![default_directives];
            directives.extend_from_slice(QUIET_DEPENDENCIES);
            EnvFilter::try_new(directives.join(","))
        }
    }
}

/// Installs the global subscriber. Call once, before bootstrapping.
pub fn init_logging(default_directives: &str, format: LogFormat) -> Result<(), LoggingError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let env_filter = filter(rust_log.as_deref(), default_directives)?;

    let layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;

    tracing::debug!(?format, "logging initialized");
    Ok(())
}
