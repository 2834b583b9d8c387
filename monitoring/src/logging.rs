//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{self, filter::LevelFilter, EnvFilter};

static MAT_LOG_ENV_VAR: &str = "MAT_LOG";

/// List of crates in the workspace.
const MAT_CRATES: &[&str] = &[
    "annotation_db",
    "clients",
    "materialize",
    "monitoring",
    "query_engine",
];

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, mat_log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", mat_log_level);
    });
}

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level = std::env::var(MAT_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in MAT_CRATES {
        // Add directives for each crate in MAT_CRATES, if not overriden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            if let Ok(directive) = format!("{crate_name}={log_level}").parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    (env_filter, log_level)
}

/// Renders the full source chain of an error for structured log fields.
///
/// The `Display` output of wrapper errors often omits the root cause, so log
/// call sites pass `error_source = error_source(&err)` alongside `error = %err`.
pub fn error_source(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = String::new();
    let mut source = err.source();
    while let Some(cause) = source {
        if !out.is_empty() {
            out.push_str(": ");
        }
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failed")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner cause")]
    struct Inner;

    #[test]
    fn error_source_walks_the_chain() {
        let err = Outer(Inner);
        assert_eq!(error_source(&err), "inner cause");
    }

    #[test]
    fn error_source_empty_without_cause() {
        let err = Inner;
        assert_eq!(error_source(&err), "");
    }
}
