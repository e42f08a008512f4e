//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing_subscriber::{self, EnvFilter, filter::LevelFilter};

static DATABRIDGE_LOG_ENV_VAR: &str = "DATABRIDGE_LOG";

/// Initializes a tracing subscriber for logging.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", log_level);
    });
}

/// List of crates in the workspace.
const DATABRIDGE_CRATES: &[&str] = &["config", "databridge", "monitoring", "staging", "warehouse"];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG, ignoring the malformed ones
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    let log_level = std::env::var(DATABRIDGE_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in DATABRIDGE_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => eprintln!("invalid {DATABRIDGE_LOG_ENV_VAR} level '{log_level}': {err}"),
        }
    }

    (env_filter, log_level)
}

/// Renders the chain of sources below `err` for the `error_source` log field.
///
/// The top-level error is expected to be logged separately (`error = %err`), so only its
/// sources are listed, outermost first. Returns an empty string for errors without a source.
pub fn error_source(err: &dyn Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain.join(" <- ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("middle failure")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn error_source_lists_nested_sources_outermost_first() {
        //* Given
        let err = Outer(Middle(std::io::Error::other("disk on fire")));

        //* When
        let rendered = error_source(&err);

        //* Then
        assert_eq!(rendered, "middle failure <- disk on fire");
    }

    #[test]
    fn error_source_is_empty_without_sources() {
        //* Given
        let err = std::io::Error::other("plain");

        //* When
        let rendered = error_source(&err);

        //* Then
        assert!(rendered.is_empty(), "should render nothing for a leaf error");
    }
}
