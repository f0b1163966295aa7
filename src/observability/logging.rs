//! `tracing` subscriber setup and span macros
//!
//! `LOG_LEVEL` picks the level (INFO by default), `LOG_FORMAT` picks `json`,
//! `pretty` or `compact` output (json by default) and `LOG_SPANS=true` adds span
//! open/close events. `RUST_LOG` replaces the whole filter when set.
//!
//! Each actor runs inside its own span: [`mqtt_span!`] for the connection manager,
//! [`provisioning_span!`] for a session and [`registration_span!`] for one
//! register-and-poll run.

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Case-insensitive; anything unrecognised is [`LogFormat::Json`]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Filter used when `RUST_LOG` is unset: `level` for this crate, warnings only
/// from the MQTT and TLS stacks underneath it.
fn default_filter(level: Level) -> String {
    format!("{level},rumqttc=warn,rustls=warn,tokio=warn")
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let registry = tracing_subscriber::registry().with(filter);
    let spans = span_events(include_spans);

    let installed = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };
    // Tests and embedding applications may have installed one already
    installed.ok();
}

/// Parse a level name, falling back to INFO
pub fn parse_level(name: &str) -> Level {
    match name.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Level selected by `-v` flags on the command line, if any
pub fn level_for_verbosity(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn flag_enabled(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Initialize logging from the environment; `level_override` wins over `LOG_LEVEL`.
pub fn init_default_logging(level_override: Option<Level>) {
    let level = level_override
        .or_else(|| env::var("LOG_LEVEL").ok().map(|name| parse_level(&name)))
        .unwrap_or(Level::INFO);
    let format = env::var("LOG_FORMAT")
        .map(|name| LogFormat::parse(&name))
        .unwrap_or(LogFormat::Json);
    let include_spans = flag_enabled(env::var("LOG_SPANS").ok());

    init_logging(level, format, include_spans);
}

/// Span wrapping the connection manager actor
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_connection", $($field)*)
    };
}

/// Span wrapping a provisioning session actor
#[macro_export]
macro_rules! provisioning_span {
    ($($field:tt)*) => {
        tracing::info_span!("provisioning_session", $($field)*)
    };
}

/// Span wrapping one register-and-poll run
#[macro_export]
macro_rules! registration_span {
    ($($field:tt)*) => {
        tracing::info_span!("registration", $($field)*)
    };
}

pub use {mqtt_span, provisioning_span, registration_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse_is_case_insensitive() {
        assert_eq!(LogFormat::parse("jSoN"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PrEtTy"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("CoMpAcT"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
    }

    #[test]
    fn test_span_events_follow_flag() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_default_filter_quiets_dependencies() {
        let filter = default_filter(Level::DEBUG);
        assert!(filter.starts_with("DEBUG,"));
        assert!(filter.contains("rumqttc=warn"));
    }

    #[test]
    fn test_log_spans_flag() {
        let cases = [
            (Some("true"), true),
            (Some("TRUE"), true),
            (Some("false"), false),
            (Some("yes"), false),
            (Some("1"), false),
            (None, false),
        ];
        for (input, expected) in cases {
            assert_eq!(
                flag_enabled(input.map(str::to_string)),
                expected,
                "Failed for input: {input:?}"
            );
        }
    }

    #[test]
    fn test_span_macros_build_named_spans() {
        let span = crate::registration_span!(registration_id = "device-1");
        // Disabled without a subscriber, but the macro must expand
        let _ = span.is_disabled();
    }
}
