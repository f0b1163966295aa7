//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format, level and verbosity parsing.

use dps_mqtt::observability::logging::{level_for_verbosity, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats should default to JSON for production safety
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_parse_level() {
    let test_cases = vec![
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Info", Level::INFO),
        ("debug", Level::DEBUG),
        ("TRACE", Level::TRACE),
        ("verbose", Level::INFO),
        ("", Level::INFO),
    ];

    for (input, expected) in test_cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_verbosity_flags() {
    assert_eq!(level_for_verbosity(0), None);
    assert_eq!(level_for_verbosity(1), Some(Level::DEBUG));
    assert_eq!(level_for_verbosity(2), Some(Level::TRACE));
    assert_eq!(level_for_verbosity(7), Some(Level::TRACE));
}
