//! Tests for logging configuration and format parsing
//!
//! Covers the pure functions in the logging module that turn environment
//! values into a format and level.

use msgrelay::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Unknown formats fall back to machine-readable output
    assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
}

#[test]
fn test_parse_level_known_names() {
    let cases = [
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Info", Level::INFO),
        ("debug", Level::DEBUG),
        ("TRACE", Level::TRACE),
    ];

    for (input, expected) in cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}

#[test]
fn test_parse_level_unknown_defaults_to_info() {
    assert_eq!(parse_level("verbose"), Level::INFO);
    assert_eq!(parse_level(""), Level::INFO);
}

#[test]
fn test_log_spans_parsing_logic() {
    // LOG_SPANS is enabled only by a literal "true"
    let test_cases = vec![
        ("true", true),
        ("TRUE", true),
        ("false", false),
        ("", false),
        ("yes", false),
        ("1", false),
    ];

    for (input, expected) in test_cases {
        let result = input.to_lowercase() == "true";
        assert_eq!(result, expected, "Failed for input: {input}");
    }
}
