//! Tests for `error` module

use super::error::*;

fn all_variants() -> Vec<Error> {
    vec![
        Error::Connection("test".into()),
        Error::Timeout("test".into()),
        Error::Database("test".into()),
        Error::DataCorruption("test".into()),
        Error::DimensionMismatch {
            expected: 1536,
            actual: 768,
        },
        Error::InvalidId("abc".into()),
        Error::IdConflict("test".into()),
        Error::Config("test".into()),
        Error::Http("test".into()),
        Error::Authentication("test".into()),
        Error::RateLimit(60),
        Error::Backend {
            code: 1100,
            message: "test".into(),
        },
        Error::NotImplemented("test".into()),
        Error::Io(std::io::Error::other("test")),
        Error::Serialization("test".into()),
        Error::Closed("pg".into()),
    ]
}

#[test]
fn test_error_codes_are_unique() {
    // Arrange
    let errors = all_variants();

    // Act
    let codes: Vec<&str> = errors.iter().map(Error::code).collect();

    // Assert
    let mut unique_codes = codes.clone();
    unique_codes.sort_unstable();
    unique_codes.dedup();
    assert_eq!(codes.len(), unique_codes.len(), "Error codes must be unique");
    for code in &codes {
        assert!(code.starts_with("VS-"), "Code {code} should start with VS-");
    }
}

#[test]
fn test_error_display_includes_code() {
    for err in all_variants() {
        let display = err.to_string();
        assert!(
            display.contains(&format!("[{}]", err.code())),
            "'{display}' should contain its code"
        );
    }
}

#[test]
fn test_dimension_mismatch_message() {
    let err = Error::DimensionMismatch {
        expected: 1536,
        actual: 3,
    };
    assert_eq!(
        err.to_string(),
        "[VS-005] Vector dimension mismatch: expected 1536, got 3"
    );
}

#[test]
fn test_only_connection_errors_are_fatal() {
    let fatal: Vec<&str> = all_variants()
        .iter()
        .filter(|e| e.is_fatal_connection())
        .map(Error::code)
        .collect();
    assert_eq!(fatal, vec!["VS-001"]);
}

#[test]
fn test_sqlx_pool_errors_map_to_connection_family() {
    assert!(matches!(
        Error::from(sqlx::Error::PoolTimedOut),
        Error::Timeout(_)
    ));
    assert!(Error::from(sqlx::Error::PoolClosed).is_fatal_connection());
    assert!(matches!(
        Error::from(sqlx::Error::RowNotFound),
        Error::DataCorruption(_)
    ));
}

#[test]
fn test_serde_json_error_maps_to_serialization() {
    let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    assert!(matches!(Error::from(err), Error::Serialization(_)));
}
