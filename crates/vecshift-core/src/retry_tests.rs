//! Tests for `retry` module

use super::error::Error;
use super::retry::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ==================== RetryConfig Tests ====================

#[test]
fn test_retry_config_default() {
    // Arrange & Act
    let config = RetryConfig::default();

    // Assert
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.initial_delay, Duration::from_millis(500));
    assert_eq!(config.max_delay, Duration::from_secs(30));
    assert!(config.add_jitter);
}

#[test]
fn test_fixed_delay_does_not_grow() {
    // Arrange
    let config = RetryConfig::fixed(3, Duration::from_millis(500));

    // Act & Assert
    assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
    assert_eq!(config.delay_for_attempt(1), Duration::from_millis(500));
    assert_eq!(config.delay_for_attempt(2), Duration::from_millis(500));
    assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
}

#[test]
fn test_delay_for_attempt_exponential() {
    // Arrange
    let config = RetryConfig {
        initial_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_secs(100),
        add_jitter: false,
        ..Default::default()
    };

    // Act & Assert
    assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
    assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
    assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
}

#[test]
fn test_delay_capped_at_max() {
    let config = RetryConfig {
        initial_delay: Duration::from_secs(10),
        backoff_multiplier: 10.0,
        max_delay: Duration::from_secs(30),
        add_jitter: false,
        ..Default::default()
    };

    assert_eq!(config.delay_for_attempt(5), Duration::from_secs(30));
}

// ==================== is_retryable_error Tests ====================

#[test]
fn test_connection_and_timeout_are_retryable() {
    assert!(is_retryable_error(&Error::Connection("refused".into())));
    assert!(is_retryable_error(&Error::Timeout("30s".into())));
    assert!(is_retryable_error(&Error::RateLimit(60)));
}

#[test]
fn test_backend_server_error_is_retryable() {
    let error = Error::Backend {
        code: 503,
        message: "service unavailable".into(),
    };
    assert!(is_retryable_error(&error));
}

#[test]
fn test_database_deadlock_is_retryable() {
    assert!(is_retryable_error(&Error::Database(
        "deadlock detected".into()
    )));
}

#[test]
fn test_data_errors_are_not_retryable() {
    assert!(!is_retryable_error(&Error::DataCorruption("bad".into())));
    assert!(!is_retryable_error(&Error::DimensionMismatch {
        expected: 3,
        actual: 2
    }));
    assert!(!is_retryable_error(&Error::Authentication("401".into())));
    assert!(!is_retryable_error(&Error::Database(
        "syntax error at or near".into()
    )));
}

// ==================== with_retry Tests ====================

#[tokio::test]
async fn test_with_retry_success_after_retries() {
    // Arrange
    let config = RetryConfig::fixed(3, Duration::from_millis(1));
    let call_count = Arc::new(AtomicU32::new(0));
    let counter = call_count.clone();

    // Act
    let result = with_retry(&config, "test_op", || {
        let count = counter.clone();
        async move {
            if count.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Connection("connection reset".into()))
            } else {
                Ok::<_, Error>(42)
            }
        }
    })
    .await;

    // Assert
    assert_eq!(result.unwrap(), 42);
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_with_retry_gives_up_after_max_retries() {
    let config = RetryConfig::fixed(2, Duration::from_millis(1));
    let call_count = Arc::new(AtomicU32::new(0));
    let counter = call_count.clone();

    let result: crate::error::Result<()> = with_retry(&config, "test_op", || {
        let count = counter.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout("query timeout".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(call_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_with_retry_non_retryable_error_no_retry() {
    let config = RetryConfig::fixed(5, Duration::from_millis(1));
    let call_count = Arc::new(AtomicU32::new(0));
    let counter = call_count.clone();

    let result: crate::error::Result<()> = with_retry(&config, "test_op", || {
        let count = counter.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidId("abc".into()))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}
