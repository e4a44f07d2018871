//! Tests for `connection` module

use super::connection::*;
use super::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connector that fails a fixed number of times before handing out handles.
struct FlakyConnector {
    failures_left: AtomicU32,
    attempts: Arc<AtomicU32>,
    disconnects: Arc<AtomicU32>,
}

impl FlakyConnector {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            attempts: Arc::new(AtomicU32::new(0)),
            disconnects: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    type Handle = u32;

    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn connect(&self) -> Result<u32> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::Connection("connection refused".into()));
        }
        Ok(attempt)
    }

    async fn disconnect(&self, _handle: u32) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_handle_is_lazy() {
    // Arrange
    let connector = FlakyConnector::new(0);
    let attempts = connector.attempts.clone();
    let manager = ConnectionManager::new(connector, Duration::from_millis(1));

    // Assert
    assert!(!manager.is_connected().await);
    assert_eq!(attempts.load(Ordering::SeqCst), 0);

    // Act
    manager.open().await.expect("connect");

    // Assert
    assert!(manager.is_connected().await);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handle_retries_until_connected() {
    // Arrange
    let connector = FlakyConnector::new(3);
    let attempts = connector.attempts.clone();
    let manager = ConnectionManager::new(connector, Duration::from_millis(1));

    // Act
    let handle = manager.handle().await.expect("eventually connects");

    // Assert
    assert_eq!(handle, 4);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(manager.connect_count(), 1);
}

#[tokio::test]
async fn test_handle_is_reused() {
    let manager = ConnectionManager::new(FlakyConnector::new(0), Duration::from_millis(1));

    let first = manager.handle().await.unwrap();
    let second = manager.handle().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.connect_count(), 1);
}

#[tokio::test]
async fn test_fatal_error_resets_handle() {
    // Arrange
    let connector = FlakyConnector::new(0);
    let disconnects = connector.disconnects.clone();
    let manager = ConnectionManager::new(connector, Duration::from_millis(1));
    let first = manager.handle().await.unwrap();

    // Act
    manager
        .report(&Error::Connection("server closed the connection".into()))
        .await;
    let second = manager.handle().await.unwrap();

    // Assert
    assert_ne!(first, second);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.connect_count(), 2);
}

#[tokio::test]
async fn test_non_fatal_error_keeps_handle() {
    let manager = ConnectionManager::new(FlakyConnector::new(0), Duration::from_millis(1));
    manager.open().await.unwrap();

    manager.report(&Error::Database("syntax error".into())).await;

    assert!(manager.is_connected().await);
    assert_eq!(manager.connect_count(), 1);
}

#[tokio::test]
async fn test_run_reports_fatal_errors() {
    let manager = ConnectionManager::new(FlakyConnector::new(0), Duration::from_millis(1));

    let result: Result<()> = manager
        .run(|_handle| async { Err(Error::Connection("broken pipe".into())) })
        .await;

    assert!(result.is_err());
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_close_stops_reconnect_loop() {
    // Arrange
    let manager = Arc::new(ConnectionManager::new(
        FlakyConnector::new(u32::MAX),
        Duration::from_millis(5),
    ));
    let looping = manager.clone();
    let task = tokio::spawn(async move { looping.handle().await });

    // Act
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.close().await;

    // Assert
    let result = task.await.expect("task joins");
    assert!(matches!(result, Err(Error::Closed(_))));
}

#[tokio::test]
async fn test_handle_after_close_fails() {
    let manager = ConnectionManager::new(FlakyConnector::new(0), Duration::from_millis(1));
    manager.open().await.unwrap();

    manager.close().await;

    assert!(matches!(manager.handle().await, Err(Error::Closed(_))));
}
