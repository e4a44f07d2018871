//! Tests for the pgvector adapter that need no database.

use super::pg::*;
use super::VectorStore;
use crate::config::{PgConfig, PoolConfig};
use crate::connection::ConnectionManager;
use crate::error::Error;
use crate::filter::CollectionFilter;
use crate::types::{DeleteSelector, RecallRequest, TenantScope};
use std::sync::Arc;
use std::time::Duration;

/// Store whose pool would point at a closed port. Nothing here may connect.
fn offline_store() -> (PgVectorStore, Arc<ConnectionManager<PgConnector>>) {
    let manager = Arc::new(ConnectionManager::new(
        PgConnector::new("postgres://127.0.0.1:1/none".into(), PoolConfig::default()),
        Duration::from_millis(10),
    ));
    let store = PgVectorStore::new(manager.clone(), "modeldata".into(), 3, PgConfig::default());
    (store, manager)
}

// -------------------------------------------------------------------------
// SQL builders
// -------------------------------------------------------------------------

#[test]
fn test_schema_uses_inner_product_hnsw() {
    let statements = schema_statements("modeldata", 768);

    assert_eq!(statements[0], "CREATE EXTENSION IF NOT EXISTS vector");
    assert!(statements[1].contains("VECTOR(768)"));
    assert!(statements[1].contains("BIGSERIAL PRIMARY KEY"));
    assert!(statements[2].contains("hnsw (vector vector_ip_ops)"));
    assert!(statements[2].contains("m = 32, ef_construction = 128"));
    assert!(statements[2..].iter().all(|s| s.contains("CONCURRENTLY IF NOT EXISTS")));
}

#[test]
fn test_recall_sql_unrestricted() {
    let sql = recall_sql("modeldata", &CollectionFilter::Unrestricted);

    assert!(sql.contains("vector <#> $1::vector AS score"));
    assert!(sql.contains("team_id = $2 AND dataset_id = ANY($3)"));
    assert!(!sql.contains("collection_id = ANY"));
    assert!(sql.contains("LIMIT $4"));
    assert!(sql.contains("AS MATERIALIZED"));
}

#[test]
fn test_recall_sql_allow_and_deny() {
    let allow = recall_sql("modeldata", &CollectionFilter::Allow(vec!["c1".into()]));
    assert!(allow.contains("AND collection_id = ANY($4)"));
    assert!(allow.contains("LIMIT $5"));

    let deny = recall_sql("modeldata", &CollectionFilter::Deny(vec!["c1".into()]));
    assert!(deny.contains("AND NOT (collection_id = ANY($4))"));
    assert!(deny.contains("LIMIT $5"));
}

#[test]
fn test_search_tuning_uses_config() {
    let config = PgConfig {
        ef_search: 64,
        max_scan_tuples: 5000,
        ..PgConfig::default()
    };

    let statements = search_tuning_statements(&config);

    assert_eq!(statements[0], "SET LOCAL hnsw.ef_search = 64");
    assert_eq!(statements[1], "SET LOCAL hnsw.max_scan_tuples = 5000");
    assert_eq!(statements[2], "SET LOCAL hnsw.iterative_scan = relaxed_order");
}

// -------------------------------------------------------------------------
// Calls answered without a connection
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_allow_set_never_connects() {
    // Arrange
    let (store, manager) = offline_store();
    let request = RecallRequest::new("team", vec!["d1".into()], vec![0.1, 0.2, 0.3], 10)
        .forbid(vec!["c1".into()])
        .only(vec!["c1".into()]);

    // Act
    let results = store.emb_recall(&request).await.unwrap();

    // Assert
    assert!(results.is_empty());
    assert!(!manager.is_connected().await);
    assert_eq!(manager.connect_count(), 0);
}

#[tokio::test]
async fn test_empty_datasets_never_connects() {
    let (store, manager) = offline_store();
    let request = RecallRequest::new("team", vec![], vec![0.1, 0.2, 0.3], 10);

    assert!(store.emb_recall(&request).await.unwrap().is_empty());
    assert_eq!(manager.connect_count(), 0);
}

#[tokio::test]
async fn test_insert_rejects_wrong_dimension_before_connecting() {
    let (store, manager) = offline_store();
    let scope = TenantScope::new("t", "d", "c");

    let result = store.insert(&scope, &[vec![0.1, 0.2, 0.3], vec![0.1]]).await;

    assert!(matches!(
        result,
        Err(Error::DimensionMismatch {
            expected: 3,
            actual: 1
        })
    ));
    assert_eq!(manager.connect_count(), 0);
}

#[tokio::test]
async fn test_delete_noop_and_invalid_ids() {
    let (store, manager) = offline_store();

    store
        .delete("t", &DeleteSelector::IdList(vec![]))
        .await
        .unwrap();
    let invalid = store
        .delete("t", &DeleteSelector::IdList(vec!["1".into(), "abc".into()]))
        .await;

    assert!(matches!(invalid, Err(Error::InvalidId(_))));
    assert_eq!(manager.connect_count(), 0);
}
