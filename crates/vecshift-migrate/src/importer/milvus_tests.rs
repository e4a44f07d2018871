//! Tests for the Milvus importer against a mocked REST endpoint.

use super::*;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use vecshift_core::StoreConfig;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": data }))
}

async fn mount(server: &MockServer, endpoint: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/v2/vectordb/{endpoint}")))
        .respond_with(response)
        .mount(server)
        .await;
}

fn record(id: &str) -> VectorRecord {
    VectorRecord {
        id: id.into(),
        vector: vec![0.5, 0.25],
        team_id: "t".into(),
        dataset_id: "d".into(),
        collection_id: "c".into(),
        create_time: Utc::now(),
    }
}

async fn importer_for(server: &MockServer, preserve_ids: bool) -> MilvusImporter {
    mount(server, "collections/list", ok(json!(["modeldata"]))).await;
    let mut config = StoreConfig::default();
    config.vector.dimension = 2;
    let settings = ImporterSettings::from_store(&config, preserve_ids);
    let manager = Arc::new(ConnectionManager::new(
        MilvusConnector::new(server.uri(), None, Duration::from_secs(5)),
        Duration::from_millis(10),
    ));
    MilvusImporter::new(manager, &settings)
}

#[test]
fn test_id_list_filter() {
    assert_eq!(id_list_filter(&[1, 22]), "id in [1, 22]");
}

#[test]
fn test_record_row_carries_tenant_fields() {
    let row = record_row(7, &record("x"));

    assert_eq!(row["id"], json!(7));
    assert_eq!(row["teamId"], json!("t"));
    assert_eq!(row["collectionId"], json!("c"));
}

#[tokio::test]
async fn test_import_skips_present_and_remaps_foreign_ids() {
    // Arrange
    let server = MockServer::start().await;
    let importer = importer_for(&server, true).await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({ "filter": "id in [1, 2, 17]" })))
        .respond_with(ok(json!([{ "id": 1 }])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/upsert"))
        .and(body_partial_json(json!({ "collectionName": "modeldata" })))
        .respond_with(ok(json!({ "upsertCount": 2, "upsertIds": [2, 17] })))
        .expect(1)
        .mount(&server)
        .await;

    // Act
    let outcome = importer
        .import_batch(&[record("1"), record("2"), record("doc-17"), {
            let mut bad = record("3");
            bad.vector = vec![1.0];
            bad
        }])
        .await
        .unwrap();

    // Assert
    assert_eq!(outcome.skipped_ids, vec!["1"]);
    assert_eq!(outcome.inserted_ids, vec!["2", "17"]);
    assert_eq!(outcome.id_mappings.get("doc-17").map(String::as_str), Some("17"));
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].record_id.as_deref(), Some("3"));
    assert_eq!(outcome.migrated(), 3);
}

#[tokio::test]
async fn test_import_without_preservation_maps_every_record() {
    let server = MockServer::start().await;
    let importer = importer_for(&server, false).await;
    mount(&server, "entities/upsert", ok(json!({ "upsertCount": 2 }))).await;

    let outcome = importer
        .import_batch(&[record("1"), record("2")])
        .await
        .unwrap();

    assert_eq!(outcome.inserted_ids.len(), 2);
    assert_eq!(outcome.id_mappings.len(), 2);
    assert_ne!(outcome.id_mappings["1"], "1");
}

#[tokio::test]
async fn test_init_refuses_auto_id_collection() {
    let server = MockServer::start().await;
    let importer = importer_for(&server, true).await;
    mount(&server, "collections/has", ok(json!({ "has": true }))).await;
    mount(&server, "collections/load", ok(json!({}))).await;
    mount(&server, "collections/describe", ok(json!({ "autoId": true }))).await;

    assert!(matches!(importer.init().await, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_existing_ids_keeps_input_order() {
    let server = MockServer::start().await;
    let importer = importer_for(&server, true).await;
    mount(&server, "entities/query", ok(json!([{ "id": "5" }, { "id": 3 }]))).await;

    let present = importer
        .existing_ids(&["3".into(), "4".into(), "5".into(), "junk".into()])
        .await
        .unwrap();

    assert_eq!(present, vec!["3", "5"]);
}

#[tokio::test]
async fn test_existing_ids_splits_lookups_by_query_window() {
    // Arrange
    let server = MockServer::start().await;
    let importer = importer_for(&server, true).await;
    let ids: Vec<String> = (1..=MAX_QUERY_WINDOW as i64 + 2).map(|id| id.to_string()).collect();
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({ "limit": MAX_QUERY_WINDOW })))
        .respond_with(ok(json!([{ "id": 1 }])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({
            "filter": format!("id in [{}, {}]", MAX_QUERY_WINDOW + 1, MAX_QUERY_WINDOW + 2),
            "limit": 2
        })))
        .respond_with(ok(json!([{ "id": MAX_QUERY_WINDOW + 2 }])))
        .expect(1)
        .mount(&server)
        .await;

    // Act
    let present = importer.existing_ids(&ids).await.unwrap();

    // Assert
    assert_eq!(present, vec!["1".to_string(), (MAX_QUERY_WINDOW + 2).to_string()]);
}
