//! Tests for the Milvus adapter against a mocked REST endpoint.

use super::milvus::*;
use super::VectorStore;
use crate::connection::ConnectionManager;
use crate::error::Error;
use crate::filter::CollectionFilter;
use crate::types::{DeleteSelector, RecallRequest, TenantScope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{any, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ok(data: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 0, "data": data }))
}

async fn mount(server: &MockServer, endpoint: &str, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(format!("/v2/vectordb/{endpoint}")))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn store_for(server: &MockServer) -> (MilvusStore, Arc<ConnectionManager<MilvusConnector>>) {
    mount(server, "collections/list", ok(json!(["modeldata"]))).await;
    let manager = Arc::new(ConnectionManager::new(
        MilvusConnector::new(server.uri(), None, Duration::from_secs(5)),
        Duration::from_millis(10),
    ));
    let store = MilvusStore::new(manager.clone(), "modeldata".into(), 3, 100);
    (store, manager)
}

// -------------------------------------------------------------------------
// Expression builders
// -------------------------------------------------------------------------

#[test]
fn test_quote_escapes() {
    assert_eq!(quote("abc"), "\"abc\"");
    assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
}

#[test]
fn test_recall_filter_expressions() {
    let datasets = vec!["d1".to_string(), "d2".to_string()];

    assert_eq!(
        recall_filter("t1", &datasets, &CollectionFilter::Unrestricted),
        r#"teamId == "t1" and datasetId in ["d1", "d2"]"#
    );
    assert_eq!(
        recall_filter("t1", &datasets, &CollectionFilter::Allow(vec!["c1".into()])),
        r#"teamId == "t1" and datasetId in ["d1", "d2"] and collectionId in ["c1"]"#
    );
    assert_eq!(
        recall_filter("t1", &datasets, &CollectionFilter::Deny(vec!["c1".into()])),
        r#"teamId == "t1" and datasetId in ["d1", "d2"] and collectionId not in ["c1"]"#
    );
}

#[test]
fn test_delete_filter_expressions() {
    assert_eq!(
        delete_filter("t", &DeleteSelector::Id("5".into())).unwrap(),
        r#"teamId == "t" and id == 5"#
    );
    assert_eq!(
        delete_filter("t", &DeleteSelector::IdList(vec!["1".into(), "2".into()])).unwrap(),
        r#"teamId == "t" and id in [1, 2]"#
    );
    assert_eq!(
        delete_filter(
            "t",
            &DeleteSelector::Datasets {
                dataset_ids: vec!["d".into()],
                collection_ids: Some(vec!["c".into()]),
            }
        )
        .unwrap(),
        r#"teamId == "t" and datasetId in ["d"] and collectionId in ["c"]"#
    );
    assert!(matches!(
        delete_filter("t", &DeleteSelector::Id("x".into())),
        Err(Error::InvalidId(_))
    ));
}

#[test]
fn test_value_to_id_accepts_numbers_and_strings() {
    assert_eq!(value_to_id(&json!(42)).unwrap(), 42);
    assert_eq!(value_to_id(&json!("43")).unwrap(), 43);
    assert!(value_to_id(&json!(null)).is_err());
}

#[test]
fn test_create_collection_body_uses_ip_metric() {
    let body = create_collection_body("modeldata", 1536, false);

    assert_eq!(body["schema"]["autoId"], json!(false));
    assert_eq!(body["schema"]["fields"][1]["elementTypeParams"]["dim"], json!("1536"));
    assert_eq!(body["indexParams"][0]["metricType"], json!("IP"));
}

// -------------------------------------------------------------------------
// Store against the mocked endpoint
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_search_returns_similarity_descending() {
    // Arrange
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .and(body_partial_json(json!({
            "filter": r#"teamId == "t1" and datasetId in ["d1"] and collectionId not in ["c9"]"#,
            "searchParams": { "metricType": "IP" },
        })))
        .respond_with(ok(json!([
            { "id": 1, "distance": 0.2, "collectionId": "c1" },
            { "id": "2", "distance": 0.9, "collectionId": "c2" },
        ])))
        .expect(1)
        .mount(&server)
        .await;
    let request =
        RecallRequest::new("t1", vec!["d1".into()], vec![0.1, 0.2, 0.3], 5).forbid(vec!["c9".into()]);

    // Act
    let results = store.emb_recall(&request).await.unwrap();

    // Assert
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "2");
    assert!((results[0].score - 0.9).abs() < 1e-9);
    assert_eq!(results[1].id, "1");
    assert_eq!(results[1].collection_id, "c1");
}

#[tokio::test]
async fn test_empty_allow_set_sends_no_request() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ok(json!({})))
        .expect(0)
        .mount(&server)
        .await;
    let manager = Arc::new(ConnectionManager::new(
        MilvusConnector::new(server.uri(), None, Duration::from_secs(5)),
        Duration::from_millis(10),
    ));
    let store = MilvusStore::new(manager.clone(), "modeldata".into(), 3, 100);
    let request = RecallRequest::new("t1", vec!["d1".into()], vec![0.1, 0.2, 0.3], 5)
        .forbid(vec!["c1".into(), "c2".into()])
        .only(vec!["c2".into(), "c1".into()]);

    // Act
    let results = store.emb_recall(&request).await.unwrap();

    // Assert
    assert!(results.is_empty());
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn test_insert_with_auto_id_returns_server_ids() {
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    mount(&server, "collections/describe", ok(json!({ "autoId": true }))).await;
    mount(
        &server,
        "entities/insert",
        ok(json!({ "insertCount": 2, "insertIds": [11, "12"] })),
    )
    .await;

    let ids = store
        .insert(
            &TenantScope::new("t", "d", "c"),
            &[vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]],
        )
        .await
        .unwrap();

    assert_eq!(ids, vec!["11".to_string(), "12".to_string()]);
}

#[tokio::test]
async fn test_insert_without_auto_id_synthesizes_ids() {
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    mount(&server, "collections/describe", ok(json!({ "autoId": false }))).await;
    mount(
        &server,
        "entities/insert",
        ok(json!({ "insertCount": 2, "insertIds": [] })),
    )
    .await;

    let ids = store
        .insert(
            &TenantScope::new("t", "d", "c"),
            &[vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]],
        )
        .await
        .unwrap();

    let numeric: Vec<i64> = ids.iter().map(|id| id.parse().unwrap()).collect();
    assert_eq!(numeric.len(), 2);
    assert!(numeric[0] > 0 && numeric[0] < numeric[1]);
}

#[tokio::test]
async fn test_backend_error_code_surfaces() {
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "code": 1100, "message": "invalid parameter" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    let request = RecallRequest::new("t", vec!["d".into()], vec![0.0; 3], 5);

    let result = store.emb_recall(&request).await;

    match result {
        Err(Error::Backend { code, message }) => {
            assert_eq!(code, 1100);
            assert_eq!(message, "invalid parameter");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_count_reads_count_star() {
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({
            "filter": r#"teamId == "t" and datasetId == "d""#,
            "outputFields": ["count(*)"],
        })))
        .respond_with(ok(json!([{ "count(*)": 7 }])))
        .mount(&server)
        .await;

    assert_eq!(store.count_by_dataset("t", "d").await.unwrap(), 7);
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication() {
    let server = MockServer::start().await;
    mount(
        &server,
        "collections/has",
        ResponseTemplate::new(401).set_body_string("bad token"),
    )
    .await;
    let client = MilvusClient::new(&server.uri(), Some("root:Milvus".into()), Duration::from_secs(5));

    let result = client.has_collection("modeldata").await;

    assert!(matches!(result, Err(Error::Authentication(_))));
}

#[tokio::test]
async fn test_init_creates_missing_collection() {
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    mount(&server, "collections/has", ok(json!({ "has": false }))).await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/create"))
        .and(body_partial_json(json!({ "schema": { "autoId": true } })))
        .respond_with(ok(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    mount(&server, "collections/load", ok(json!({}))).await;
    mount(&server, "collections/describe", ok(json!({ "autoId": true }))).await;

    store.init().await.unwrap();
}

#[tokio::test]
async fn test_data_by_time_pages_past_one_query_window() {
    // Arrange
    let server = MockServer::start().await;
    let (store, _) = store_for(&server).await;
    let start = chrono::DateTime::from_timestamp_millis(1_000).unwrap();
    let end = chrono::DateTime::from_timestamp_millis(2_000).unwrap();
    let window = r#"createTime >= 1000 and createTime <= 2000"#;
    let total = MAX_QUERY_WINDOW as i64 + 3_616;
    let rows = |ids: std::ops::RangeInclusive<i64>| {
        json!(ids
            .map(|id| json!({ "id": id, "teamId": "t", "datasetId": "d" }))
            .collect::<Vec<_>>())
    };
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({ "filter": window, "limit": MAX_QUERY_WINDOW })))
        .respond_with(ok(rows(1..=MAX_QUERY_WINDOW as i64)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/query"))
        .and(body_partial_json(json!({
            "filter": format!("id > {MAX_QUERY_WINDOW} and ({window})"),
        })))
        .respond_with(ok(rows(MAX_QUERY_WINDOW as i64 + 1..=total)))
        .expect(1)
        .mount(&server)
        .await;

    // Act
    let refs = store.data_by_time(start, end).await.unwrap();

    // Assert
    assert_eq!(refs.len(), total as usize);
    assert_eq!(refs.last().map(|r| r.id.clone()), Some(total.to_string()));
}

#[tokio::test]
async fn test_query_all_rejects_a_cursor_that_does_not_move() {
    let server = MockServer::start().await;
    let full_page: Vec<serde_json::Value> = (0..MAX_QUERY_WINDOW).map(|_| json!({ "id": 7 })).collect();
    mount(&server, "entities/query", ok(json!(full_page))).await;
    let client = MilvusClient::new(&server.uri(), None, Duration::from_secs(5));

    let result = client.query_all("modeldata", "id > 0", &["id"]).await;

    assert!(matches!(result, Err(Error::DataCorruption(_))));
}
