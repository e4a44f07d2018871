//! Milvus adapter over the RESTful v2 API.
//!
//! Every endpoint answers `{ "code": 0, "data": ... }` on success and a
//! non-zero `code` with a `message` on failure, usually with HTTP 200.
//! [`MilvusClient`] unwraps that envelope; [`MilvusStore`] implements the
//! store contract on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{is_write_retryable, rank_results, VectorStore, SEARCH_RETRY_DELAY};
use crate::connection::{ConnectionManager, Connector};
use crate::error::{Error, Result};
use crate::filter::CollectionFilter;
use crate::http::{create_http_client, handle_http_error};
use crate::ids::IdGenerator;
use crate::retry::{with_retry, with_retry_when, RetryConfig};
use crate::types::{
    check_dimensions, parse_id, parse_ids, BackendKind, DeleteSelector, RecallRequest,
    RecallResult, TenantScope, TimedVectorRef,
};

/// Primary key field.
pub const FIELD_ID: &str = "id";
/// Embedding field.
pub const FIELD_VECTOR: &str = "vector";
/// Team id field.
pub const FIELD_TEAM_ID: &str = "teamId";
/// Dataset id field.
pub const FIELD_DATASET_ID: &str = "datasetId";
/// Collection id field.
pub const FIELD_COLLECTION_ID: &str = "collectionId";
/// Creation time field, unix milliseconds.
pub const FIELD_CREATE_TIME: &str = "createTime";

/// Largest page a single `query` call may return.
pub const MAX_QUERY_WINDOW: usize = 16_384;

/// Delay between insert attempts.
pub const INSERT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Thin REST client for one Milvus endpoint.
#[derive(Clone)]
pub struct MilvusClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl MilvusClient {
    /// Creates a client for `address` (e.g. `http://localhost:19530`).
    pub fn new(address: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            http: create_http_client(timeout),
            base_url: address.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Endpoint the client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POSTs `body` to `/v2/vectordb/{path}` and returns the `data` member.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/v2/vectordb/{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(handle_http_error(status.as_u16(), &body, "Milvus"));
        }

        let envelope: Value = response.json().await?;
        unwrap_envelope(envelope)
    }

    /// Names of every collection. Doubles as a connectivity check.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let data = self.post("collections/list", &json!({})).await?;
        Ok(serde_json::from_value(data).unwrap_or_default())
    }

    /// Whether `collection` exists.
    pub async fn has_collection(&self, collection: &str) -> Result<bool> {
        let data = self
            .post("collections/has", &json!({ "collectionName": collection }))
            .await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Creates `collection` with the tenant schema and its indexes.
    pub async fn create_collection(
        &self,
        collection: &str,
        dimension: usize,
        auto_id: bool,
    ) -> Result<()> {
        self.post(
            "collections/create",
            &create_collection_body(collection, dimension, auto_id),
        )
        .await?;
        Ok(())
    }

    /// Loads `collection` into memory so it can be searched.
    pub async fn load_collection(&self, collection: &str) -> Result<()> {
        self.post("collections/load", &json!({ "collectionName": collection }))
            .await?;
        Ok(())
    }

    /// Whether `collection` assigns its own primary keys.
    pub async fn describe_auto_id(&self, collection: &str) -> Result<bool> {
        let data = self
            .post("collections/describe", &json!({ "collectionName": collection }))
            .await?;
        Ok(data.get("autoId").and_then(Value::as_bool).unwrap_or(false))
    }

    /// Creates (if absent) and loads `collection`, returning its effective
    /// auto-id setting.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        dimension: usize,
        auto_id: bool,
    ) -> Result<bool> {
        if !self.has_collection(collection).await? {
            self.create_collection(collection, dimension, auto_id).await?;
            info!(collection, dimension, auto_id, "milvus collection created");
        }
        self.load_collection(collection).await?;
        self.describe_auto_id(collection).await
    }

    /// Inserts rows and returns the primary keys reported by the server.
    pub async fn insert(&self, collection: &str, rows: Vec<Value>) -> Result<Vec<i64>> {
        let data = self
            .post(
                "entities/insert",
                &json!({ "collectionName": collection, "data": rows }),
            )
            .await?;
        parse_id_array(data.get("insertIds"))
    }

    /// Inserts or replaces rows by primary key.
    pub async fn upsert(&self, collection: &str, rows: Vec<Value>) -> Result<Vec<i64>> {
        let data = self
            .post(
                "entities/upsert",
                &json!({ "collectionName": collection, "data": rows }),
            )
            .await?;
        parse_id_array(data.get("upsertIds"))
    }

    /// Deletes every entity matching `filter`.
    pub async fn delete(&self, collection: &str, filter: &str) -> Result<()> {
        self.post(
            "entities/delete",
            &json!({ "collectionName": collection, "filter": filter }),
        )
        .await?;
        Ok(())
    }

    /// Scalar query returning up to `limit` rows with `output_fields`.
    pub async fn query(
        &self,
        collection: &str,
        filter: &str,
        output_fields: &[&str],
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut body = json!({
            "collectionName": collection,
            "filter": filter,
            "outputFields": output_fields,
        });
        if let Some(limit) = limit {
            body["limit"] = json!(limit);
        }
        let data = self.post("entities/query", &body).await?;
        Ok(as_rows(data))
    }

    /// Every entity matching `filter`, read one query window at a time.
    ///
    /// Pages are chained by primary key (`id > last`), so `output_fields`
    /// must include `id`. Paging stops at the first page shorter than the
    /// window.
    pub async fn query_all(
        &self,
        collection: &str,
        filter: &str,
        output_fields: &[&str],
    ) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        let mut cursor: Option<i64> = None;
        loop {
            let expr = match cursor {
                Some(after) => format!("{FIELD_ID} > {after} and ({filter})"),
                None => filter.to_string(),
            };
            let page = self
                .query(collection, &expr, output_fields, Some(MAX_QUERY_WINDOW))
                .await?;
            let full = page.len() >= MAX_QUERY_WINDOW;
            let mut last = None;
            for row in &page {
                let id = id_field(row)?;
                last = Some(last.map_or(id, |max: i64| max.max(id)));
            }
            rows.extend(page);

            match (full, last) {
                (true, Some(id)) if cursor.map_or(true, |after| id > after) => cursor = Some(id),
                (true, _) => {
                    return Err(Error::DataCorruption(format!(
                        "milvus query on {collection} did not advance past id {cursor:?}"
                    )))
                }
                (false, _) => return Ok(rows),
            }
        }
    }

    /// Exact number of entities matching `filter`.
    pub async fn count(&self, collection: &str, filter: &str) -> Result<u64> {
        let rows = self
            .query(collection, filter, &["count(*)"], None)
            .await?;
        rows.first()
            .and_then(|row| row.get("count(*)"))
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::DataCorruption("milvus count(*) missing from response".into()))
    }

    /// Inner-product ANN search.
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &str,
        limit: usize,
        ef: u32,
    ) -> Result<Vec<Value>> {
        let body = json!({
            "collectionName": collection,
            "data": [vector],
            "annsField": FIELD_VECTOR,
            "filter": filter,
            "limit": limit,
            "outputFields": [FIELD_ID, FIELD_COLLECTION_ID],
            "searchParams": { "metricType": "IP", "params": { "ef": ef } },
        });
        let data = self.post("entities/search", &body).await?;
        Ok(as_rows(data))
    }
}

fn unwrap_envelope(envelope: Value) -> Result<Value> {
    let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message = envelope
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(Error::Backend { code, message });
    }
    Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
}

fn as_rows(data: Value) -> Vec<Value> {
    match data {
        Value::Array(rows) => rows,
        _ => Vec::new(),
    }
}

/// Reads an Int64 primary key, which Milvus may render as a number or a string.
pub fn value_to_id(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::InvalidId(n.to_string())),
        Value::String(s) => parse_id(s),
        other => Err(Error::InvalidId(other.to_string())),
    }
}

fn parse_id_array(value: Option<&Value>) -> Result<Vec<i64>> {
    match value {
        Some(Value::Array(ids)) => ids.iter().map(value_to_id).collect(),
        Some(other) => Err(Error::DataCorruption(format!(
            "expected an id array, got {other}"
        ))),
        None => Ok(Vec::new()),
    }
}

/// Request body that creates the tenant collection.
#[must_use]
pub fn create_collection_body(collection: &str, dimension: usize, auto_id: bool) -> Value {
    let varchar = |name: &str| {
        json!({
            "fieldName": name,
            "dataType": "VarChar",
            "elementTypeParams": { "max_length": "64" },
        })
    };
    let scalar_index = |name: &str, kind: &str| {
        json!({
            "fieldName": name,
            "indexName": format!("{name}_index"),
            "params": { "index_type": kind },
        })
    };

    json!({
        "collectionName": collection,
        "schema": {
            "autoId": auto_id,
            "enableDynamicField": false,
            "fields": [
                { "fieldName": FIELD_ID, "dataType": "Int64", "isPrimary": true },
                {
                    "fieldName": FIELD_VECTOR,
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": dimension.to_string() },
                },
                varchar(FIELD_TEAM_ID),
                varchar(FIELD_DATASET_ID),
                varchar(FIELD_COLLECTION_ID),
                { "fieldName": FIELD_CREATE_TIME, "dataType": "Int64" },
            ],
        },
        "indexParams": [
            {
                "fieldName": FIELD_VECTOR,
                "indexName": "vector_HNSW",
                "metricType": "IP",
                "params": { "index_type": "HNSW", "M": 32, "efConstruction": 128 },
            },
            scalar_index(FIELD_TEAM_ID, "Trie"),
            scalar_index(FIELD_DATASET_ID, "Trie"),
            scalar_index(FIELD_COLLECTION_ID, "Trie"),
            scalar_index(FIELD_CREATE_TIME, "STL_SORT"),
        ],
    })
}

/// Quotes a string literal for a Milvus boolean expression.
#[must_use]
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Renders `["a", "b"]` for an `in` expression.
#[must_use]
pub fn quote_list(values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| quote(v)).collect();
    format!("[{}]", items.join(", "))
}

/// Boolean expression for a search confined to a team, its datasets and the
/// collection filter.
#[must_use]
pub fn recall_filter(team_id: &str, dataset_ids: &[String], filter: &CollectionFilter) -> String {
    let mut expr = format!(
        "{FIELD_TEAM_ID} == {} and {FIELD_DATASET_ID} in {}",
        quote(team_id),
        quote_list(dataset_ids)
    );
    match filter {
        CollectionFilter::Allow(ids) => {
            expr.push_str(&format!(" and {FIELD_COLLECTION_ID} in {}", quote_list(ids)));
        }
        CollectionFilter::Deny(ids) => {
            expr.push_str(&format!(
                " and {FIELD_COLLECTION_ID} not in {}",
                quote_list(ids)
            ));
        }
        CollectionFilter::Unrestricted | CollectionFilter::Nothing => {}
    }
    expr
}

/// Boolean expression for a delete inside `team_id`.
pub fn delete_filter(team_id: &str, selector: &DeleteSelector) -> Result<String> {
    let team = format!("{FIELD_TEAM_ID} == {}", quote(team_id));
    let expr = match selector {
        DeleteSelector::Id(id) => format!("{team} and {FIELD_ID} == {}", parse_id(id)?),
        DeleteSelector::IdList(ids) => {
            let ids: Vec<String> = parse_ids(ids)?.iter().map(i64::to_string).collect();
            format!("{team} and {FIELD_ID} in [{}]", ids.join(", "))
        }
        DeleteSelector::Datasets {
            dataset_ids,
            collection_ids,
        } => {
            let mut expr = format!("{team} and {FIELD_DATASET_ID} in {}", quote_list(dataset_ids));
            if let Some(collection_ids) = collection_ids {
                expr.push_str(&format!(
                    " and {FIELD_COLLECTION_ID} in {}",
                    quote_list(collection_ids)
                ));
            }
            expr
        }
    };
    Ok(expr)
}

/// One entity row in insert/upsert payloads.
#[must_use]
pub fn entity_row(
    id: Option<i64>,
    vector: &[f32],
    scope: &TenantScope,
    create_time: DateTime<Utc>,
) -> Value {
    let mut row = json!({
        FIELD_VECTOR: vector,
        FIELD_TEAM_ID: scope.team_id,
        FIELD_DATASET_ID: scope.dataset_id,
        FIELD_COLLECTION_ID: scope.collection_id,
        FIELD_CREATE_TIME: create_time.timestamp_millis(),
    });
    if let Some(id) = id {
        row[FIELD_ID] = json!(id);
    }
    row
}

/// Reads the primary key of a returned row.
pub fn id_field(row: &Value) -> Result<i64> {
    row.get(FIELD_ID).map_or_else(
        || Err(Error::DataCorruption(format!("milvus row missing '{FIELD_ID}'"))),
        value_to_id,
    )
}

/// Reads a required string field of a returned row.
pub fn string_field(row: &Value, field: &str) -> Result<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::DataCorruption(format!("milvus row missing '{field}'")))
}

/// Creates [`MilvusClient`]s and checks the endpoint answers.
pub struct MilvusConnector {
    address: String,
    token: Option<String>,
    timeout: Duration,
}

impl MilvusConnector {
    /// Creates a connector for `address`.
    pub fn new(address: String, token: Option<String>, timeout: Duration) -> Self {
        Self {
            address,
            token,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for MilvusConnector {
    type Handle = MilvusClient;

    fn name(&self) -> &'static str {
        "milvus"
    }

    async fn connect(&self) -> Result<MilvusClient> {
        let client = MilvusClient::new(&self.address, self.token.clone(), self.timeout);
        client.list_collections().await?;
        Ok(client)
    }

    async fn disconnect(&self, _client: MilvusClient) {}
}

/// Vector store backed by a Milvus collection with metric `IP`.
pub struct MilvusStore {
    manager: Arc<ConnectionManager<MilvusConnector>>,
    collection: String,
    dimension: usize,
    ef: u32,
    auto_id: OnceCell<bool>,
    ids: IdGenerator,
}

impl MilvusStore {
    /// Creates an adapter sharing `manager`'s client.
    pub fn new(
        manager: Arc<ConnectionManager<MilvusConnector>>,
        collection: String,
        dimension: usize,
        ef: u32,
    ) -> Self {
        Self {
            manager,
            collection,
            dimension,
            ef,
            auto_id: OnceCell::new(),
            ids: IdGenerator::new(),
        }
    }

    async fn auto_id(&self) -> Result<bool> {
        self.auto_id
            .get_or_try_init(|| async {
                self.manager
                    .run(|client| async move { client.describe_auto_id(&self.collection).await })
                    .await
            })
            .await
            .copied()
    }

    async fn insert_once(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        let auto_id = self.auto_id().await?;
        let now = Utc::now();
        let client_ids = if auto_id {
            None
        } else {
            Some(self.ids.next_ids(vectors.len()))
        };
        let rows: Vec<Value> = vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| {
                let id = client_ids.as_ref().map(|ids| ids[i]);
                entity_row(id, vector, scope, now)
            })
            .collect();

        let returned = self
            .manager
            .run(|client| async move { client.insert(&self.collection, rows).await })
            .await?;

        let ids = match client_ids {
            Some(ids) => ids,
            None => returned,
        };
        if ids.len() != vectors.len() {
            return Err(Error::DataCorruption(format!(
                "milvus returned {} ids for {} rows",
                ids.len(),
                vectors.len()
            )));
        }
        Ok(ids.iter().map(i64::to_string).collect())
    }

    async fn recall_once(&self, request: &RecallRequest, expr: &str) -> Result<Vec<RecallResult>> {
        let hits = self
            .manager
            .run(|client| async move {
                client
                    .search(&self.collection, &request.vector, expr, request.limit, self.ef)
                    .await
            })
            .await?;

        hits.iter()
            .map(|hit| {
                Ok(RecallResult {
                    id: id_field(hit)?.to_string(),
                    collection_id: string_field(hit, FIELD_COLLECTION_ID)?,
                    score: hit.get("distance").and_then(Value::as_f64).ok_or_else(|| {
                        Error::DataCorruption("milvus hit missing 'distance'".into())
                    })?,
                })
            })
            .collect()
    }

    async fn count(&self, expr: String) -> Result<u64> {
        self.manager
            .run(|client| async move { client.count(&self.collection, &expr).await })
            .await
    }
}

#[async_trait]
impl VectorStore for MilvusStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn init(&self) -> Result<()> {
        let auto_id = self
            .manager
            .run(|client| async move {
                client
                    .ensure_collection(&self.collection, self.dimension, true)
                    .await
            })
            .await?;
        // Later inserts follow whatever the existing collection was created with.
        let _ = self.auto_id.set(auto_id);
        info!(collection = %self.collection, auto_id, "milvus collection ready");
        Ok(())
    }

    async fn insert(&self, scope: &TenantScope, vectors: &[Vec<f32>]) -> Result<Vec<String>> {
        check_dimensions(self.dimension, vectors)?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let ids = with_retry_when(
            &RetryConfig::fixed(2, INSERT_RETRY_DELAY),
            "milvus insert",
            is_write_retryable,
            || self.insert_once(scope, vectors),
        )
        .await?;
        debug!(count = ids.len(), collection = %scope.collection_id, "milvus insert");
        Ok(ids)
    }

    async fn delete(&self, team_id: &str, selector: &DeleteSelector) -> Result<()> {
        if selector.is_noop() {
            return Ok(());
        }
        let expr = delete_filter(team_id, selector)?;
        self.manager
            .run(|client| async move { client.delete(&self.collection, &expr).await })
            .await
    }

    async fn emb_recall(&self, request: &RecallRequest) -> Result<Vec<RecallResult>> {
        let filter = CollectionFilter::resolve(
            &request.forbid_collection_ids,
            request.filter_collection_ids.as_deref(),
        );
        if filter.matches_nothing() || request.dataset_ids.is_empty() || request.limit == 0 {
            return Ok(Vec::new());
        }
        check_dimensions(self.dimension, std::slice::from_ref(&request.vector))?;

        let expr = recall_filter(&request.team_id, &request.dataset_ids, &filter);
        let results = with_retry(
            &RetryConfig::fixed(request.retry, SEARCH_RETRY_DELAY),
            "milvus emb_recall",
            || self.recall_once(request, &expr),
        )
        .await?;
        Ok(rank_results(results, request.limit))
    }

    async fn count_by_team(&self, team_id: &str) -> Result<u64> {
        self.count(format!("{FIELD_TEAM_ID} == {}", quote(team_id)))
            .await
    }

    async fn count_by_dataset(&self, team_id: &str, dataset_id: &str) -> Result<u64> {
        self.count(format!(
            "{FIELD_TEAM_ID} == {} and {FIELD_DATASET_ID} == {}",
            quote(team_id),
            quote(dataset_id)
        ))
        .await
    }

    async fn count_by_collection(
        &self,
        team_id: &str,
        dataset_id: &str,
        collection_id: &str,
    ) -> Result<u64> {
        self.count(format!(
            "{FIELD_TEAM_ID} == {} and {FIELD_DATASET_ID} == {} and {FIELD_COLLECTION_ID} == {}",
            quote(team_id),
            quote(dataset_id),
            quote(collection_id)
        ))
        .await
    }

    async fn data_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TimedVectorRef>> {
        let expr = format!(
            "{FIELD_CREATE_TIME} >= {} and {FIELD_CREATE_TIME} <= {}",
            start.timestamp_millis(),
            end.timestamp_millis()
        );
        let rows = self
            .manager
            .run(|client| async move {
                client
                    .query_all(
                        &self.collection,
                        &expr,
                        &[FIELD_ID, FIELD_TEAM_ID, FIELD_DATASET_ID],
                    )
                    .await
            })
            .await?;

        rows.iter()
            .map(|row| {
                Ok(TimedVectorRef {
                    id: id_field(row)?.to_string(),
                    team_id: string_field(row, FIELD_TEAM_ID)?,
                    dataset_id: string_field(row, FIELD_DATASET_ID)?,
                })
            })
            .collect()
    }
}
