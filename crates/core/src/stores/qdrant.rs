use crate::store::{DistanceMetric, IndexEntry, IndexHit, MetadataFilter};
use crate::traits::VectorIndex;
use crate::IndexError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::info;
use url::Url;
use uuid::Uuid;

const SCROLL_PAGE: usize = 256;

/// Qdrant collection over the REST API. Point ids are UUIDv5 digests of the
/// embedding id; the original id rides along in the payload.
pub struct QdrantIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantIndex {
    pub fn new(
        endpoint: &str,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Result<Self, IndexError> {
        let endpoint = Url::parse(endpoint)?;
        Ok(Self {
            endpoint: endpoint.as_str().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        })
    }

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.endpoint, self.collection, suffix)
    }

    pub async fn ensure_collection(&self) -> Result<(), IndexError> {
        let response = self.client.get(self.collection_url("")).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(backend_error(response.status()));
        }

        let response = self
            .client
            .put(self.collection_url(""))
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Euclid" },
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        info!(collection = %self.collection, size = self.vector_size, "created qdrant collection");
        Ok(())
    }
}

fn backend_error(status: StatusCode) -> IndexError {
    IndexError::BackendResponse {
        backend: "qdrant".to_string(),
        details: status.to_string(),
    }
}

pub fn point_id(embedding_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, embedding_id.as_bytes()).to_string()
}

fn point_payload(entry: &IndexEntry) -> Value {
    let mut payload = entry.metadata.clone();
    payload.insert("embedding_id".to_string(), Value::from(entry.id.clone()));
    payload.insert("text".to_string(), Value::from(entry.text.clone()));
    Value::Object(payload)
}

fn filter_body(filter: &MetadataFilter) -> Value {
    json!({
        "must": [{ "key": filter.key, "match": { "value": filter.value } }],
    })
}

fn parse_hits(parsed: &Value) -> Vec<IndexHit> {
    let hits = parsed
        .pointer("/result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut result = Vec::new();
    for hit in hits {
        let mut payload = hit
            .pointer("/payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let id = match payload.remove("embedding_id") {
            Some(Value::String(id)) => id,
            _ => continue,
        };
        let text = match payload.remove("text") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        let distance = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(f64::MAX);

        result.push(IndexHit {
            id,
            text,
            metadata: payload,
            distance,
        });
    }

    result.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
    result
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let mut seen = BTreeSet::new();
        let points = entries
            .iter()
            .map(|entry| {
                if entry.vector.len() != self.vector_size {
                    return Err(IndexError::Request(format!(
                        "embedding dimension {} != {}",
                        entry.vector.len(),
                        self.vector_size
                    )));
                }
                if !seen.insert(entry.id.as_str()) {
                    return Err(IndexError::Request(format!(
                        "duplicate id in batch: {}",
                        entry.id
                    )));
                }

                Ok(json!({
                    "id": point_id(&entry.id),
                    "vector": entry.vector,
                    "payload": point_payload(entry),
                }))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(self.collection_url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        if vector.len() != self.vector_size {
            return Err(IndexError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.collection_url("/points/search"))
            .json(&json!({
                "vector": vector,
                "limit": k,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        let parsed: Value = response.json().await?;
        Ok(parse_hits(&parsed))
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<usize, IndexError> {
        let response = self
            .client
            .post(self.collection_url("/points/count"))
            .json(&json!({ "filter": filter_body(filter), "exact": true }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }
        let parsed: Value = response.json().await?;
        let count = parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if count == 0 {
            return Ok(0);
        }

        let response = self
            .client
            .post(self.collection_url("/points/delete?wait=true"))
            .json(&json!({ "filter": filter_body(filter) }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backend_error(response.status()));
        }

        Ok(count)
    }

    async fn document_ids(&self) -> Result<Vec<i64>, IndexError> {
        let mut ids = BTreeSet::new();
        let mut offset = Value::Null;

        loop {
            let mut body = Map::new();
            body.insert("limit".to_string(), json!(SCROLL_PAGE));
            body.insert("with_payload".to_string(), json!(["document_id"]));
            body.insert("with_vector".to_string(), json!(false));
            if !offset.is_null() {
                body.insert("offset".to_string(), offset.clone());
            }

            let response = self
                .client
                .post(self.collection_url("/points/scroll"))
                .json(&Value::Object(body))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(backend_error(response.status()));
            }

            let parsed: Value = response.json().await?;
            if let Some(points) = parsed.pointer("/result/points").and_then(Value::as_array) {
                ids.extend(
                    points
                        .iter()
                        .filter_map(|point| point.pointer("/payload/document_id"))
                        .filter_map(Value::as_i64),
                );
            }

            offset = parsed
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        Ok(ids.into_iter().collect())
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::Euclidean
    }
}
