use crate::catalog;
use crate::store::{squared_l2, DistanceMetric, IndexEntry, IndexHit, MetadataFilter};
use crate::traits::VectorIndex;
use crate::IndexError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS vector_entries (
    id TEXT PRIMARY KEY,
    dims INTEGER NOT NULL,
    vector BLOB NOT NULL,
    text TEXT NOT NULL,
    metadata TEXT NOT NULL
)";

/// Embedded vector index in its own SQLite file. Queries scan every row and
/// rank by squared Euclidean distance.
#[derive(Clone)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        let pool = catalog::connect(path).await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self, IndexError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn len(&self) -> Result<usize, IndexError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let dims = first.vector.len();
        if dims == 0 {
            return Err(IndexError::Request("vectors must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(IndexError::Request(format!(
                    "duplicate id in batch: {}",
                    entry.id
                )));
            }
            if entry.vector.len() != dims {
                return Err(IndexError::Request(format!(
                    "embedding dimension {} != {}",
                    entry.vector.len(),
                    dims
                )));
            }
        }

        let stored: Option<i64> = sqlx::query_scalar("SELECT dims FROM vector_entries LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        if let Some(stored) = stored {
            if stored as usize != dims {
                return Err(IndexError::Request(format!(
                    "index holds {stored}-dimensional vectors, got {dims}"
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        for entry in &entries {
            sqlx::query(
                "INSERT INTO vector_entries (id, dims, vector, text, metadata) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&entry.id)
            .bind(dims as i64)
            .bind(vec_to_blob(&entry.vector))
            .bind(&entry.text)
            .bind(serde_json::to_string(&entry.metadata)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<(String, Vec<u8>, String, String)> =
            sqlx::query_as("SELECT id, vector, text, metadata FROM vector_entries")
                .fetch_all(&self.pool)
                .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for (id, blob, text, metadata) in rows {
            let stored = blob_to_vec(&blob);
            if stored.len() != vector.len() {
                return Err(IndexError::Request(format!(
                    "query vector dim {} is not {}",
                    vector.len(),
                    stored.len()
                )));
            }
            hits.push(IndexHit {
                distance: squared_l2(vector, &stored),
                id,
                text,
                metadata: serde_json::from_str::<Map<String, Value>>(&metadata)?,
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<usize, IndexError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, metadata FROM vector_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut doomed = Vec::new();
        for (id, metadata) in rows {
            let metadata: Map<String, Value> = serde_json::from_str(&metadata)?;
            if filter.matches(&metadata) {
                doomed.push(id);
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &doomed {
            sqlx::query("DELETE FROM vector_entries WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(doomed.len())
    }

    async fn document_ids(&self) -> Result<Vec<i64>, IndexError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT CAST(json_extract(metadata, '$.document_id') AS INTEGER)
             FROM vector_entries
             WHERE json_extract(metadata, '$.document_id') IS NOT NULL
             ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    fn metric(&self) -> DistanceMetric {
        DistanceMetric::SquaredL2
    }
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}
