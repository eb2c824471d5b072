use crate::store::{DistanceMetric, IndexEntry, IndexHit, MetadataFilter};
use crate::IndexError;
use async_trait::async_trait;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserts a batch atomically. Ids must be unique within the batch and not
    /// already present.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError>;

    /// Up to `k` nearest entries, ascending by distance.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError>;

    /// Removes every entry whose metadata matches; returns how many went.
    async fn delete(&self, filter: &MetadataFilter) -> Result<usize, IndexError>;

    /// Distinct `document_id` values present in entry metadata.
    async fn document_ids(&self) -> Result<Vec<i64>, IndexError>;

    fn metric(&self) -> DistanceMetric;
}
