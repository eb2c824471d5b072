use crate::config::RetrievalConfig;
use crate::embeddings::EmbeddingProvider;
use crate::models::{SearchOutcome, SearchResult};
use crate::store::IndexHit;
use crate::traits::VectorIndex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn hit_to_result(hit: IndexHit, relevance: f64, preview_chars: usize) -> SearchResult {
    let metadata = &hit.metadata;
    let as_u32 = |key: &str| metadata.get(key).and_then(Value::as_u64).map(|n| n as u32);
    let as_string = |key: &str| metadata.get(key).and_then(Value::as_str).map(str::to_string);

    SearchResult {
        document_id: metadata
            .get("document_id")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        document_title: as_string("document_title").unwrap_or_default(),
        content_preview: truncate_chars(&hit.text, preview_chars),
        page_number: as_u32("page_number").filter(|page| *page > 0),
        chapter: as_string("chapter"),
        section: as_string("section"),
        chunk_index: as_u32("chunk_index"),
        relevance_score: relevance,
        chunk_id: hit.id,
    }
}

pub struct SearchService {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    retrieval: RetrievalConfig,
}

impl SearchService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            retrieval,
        }
    }

    /// Nearest chunks to `query` whose relevance reaches `min_relevance`,
    /// best first. Backend failures produce an empty, degraded outcome rather
    /// than an error.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        min_relevance: Option<f64>,
    ) -> SearchOutcome {
        let query = query.trim();
        let top_k = top_k.unwrap_or(self.retrieval.top_k);
        let min_relevance = min_relevance.unwrap_or(self.retrieval.min_relevance);
        if query.is_empty() || top_k == 0 {
            return SearchOutcome::default();
        }

        let vector = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                warn!("embedder returned no vector for the query");
                return SearchOutcome::degraded("embedder returned no vector");
            }
            Err(error) => {
                warn!(%error, "query embedding failed");
                return SearchOutcome::degraded(format!("embedding failed: {error}"));
            }
        };

        let hits = match self.index.query(&vector, top_k).await {
            Ok(hits) => hits,
            Err(error) => {
                warn!(%error, "vector index query failed");
                return SearchOutcome::degraded(format!("index query failed: {error}"));
            }
        };

        let metric = self.index.metric();
        let candidates = hits.len();
        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .filter_map(|hit| {
                let relevance = metric.relevance(hit.distance);
                (relevance >= min_relevance)
                    .then(|| hit_to_result(hit, relevance, self.retrieval.preview_chars))
            })
            .collect();

        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        for result in &mut results {
            result.relevance_score = round3(result.relevance_score);
        }

        debug!(candidates, kept = results.len(), min_relevance, "search finished");
        SearchOutcome {
            results,
            degraded: None,
        }
    }
}
