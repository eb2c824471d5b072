use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chunk vector as handed to a [`crate::traits::VectorIndex`].
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
    pub distance: f64,
}

/// Equality match on a single metadata key.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    pub key: String,
    pub value: Value,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn document(document_id: i64) -> Self {
        Self::new("document_id", document_id)
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match (metadata.get(&self.key), &self.value) {
            (Some(Value::Number(stored)), Value::Number(wanted)) => {
                stored == wanted || stored.as_f64() == wanted.as_f64()
            }
            (Some(stored), wanted) => stored == wanted,
            (None, _) => false,
        }
    }
}

/// How a backend measures distance, and so how that distance maps onto a
/// relevance score in `[0, 1]`. For unit-length vectors every mapping below
/// reduces to the cosine similarity clamped at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance, range `[0, 4]` on unit vectors.
    SquaredL2,
    /// Euclidean distance, range `[0, 2]` on unit vectors.
    Euclidean,
    /// `1 - cos`, range `[0, 2]`.
    Cosine,
}

impl DistanceMetric {
    pub fn relevance(self, distance: f64) -> f64 {
        let relevance = match self {
            DistanceMetric::SquaredL2 => 1.0 - distance / 2.0,
            DistanceMetric::Euclidean => 1.0 - distance * distance / 2.0,
            DistanceMetric::Cosine => 1.0 - distance,
        };
        if relevance.is_nan() {
            return 0.0;
        }
        relevance.clamp(0.0, 1.0)
    }
}

pub(crate) fn squared_l2(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = f64::from(*a) - f64::from(*b);
            delta * delta
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::{squared_l2, DistanceMetric, MetadataFilter};
    use serde_json::{json, Map, Value};

    #[test]
    fn squared_l2_relevance_uses_half_distance() {
        let metric = DistanceMetric::SquaredL2;
        assert_eq!(metric.relevance(0.0), 1.0);
        assert!((metric.relevance(1.3) - 0.35).abs() < 1e-9);
        assert_eq!(metric.relevance(2.0), 0.0);
        assert_eq!(metric.relevance(3.5), 0.0);
    }

    #[test]
    fn metrics_agree_on_unit_vectors() {
        let a = [0.6f32, 0.8];
        let b = [1.0f32, 0.0];
        let squared = squared_l2(&a, &b);
        let cosine = 0.6;

        let from_squared = DistanceMetric::SquaredL2.relevance(squared);
        let from_euclid = DistanceMetric::Euclidean.relevance(squared.sqrt());
        let from_cosine = DistanceMetric::Cosine.relevance(1.0 - cosine);
        assert!((from_squared - cosine).abs() < 1e-6);
        assert!((from_euclid - cosine).abs() < 1e-6);
        assert!((from_cosine - cosine).abs() < 1e-6);
    }

    #[test]
    fn nan_distance_is_irrelevant() {
        assert_eq!(DistanceMetric::Cosine.relevance(f64::NAN), 0.0);
    }

    #[test]
    fn filter_matches_numbers_across_representations() {
        let mut metadata = Map::new();
        metadata.insert("document_id".to_string(), json!(7));
        metadata.insert("file_type".to_string(), Value::from("pdf"));

        assert!(MetadataFilter::document(7).matches(&metadata));
        assert!(MetadataFilter::new("document_id", 7.0).matches(&metadata));
        assert!(!MetadataFilter::document(8).matches(&metadata));
        assert!(MetadataFilter::new("file_type", "pdf").matches(&metadata));
        assert!(!MetadataFilter::new("chapter", "1").matches(&metadata));
    }
}
