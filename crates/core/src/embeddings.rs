use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{ConfigError, EmbedError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;

/// Turns texts into fixed-dimension vectors, one per input and in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Hashed character-trigram vectors. Deterministic and offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut encoded = [0u8; 4];
                for byte in ch.encode_utf8(&mut encoded).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "char-trigram-hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

type ProviderInit = dyn Fn() -> Result<Arc<dyn EmbeddingProvider>, EmbedError> + Send + Sync;

/// Defers building the wrapped provider until the first `embed` call. The
/// constructor runs on the blocking pool at most once, even when several
/// callers race on the first use.
pub struct LazyEmbedder {
    model_name: String,
    dimensions: usize,
    init: Arc<ProviderInit>,
    cell: OnceCell<Arc<dyn EmbeddingProvider>>,
}

impl LazyEmbedder {
    pub fn new<F>(model_name: impl Into<String>, dimensions: usize, init: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn EmbeddingProvider>, EmbedError> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.into(),
            dimensions,
            init: Arc::new(init),
            cell: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    async fn provider(&self) -> Result<&Arc<dyn EmbeddingProvider>, EmbedError> {
        self.cell
            .get_or_try_init(|| async {
                let init = Arc::clone(&self.init);
                info!(model = %self.model_name, "loading embedding model");
                tokio::task::spawn_blocking(move || init()).await?
            })
            .await
    }
}

#[async_trait]
impl EmbeddingProvider for LazyEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let provider = self.provider().await?;
        let vectors = provider.embed(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            });
        }
        Ok(vectors)
    }
}

#[cfg(feature = "fastembed")]
mod local {
    use super::EmbeddingProvider;
    use crate::error::EmbedError;
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tracing::debug;

    pub(super) fn resolve_model(name: &str) -> Option<(EmbeddingModel, usize)> {
        match name.to_ascii_lowercase().as_str() {
            "all-minilm-l6-v2" | "sentence-transformers/all-minilm-l6-v2" => {
                Some((EmbeddingModel::AllMiniLML6V2, 384))
            }
            "bge-small-en-v1.5" | "baai/bge-small-en-v1.5" => {
                Some((EmbeddingModel::BGESmallENV15, 384))
            }
            "bge-base-en-v1.5" | "baai/bge-base-en-v1.5" => {
                Some((EmbeddingModel::BGEBaseENV15, 768))
            }
            "nomic-embed-text-v1.5" | "nomic-ai/nomic-embed-text-v1.5" => {
                Some((EmbeddingModel::NomicEmbedTextV15, 768))
            }
            _ => None,
        }
    }

    pub struct FastEmbedProvider {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: String,
        dimensions: usize,
        batch_size: usize,
    }

    impl FastEmbedProvider {
        /// Blocking: may download the model on first use.
        pub fn load(model_name: &str, batch_size: usize) -> Result<Self, EmbedError> {
            let (model, dimensions) =
                resolve_model(model_name).ok_or_else(|| EmbedError::ModelInit {
                    model: model_name.to_string(),
                    details: "unknown local model".to_string(),
                })?;

            let options = InitOptions::new(model).with_show_download_progress(true);
            let embedding = TextEmbedding::try_new(options).map_err(|error| EmbedError::ModelInit {
                model: model_name.to_string(),
                details: error.to_string(),
            })?;

            Ok(Self {
                model: Arc::new(Mutex::new(embedding)),
                model_name: model_name.to_string(),
                dimensions,
                batch_size,
            })
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FastEmbedProvider {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }

            debug!(count = texts.len(), "embedding batch");
            let model = Arc::clone(&self.model);
            let texts = texts.to_vec();
            let batch_size = self.batch_size;
            tokio::task::spawn_blocking(move || {
                let model = model.blocking_lock();
                model.embed(texts, Some(batch_size))
            })
            .await?
            .map_err(|error| EmbedError::Inference(error.to_string()))
        }
    }
}

#[cfg(feature = "fastembed")]
pub use local::FastEmbedProvider;

/// Builds the provider named by the configuration. Neural models are wrapped in
/// a [`LazyEmbedder`] so the weights load on the first embed call.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    match config.provider {
        EmbeddingBackend::Hashing => Ok(Arc::new(CharacterNgramEmbedder {
            dimensions: config.dimensions.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        })),
        EmbeddingBackend::Fastembed => build_fastembed(config),
    }
}

#[cfg(feature = "fastembed")]
fn build_fastembed(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    let (_, native_dimensions) = local::resolve_model(&config.model).ok_or_else(|| {
        ConfigError::Invalid(format!("unknown embedding model: {}", config.model))
    })?;

    if let Some(dimensions) = config.dimensions {
        if dimensions != native_dimensions {
            return Err(ConfigError::Invalid(format!(
                "embedding.dimensions {dimensions} does not match {} ({native_dimensions})",
                config.model
            )));
        }
    }

    let model = config.model.clone();
    let batch_size = config.batch_size;
    Ok(Arc::new(LazyEmbedder::new(
        config.model.clone(),
        native_dimensions,
        move || {
            let provider: Arc<dyn EmbeddingProvider> =
                Arc::new(FastEmbedProvider::load(&model, batch_size)?);
            Ok(provider)
        },
    )))
}

#[cfg(not(feature = "fastembed"))]
fn build_fastembed(_config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    Err(ConfigError::Invalid(
        "embedding.provider = \"fastembed\" requires building with the `fastembed` feature"
            .to_string(),
    ))
}
