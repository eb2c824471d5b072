use crate::chunking::ChunkingConfig;
use crate::error::ConfigError;
use crate::models::IngestionOptions;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/tutor.sqlite")
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Sqlite,
    Qdrant,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: VectorBackend,
    #[serde(default = "default_vector_path")]
    pub path: PathBuf,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_vector_path(),
            url: default_qdrant_url(),
            collection: default_collection(),
        }
    }
}

fn default_backend() -> VectorBackend {
    VectorBackend::Sqlite
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("data/vectors.sqlite")
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "document_chunks".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Hashing,
    Fastembed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingBackend,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dimensions: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_provider() -> EmbeddingBackend {
    EmbeddingBackend::Hashing
}
fn default_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_batch_size() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            min_chars: default_min_chars(),
        }
    }
}

impl ChunkingSettings {
    pub fn ingestion_options(&self) -> IngestionOptions {
        IngestionOptions {
            chunk_size: self.chunk_size,
            chunk_overlap: self.overlap,
            min_chars: self.min_chars,
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}
fn default_min_chars() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            preview_chars: default_preview_chars(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_min_relevance() -> f64 {
    0.35
}
fn default_preview_chars() -> usize {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentsConfig {
    #[serde(default = "default_folder")]
    pub folder: PathBuf,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_upload_size_mb")]
    pub max_upload_size_mb: u64,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            folder: default_folder(),
            upload_dir: default_upload_dir(),
            allowed_extensions: default_allowed_extensions(),
            max_upload_size_mb: default_max_upload_size_mb(),
        }
    }
}

impl DocumentsConfig {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn allows(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

fn default_folder() -> PathBuf {
    PathBuf::from("documents")
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_allowed_extensions() -> Vec<String> {
    vec!["pdf".to_string(), "txt".to_string(), "epub".to_string()]
}
fn default_max_upload_size_mb() -> u64 {
    50
}

impl Settings {
    /// Reads `path` when given. A missing file, like no path at all, yields the
    /// defaults. Always validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(raw) => Self::from_toml(&raw)?,
                Err(source) if source.kind() == ErrorKind::NotFound => {
                    warn!(path = %path.display(), "config file not found, using defaults");
                    Self::default()
                }
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            },
            None => Self::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ChunkingConfig::new(self.chunking.chunk_size, self.chunking.overlap)
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.min_relevance) {
            return Err(ConfigError::Invalid(format!(
                "retrieval.min_relevance must be within [0, 1], got {}",
                self.retrieval.min_relevance
            )));
        }

        if self.documents.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "documents.allowed_extensions must not be empty".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding.batch_size must be at least 1".to_string(),
            ));
        }

        if self.embedding.dimensions == Some(0) {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
