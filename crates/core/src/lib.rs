pub mod catalog;
pub mod chunking;
pub mod clean;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod library;
pub mod models;
pub mod search;
pub mod store;
pub mod stores;
pub mod traits;

#[cfg(test)]
mod testing;

pub use chunking::{chunk_text, ChunkingConfig, TextChunk};
pub use clean::clean_text;
pub use config::{
    ChunkingSettings, DocumentsConfig, EmbeddingBackend, EmbeddingConfig, RetrievalConfig,
    Settings, VectorBackend,
};
pub use embeddings::{
    build_embedder, CharacterNgramEmbedder, EmbeddingProvider, LazyEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{ConfigError, EmbedError, IndexError, IngestError};
pub use extractor::{extract_units, Extraction, PageText, TextExtractor};
pub use ingest::{discover_documents, IngestPipeline, IngestStage, PreparedDocument};
pub use library::{sanitize_filename, Library, UploadRequest};
pub use models::{
    ChunkMetadata, ChunkRecord, Document, DocumentSummary, FileType, IngestionOptions,
    ReconcileReport, ScanReport, SearchOutcome, SearchResult, SkippedDocument,
};
pub use search::SearchService;
pub use store::{DistanceMetric, IndexEntry, IndexHit, MetadataFilter};
pub use stores::{QdrantIndex, SqliteVectorIndex};
pub use traits::VectorIndex;
