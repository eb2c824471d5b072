use crate::catalog;
use crate::chunking::{chunk_text, ChunkingConfig};
use crate::clean::clean_text;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EmbedError, IndexError, IngestError};
use crate::extractor::{extract_units, Extraction};
use crate::models::{
    ChunkMetadata, Document, FileType, IngestionOptions, NewChunk, NewDocument, ReconcileReport,
    ScanReport, SkippedDocument,
};
use crate::store::{IndexEntry, MetadataFilter};
use crate::traits::VectorIndex;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Extracted,
    Chunked,
    Embedded,
    Indexed,
    Committed,
    Failed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Received => "received",
            IngestStage::Extracted => "extracted",
            IngestStage::Chunked => "chunked",
            IngestStage::Embedded => "embedded",
            IngestStage::Indexed => "indexed",
            IngestStage::Committed => "committed",
            IngestStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Output of [`IngestPipeline::prepare`]: one vector per chunk, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDocument {
    pub file_type: FileType,
    pub total_units: Option<u32>,
    pub chunks: Vec<PreparedChunk>,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChunk {
    pub ordinal: u32,
    pub content: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
}

/// Cleans and chunks every unit, dropping units shorter than `min_chars` and
/// chunks not longer than it. Ordinals run across the whole document.
pub fn prepare_chunks(
    extraction: &Extraction,
    file_type: FileType,
    chunking: ChunkingConfig,
    min_chars: usize,
) -> Vec<PreparedChunk> {
    let mut prepared = Vec::new();

    for unit in &extraction.units {
        let cleaned = clean_text(&unit.text);
        if cleaned.chars().count() < min_chars {
            continue;
        }

        let chapter = match (file_type, unit.label) {
            (FileType::Epub, Some(number)) => Some(format!("Chapter {number}")),
            _ => None,
        };

        for chunk in chunk_text(&cleaned, chunking) {
            let content = clean_text(&chunk.content);
            if content.chars().count() <= min_chars {
                continue;
            }
            prepared.push(PreparedChunk {
                ordinal: prepared.len() as u32,
                content,
                page_number: unit.label,
                chapter: chapter.clone(),
            });
        }
    }

    prepared
}

pub fn embedding_id(document_id: i64, ordinal: u32) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("doc_{document_id}_chunk_{ordinal}_{}", &suffix[..8])
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the file at `path`, read and hashed on the blocking pool.
pub async fn digest_file(path: &Path) -> Result<String, IngestError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String, IngestError> {
        let bytes = fs::read(&path)?;
        Ok(digest_bytes(&bytes))
    })
    .await?
}

/// Regular, non-hidden files directly inside `folder` whose extension is in
/// `allowed`, sorted by name. Creates `folder` when missing.
pub fn discover_documents(folder: &Path, allowed: &[String]) -> Result<Vec<PathBuf>, IngestError> {
    fs::create_dir_all(folder)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|error| IngestError::InvalidArgument(error.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let is_allowed = FileType::extension_of(name).is_some_and(|extension| {
            allowed
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        });

        if is_allowed {
            files.push(entry.path().to_path_buf());
        }
    }

    Ok(files)
}

enum ScanOutcome {
    Existing,
    Ingested { document_id: i64, chunk_count: usize },
}

#[derive(Clone)]
pub struct IngestPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    options: IngestionOptions,
    chunking: ChunkingConfig,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        options: IngestionOptions,
    ) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::try_from(&options)?;
        Ok(Self {
            embedder,
            index,
            options,
            chunking,
        })
    }

    /// Extracts, chunks and embeds the file at `path`. Touches neither the
    /// catalog nor the index.
    pub async fn prepare(
        &self,
        path: &Path,
        file_type: FileType,
    ) -> Result<PreparedDocument, IngestError> {
        debug!(stage = %IngestStage::Received, path = %path.display());

        let extraction = extract_units(path, file_type).await?;
        debug!(stage = %IngestStage::Extracted, path = %path.display(), units = extraction.units.len());

        let chunks = prepare_chunks(&extraction, file_type, self.chunking, self.options.min_chars);
        debug!(stage = %IngestStage::Chunked, path = %path.display(), chunks = chunks.len());

        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(EmbedError::CountMismatch {
                    expected: texts.len(),
                    actual: vectors.len(),
                }
                .into());
            }
            debug!(stage = %IngestStage::Embedded, path = %path.display(), model = self.embedder.model_name());
            vectors
        };

        Ok(PreparedDocument {
            file_type,
            total_units: extraction.total_units,
            chunks,
            vectors,
        })
    }

    /// Writes prepared chunks for `document_id` through `conn`, so they commit
    /// or roll back with the caller's transaction, and upserts them into the
    /// index last.
    pub async fn write(
        &self,
        conn: &mut SqliteConnection,
        document_id: i64,
        prepared: PreparedDocument,
    ) -> Result<usize, IngestError> {
        let document = catalog::get_document(conn, document_id)
            .await?
            .ok_or(IngestError::DocumentNotFound(document_id))?;
        catalog::set_total_units(conn, document_id, prepared.total_units).await?;
        if prepared.chunks.is_empty() {
            return Ok(0);
        }

        let title = document.display_title().to_string();
        let file_type = prepared.file_type;
        let mut entries = Vec::with_capacity(prepared.chunks.len());
        for (chunk, vector) in prepared.chunks.into_iter().zip(prepared.vectors) {
            let id = embedding_id(document_id, chunk.ordinal);
            catalog::insert_chunk(
                conn,
                &NewChunk {
                    document_id,
                    chunk_index: chunk.ordinal,
                    content: chunk.content.clone(),
                    page_number: chunk.page_number,
                    chapter: chunk.chapter.clone(),
                    section: None,
                    embedding_id: id.clone(),
                },
            )
            .await?;

            let metadata = ChunkMetadata {
                document_id,
                document_title: title.clone(),
                chunk_index: chunk.ordinal,
                page_number: chunk.page_number.unwrap_or(0),
                file_type: file_type.to_string(),
                chapter: chunk.chapter,
            };
            entries.push(IndexEntry {
                id,
                vector,
                text: chunk.content,
                metadata: metadata.into_map(),
            });
        }

        let count = entries.len();
        self.index.upsert(entries).await?;
        debug!(document_id, stage = %IngestStage::Indexed, chunks = count);

        Ok(count)
    }

    /// Prepares then writes one already-catalogued document.
    pub async fn ingest(
        &self,
        conn: &mut SqliteConnection,
        document_id: i64,
        path: &Path,
        file_type: FileType,
    ) -> Result<usize, IngestError> {
        let prepared = self.prepare(path, file_type).await?;
        self.write(conn, document_id, prepared).await
    }

    /// Index half of a document deletion.
    pub async fn delete_embeddings(&self, document_id: i64) -> Result<usize, IndexError> {
        self.index.delete(&MetadataFilter::document(document_id)).await
    }

    /// Drops index entries whose `document_id` is not in `known`.
    pub async fn remove_orphans(&self, known: &HashSet<i64>) -> Result<ReconcileReport, IndexError> {
        let mut report = ReconcileReport::default();
        for document_id in self.index.document_ids().await? {
            if known.contains(&document_id) {
                continue;
            }
            let removed = self.delete_embeddings(document_id).await?;
            info!(document_id, removed, "removed orphaned index entries");
            report.orphaned_documents.push(document_id);
            report.removed_entries += removed;
        }
        Ok(report)
    }

    /// Prepares the file, then inserts `new`, writes its chunks and commits in
    /// one short transaction. Extraction and embedding run before the
    /// transaction opens, so a slow model never holds the catalog write lock.
    /// On failure index entries already written for the document are removed
    /// before the rollback, while the document id is still reserved.
    pub async fn ingest_new_document(
        &self,
        pool: &SqlitePool,
        new: &NewDocument,
        path: &Path,
    ) -> Result<(Document, usize), IngestError> {
        let prepared = self.prepare(path, new.file_type).await?;

        let mut tx = pool.begin().await?;
        let document = catalog::insert_document(&mut tx, new).await?;

        let chunk_count = match self.write(&mut tx, document.id, prepared).await {
            Ok(count) => count,
            Err(error) => {
                debug!(document_id = document.id, stage = %IngestStage::Failed, %error);
                self.discard_embeddings(document.id).await;
                if let Err(rollback) = tx.rollback().await {
                    warn!(document_id = document.id, error = %rollback, "rollback failed");
                }
                return Err(error);
            }
        };

        if let Err(error) = tx.commit().await {
            self.discard_embeddings(document.id).await;
            return Err(error.into());
        }
        debug!(document_id = document.id, stage = %IngestStage::Committed);

        let mut conn = pool.acquire().await?;
        let document = catalog::get_document(&mut conn, document.id)
            .await?
            .unwrap_or(document);
        Ok((document, chunk_count))
    }

    async fn discard_embeddings(&self, document_id: i64) {
        if let Err(error) = self.delete_embeddings(document_id).await {
            warn!(document_id, %error, "failed to discard index entries of a failed ingest");
        }
    }

    /// Ingests every new file of `folder`. Files whose name is already known are
    /// counted as existing; failures are recorded per file and never abort the
    /// scan.
    pub async fn scan_folder(
        &self,
        pool: &SqlitePool,
        folder: &Path,
        allowed: &[String],
    ) -> ScanReport {
        let mut report = ScanReport::default();

        let listing = {
            let folder = folder.to_path_buf();
            let allowed = allowed.to_vec();
            tokio::task::spawn_blocking(move || discover_documents(&folder, &allowed)).await
        };
        let files = match listing.map_err(IngestError::from).and_then(|files| files) {
            Ok(files) => files,
            Err(error) => {
                warn!(folder = %folder.display(), %error, "unable to list documents folder");
                report.errors.push(SkippedDocument {
                    filename: folder.display().to_string(),
                    reason: error.to_string(),
                });
                return report;
            }
        };

        for path in files {
            let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let filename = filename.to_string();

            match self.scan_one(pool, &path, &filename).await {
                Ok(ScanOutcome::Existing) => report.existing_count += 1,
                Ok(ScanOutcome::Ingested {
                    document_id,
                    chunk_count,
                }) => {
                    info!(filename = %filename, document_id, chunk_count, "ingested document");
                    report.new_count += 1;
                }
                Err(error) => {
                    warn!(filename = %filename, %error, "skipped document");
                    report.errors.push(SkippedDocument {
                        reason: format!("Error processing {filename}: {error}"),
                        filename,
                    });
                }
            }
        }

        info!(
            folder = %folder.display(),
            new = report.new_count,
            existing = report.existing_count,
            failed = report.errors.len(),
            "documents folder scanned"
        );
        report
    }

    async fn scan_one(
        &self,
        pool: &SqlitePool,
        path: &Path,
        filename: &str,
    ) -> Result<ScanOutcome, IngestError> {
        {
            let mut conn = pool.acquire().await?;
            if catalog::find_by_filename(&mut conn, filename).await?.is_some() {
                return Ok(ScanOutcome::Existing);
            }
        }

        let file_type = FileType::from_filename(filename)?;
        let title = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(filename);
        let new = NewDocument {
            filename: filename.to_string(),
            title: Some(title.to_string()),
            author: None,
            file_type,
            file_path: path.display().to_string(),
            checksum: Some(digest_file(path).await?),
        };

        let (document, chunk_count) = self.ingest_new_document(pool, &new, path).await?;
        Ok(ScanOutcome::Ingested {
            document_id: document.id,
            chunk_count,
        })
    }
}
