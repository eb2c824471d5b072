use crate::catalog;
use crate::config::{DocumentsConfig, Settings, VectorBackend};
use crate::embeddings::{build_embedder, EmbeddingProvider};
use crate::error::IngestError;
use crate::ingest::{digest_bytes, IngestPipeline};
use crate::models::{DocumentSummary, FileType, NewDocument, ReconcileReport, ScanReport, SearchOutcome};
use crate::search::SearchService;
use crate::stores::{QdrantIndex, SqliteVectorIndex};
use crate::traits::VectorIndex;
use regex::Regex;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};
use uuid::Uuid;

static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-.]").expect("static filename pattern"));

/// Basename of `filename` with anything outside `[\w.-]` replaced by `_` and
/// leading dots removed.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let replaced = UNSAFE_FILENAME_CHARS.replace_all(base, "_");
    let trimmed = replaced.trim_start_matches('.');

    if trimmed.is_empty() {
        "unnamed_file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Documents, their chunks and the vector index behind one handle.
pub struct Library {
    pool: SqlitePool,
    pipeline: IngestPipeline,
    search: SearchService,
    documents: DocumentsConfig,
}

impl Library {
    /// Connects the catalog and the configured vector index and builds the
    /// embedder. The embedding model itself loads on first use.
    pub async fn open(settings: &Settings) -> Result<Self, IngestError> {
        let pool = catalog::connect(&settings.database.path).await?;
        catalog::migrate(&pool).await?;

        let embedder = build_embedder(&settings.embedding)?;
        let index: Arc<dyn VectorIndex> = match settings.vector_store.backend {
            VectorBackend::Sqlite => {
                Arc::new(SqliteVectorIndex::open(&settings.vector_store.path).await?)
            }
            VectorBackend::Qdrant => {
                let index = QdrantIndex::new(
                    &settings.vector_store.url,
                    settings.vector_store.collection.clone(),
                    embedder.dimensions(),
                )?;
                if let Err(error) = index.ensure_collection().await {
                    warn!(url = %settings.vector_store.url, %error, "qdrant collection not ready");
                }
                Arc::new(index)
            }
        };

        info!(
            database = %settings.database.path.display(),
            backend = ?settings.vector_store.backend,
            model = embedder.model_name(),
            "library opened"
        );
        Self::new(pool, embedder, index, settings)
    }

    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        settings: &Settings,
    ) -> Result<Self, IngestError> {
        let pipeline = IngestPipeline::new(
            embedder.clone(),
            index.clone(),
            settings.chunking.ingestion_options(),
        )?;
        let search = SearchService::new(embedder, index, settings.retrieval.clone());

        Ok(Self {
            pool,
            pipeline,
            search,
            documents: settings.documents.clone(),
        })
    }

    pub async fn scan_documents_folder(&self) -> ScanReport {
        self.pipeline
            .scan_folder(
                &self.pool,
                &self.documents.folder,
                &self.documents.allowed_extensions,
            )
            .await
    }

    /// Stores the file under the upload directory and ingests it. Nothing is
    /// kept when any step fails.
    pub async fn upload(&self, request: UploadRequest) -> Result<DocumentSummary, IngestError> {
        let extension = FileType::extension_of(&request.filename)
            .filter(|extension| self.documents.allows(extension))
            .ok_or_else(|| IngestError::UnsupportedFileType(request.filename.clone()))?;
        let file_type: FileType = extension.parse()?;

        let size = request.bytes.len() as u64;
        let limit = self.documents.max_upload_bytes();
        if size > limit {
            return Err(IngestError::TooLarge { size, limit });
        }

        let stored_name = format!("{}_{}", Uuid::new_v4(), sanitize_filename(&request.filename));
        tokio::fs::create_dir_all(&self.documents.upload_dir).await?;
        let stored_path = self.documents.upload_dir.join(stored_name);
        tokio::fs::write(&stored_path, &request.bytes).await?;

        let title = request
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| request.filename.clone());
        let new = NewDocument {
            filename: request.filename,
            title: Some(title),
            author: request.author,
            file_type,
            file_path: stored_path.display().to_string(),
            checksum: Some(digest_bytes(&request.bytes)),
        };

        match self.pipeline.ingest_new_document(&self.pool, &new, &stored_path).await {
            Ok((document, chunk_count)) => {
                info!(document_id = document.id, filename = %new.filename, chunk_count, "uploaded document");
                Ok(DocumentSummary {
                    document,
                    chunk_count: chunk_count as i64,
                })
            }
            Err(error) => {
                if let Err(remove) = tokio::fs::remove_file(&stored_path).await {
                    warn!(path = %stored_path.display(), error = %remove, "failed to remove rejected upload");
                }
                Err(error)
            }
        }
    }

    /// Deletes the document row with its chunks, then the index entries, then
    /// the stored file. Nothing outside the catalog is touched unless the row
    /// delete commits. Index and file failures after that are logged only;
    /// [`Library::reconcile_index`] cleans up index entries left behind.
    pub async fn delete_document(&self, id: i64) -> Result<(), IngestError> {
        let document = {
            let mut conn = self.pool.acquire().await?;
            catalog::get_document(&mut conn, id)
                .await?
                .ok_or(IngestError::DocumentNotFound(id))?
        };

        let mut tx = self.pool.begin().await?;
        if !catalog::delete_document(&mut tx, id).await? {
            return Err(IngestError::DocumentNotFound(id));
        }
        tx.commit().await?;

        if let Err(error) = self.pipeline.delete_embeddings(id).await {
            warn!(document_id = id, %error, "index entries left behind");
        }

        match tokio::fs::remove_file(&document.file_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(document_id = id, path = %document.file_path, %error, "stored file left behind")
            }
        }

        info!(document_id = id, filename = %document.filename, "deleted document");
        Ok(())
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>, IngestError> {
        let mut conn = self.pool.acquire().await?;
        Ok(catalog::list_documents(&mut conn).await?)
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentSummary>, IngestError> {
        let mut conn = self.pool.acquire().await?;
        let Some(document) = catalog::get_document(&mut conn, id).await? else {
            return Ok(None);
        };
        let chunk_count = catalog::count_chunks(&mut conn, id).await?;
        Ok(Some(DocumentSummary {
            document,
            chunk_count,
        }))
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        min_relevance: Option<f64>,
    ) -> SearchOutcome {
        self.search.search(query, top_k, min_relevance).await
    }

    /// Removes index entries that belong to no catalogued document.
    pub async fn reconcile_index(&self) -> Result<ReconcileReport, IngestError> {
        let known: HashSet<i64> = {
            let mut conn = self.pool.acquire().await?;
            catalog::document_ids(&mut conn).await?.into_iter().collect()
        };
        Ok(self.pipeline.remove_orphans(&known).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::{sanitize_filename, Library, UploadRequest};
    use crate::catalog;
    use crate::config::Settings;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingProvider};
    use crate::error::{EmbedError, IndexError};
    use crate::store::{DistanceMetric, IndexEntry, IndexHit, MetadataFilter};
    use crate::stores::SqliteVectorIndex;
    use crate::testing::{write_pdf, Fixture};
    use crate::traits::VectorIndex;
    use crate::IngestError;
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    /// Delegates to a real index but can be told to fail deletions.
    struct FlakyIndex {
        inner: Arc<SqliteVectorIndex>,
        fail_deletes: AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), IndexError> {
            self.inner.upsert(entries).await
        }

        async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>, IndexError> {
            self.inner.query(vector, k).await
        }

        async fn delete(&self, filter: &MetadataFilter) -> Result<usize, IndexError> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(IndexError::Request("index unreachable".to_string()));
            }
            self.inner.delete(filter).await
        }

        async fn document_ids(&self) -> Result<Vec<i64>, IndexError> {
            self.inner.document_ids().await
        }

        fn metric(&self) -> DistanceMetric {
            self.inner.metric()
        }
    }

    struct Harness {
        fixture: Fixture,
        index: Arc<FlakyIndex>,
        library: Library,
    }

    /// Holds every embed call until two callers are inside it.
    struct GatedEmbedder {
        inner: CharacterNgramEmbedder,
        gate: Barrier,
    }

    #[async_trait]
    impl EmbeddingProvider for GatedEmbedder {
        fn model_name(&self) -> &str {
            "gated-trigram"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            self.gate.wait().await;
            self.inner.embed(texts).await
        }
    }

    fn settings_for(fixture: &Fixture, max_upload_size_mb: u64) -> Settings {
        let mut settings = Settings::default();
        settings.documents.folder = fixture.dir.path().join("documents");
        settings.documents.upload_dir = fixture.dir.path().join("uploads");
        settings.documents.max_upload_size_mb = max_upload_size_mb;
        settings
    }

    async fn harness(max_upload_size_mb: u64) -> Result<Harness, Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        let settings = settings_for(&fixture, max_upload_size_mb);

        let index = Arc::new(FlakyIndex {
            inner: fixture.index.clone(),
            fail_deletes: AtomicBool::new(false),
        });
        let library = Library::new(
            fixture.pool.clone(),
            Arc::new(fixture.embedder),
            index.clone(),
            &settings,
        )?;

        Ok(Harness {
            fixture,
            index,
            library,
        })
    }

    fn upload(filename: &str, bytes: &[u8]) -> UploadRequest {
        UploadRequest {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            title: None,
            author: Some("Dr. Rivera".to_string()),
        }
    }

    fn uploaded_files(harness: &Harness) -> Result<Vec<String>, std::io::Error> {
        let dir = harness.fixture.dir.path().join("uploads");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        fs::read_dir(dir)?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my notes (v2).pdf"), "my_notes__v2_.pdf");
        assert_eq!(sanitize_filename("..hidden.txt"), "hidden.txt");
        assert_eq!(sanitize_filename("..."), "unnamed_file");
        assert_eq!(sanitize_filename("C:\\docs\\biología.txt"), "biología.txt");
    }

    #[tokio::test]
    async fn upload_stores_and_ingests() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let summary = harness
            .library
            .upload(upload(
                "cell notes.txt",
                b"The nucleus stores genetic information in chromosomes.",
            ))
            .await?;

        assert_eq!(summary.chunk_count, 1);
        assert_eq!(summary.document.filename, "cell notes.txt");
        assert_eq!(summary.document.title.as_deref(), Some("cell notes.txt"));
        assert_eq!(summary.document.author.as_deref(), Some("Dr. Rivera"));
        assert!(summary.document.checksum.is_some());

        let stored = uploaded_files(&harness)?;
        assert_eq!(stored.len(), 1);
        assert!(stored[0].ends_with("_cell_notes.txt"));

        let fetched = harness.library.get_document(summary.document.id).await?;
        assert_eq!(fetched.map(|summary| summary.chunk_count), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn upload_rejects_unlisted_extensions() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let result = harness.library.upload(upload("slides.pptx", b"pptx")).await;
        assert!(matches!(result, Err(IngestError::UnsupportedFileType(_))));
        assert!(uploaded_files(&harness)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn upload_rejects_oversized_files() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(0).await?;
        let result = harness.library.upload(upload("notes.txt", b"some text here")).await;
        assert!(matches!(result, Err(IngestError::TooLarge { size: 14, limit: 0 })));
        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let result = harness
            .library
            .upload(upload("broken.pdf", b"%PDF-1.4\n%broken"))
            .await;

        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        assert!(uploaded_files(&harness)?.is_empty());
        assert!(harness.library.list_documents().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_survives_index_failure_and_reconcile_repairs(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let folder = harness.fixture.dir.path().join("documents");
        fs::create_dir_all(&folder)?;
        write_pdf(
            &folder.join("genetics.pdf"),
            &["Alleles are variants of a gene", "Dominant alleles mask recessive ones"],
        )?;

        let report = harness.library.scan_documents_folder().await;
        assert_eq!(report.new_count, 1);
        let document_id = harness.library.list_documents().await?[0].document.id;

        harness.index.fail_deletes.store(true, Ordering::SeqCst);
        harness.library.delete_document(document_id).await?;

        let mut conn = harness.fixture.pool.acquire().await?;
        assert_eq!(catalog::count_chunks(&mut conn, document_id).await?, 0);
        assert!(harness.library.get_document(document_id).await?.is_none());
        assert!(!folder.join("genetics.pdf").exists());
        assert_eq!(harness.index.document_ids().await?, vec![document_id]);

        harness.index.fail_deletes.store(false, Ordering::SeqCst);
        let reconciled = harness.library.reconcile_index().await?;
        assert_eq!(reconciled.orphaned_documents, vec![document_id]);
        assert_eq!(reconciled.removed_entries, 2);
        assert!(harness.fixture.index.is_empty().await?);
        Ok(())
    }

    #[tokio::test]
    async fn uploads_overlap_while_embedding() -> Result<(), Box<dyn std::error::Error>> {
        let fixture = Fixture::new().await?;
        let settings = settings_for(&fixture, 50);
        let embedder = Arc::new(GatedEmbedder {
            inner: CharacterNgramEmbedder::default(),
            gate: Barrier::new(2),
        });
        let library = Library::new(fixture.pool.clone(), embedder, fixture.index.clone(), &settings)?;

        let (first, second) = tokio::join!(
            library.upload(upload(
                "osmosis.txt",
                b"Osmosis moves water across a semipermeable membrane.",
            )),
            library.upload(upload(
                "diffusion.txt",
                b"Diffusion spreads solutes from high to low concentration.",
            )),
        );
        let (first, second) = (first?, second?);

        assert_ne!(first.document.id, second.document.id);
        assert_eq!((first.chunk_count, second.chunk_count), (1, 1));
        assert_eq!(library.list_documents().await?.len(), 2);
        assert_eq!(fixture.index.len().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_row_delete_keeps_file_and_index_entries() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let summary = harness
            .library
            .upload(upload(
                "ecology.txt",
                b"Producers convert sunlight into biomass for the food web.",
            ))
            .await?;
        let document_id = summary.document.id;

        sqlx::query(
            "CREATE TRIGGER keep_documents BEFORE DELETE ON documents
             BEGIN SELECT RAISE(ABORT, 'documents are read-only'); END",
        )
        .execute(&harness.fixture.pool)
        .await?;

        let result = harness.library.delete_document(document_id).await;
        assert!(matches!(result, Err(IngestError::Database(_))));
        assert!(Path::new(&summary.document.file_path).exists());
        assert_eq!(harness.index.document_ids().await?, vec![document_id]);
        let kept = harness.library.get_document(document_id).await?;
        assert_eq!(kept.map(|summary| summary.chunk_count), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn deleting_unknown_document_fails() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let result = harness.library.delete_document(404).await;
        assert!(matches!(result, Err(IngestError::DocumentNotFound(404))));
        Ok(())
    }

    #[tokio::test]
    async fn uploaded_content_is_searchable() -> Result<(), Box<dyn std::error::Error>> {
        let harness = harness(50).await?;
        let text = "Natural selection acts on heritable variation within populations.";
        harness.library.upload(upload("evolution.txt", text.as_bytes())).await?;

        let outcome = harness.library.search(text, None, None).await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].document_title, "evolution.txt");
        Ok(())
    }
}
