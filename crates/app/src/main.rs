use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tutor_rag_core::{Library, Settings, UploadRequest};

#[derive(Parser)]
#[command(name = "tutor-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. Defaults apply when it is absent.
    #[arg(long, env = "TUTOR_RAG_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create the catalog, the vector index and the document folders.
    Init,
    /// Ingest every new file in the documents folder.
    Scan,
    /// Store a file in the upload directory and ingest it.
    Upload {
        path: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    /// List catalogued documents, newest first.
    List,
    /// Remove a document, its chunks, its index entries and its file.
    Delete { id: i64 },
    /// Retrieve the chunks most relevant to a question.
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_relevance: Option<f64>,
        /// Print the outcome as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Drop index entries that belong to no catalogued document.
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "tutor-rag boot"
    );

    let library = Library::open(&settings)
        .await
        .context("failed to open document library")?;

    match cli.command {
        Command::Init => {
            tokio::fs::create_dir_all(&settings.documents.folder).await?;
            tokio::fs::create_dir_all(&settings.documents.upload_dir).await?;
            println!(
                "catalog={} documents={} uploads={}",
                settings.database.path.display(),
                settings.documents.folder.display(),
                settings.documents.upload_dir.display()
            );
        }
        Command::Scan => {
            let report = library.scan_documents_folder().await;
            for skipped in &report.errors {
                warn!(filename = %skipped.filename, reason = %skipped.reason, "skipped document");
            }
            println!(
                "{} new, {} existing, {} failed",
                report.new_count,
                report.existing_count,
                report.errors.len()
            );
        }
        Command::Upload {
            path,
            title,
            author,
        } => {
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .with_context(|| format!("{} has no file name", path.display()))?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;

            let summary = library
                .upload(UploadRequest {
                    filename,
                    bytes,
                    title,
                    author,
                })
                .await?;
            println!(
                "document_id={} chunks={} title={}",
                summary.document.id,
                summary.chunk_count,
                summary.document.display_title()
            );
        }
        Command::List => {
            let documents = library.list_documents().await?;
            if documents.is_empty() {
                println!("no documents");
            }
            for summary in documents {
                let document = &summary.document;
                println!(
                    "[{}] {} ({}) chunks={} uploaded={}",
                    document.id,
                    document.display_title(),
                    document.file_type,
                    summary.chunk_count,
                    document.upload_date.to_rfc3339()
                );
            }
        }
        Command::Delete { id } => {
            library.delete_document(id).await?;
            println!("deleted document {id}");
        }
        Command::Search {
            query,
            top_k,
            min_relevance,
            json,
        } => {
            let outcome = library.search(&query, top_k, min_relevance).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }

            if let Some(reason) = &outcome.degraded {
                println!("search degraded: {reason}");
            }
            if outcome.results.is_empty() {
                println!("no relevant passages");
            }
            for result in outcome.results {
                let mut citation = result.document_title.clone();
                if let Some(page) = result.page_number {
                    citation.push_str(&format!(", page {page}"));
                }
                if let Some(chapter) = &result.chapter {
                    citation.push_str(&format!(", {chapter}"));
                }
                println!(
                    "score={:.3} chunk={} [{}]",
                    result.relevance_score, result.chunk_id, citation
                );
                println!("  {}", result.content_preview);
            }
        }
        Command::Reconcile => {
            let report = library.reconcile_index().await?;
            println!(
                "removed {} entries for {} orphaned documents",
                report.removed_entries,
                report.orphaned_documents.len()
            );
        }
    }

    Ok(())
}
