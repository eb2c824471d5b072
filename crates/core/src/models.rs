use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Txt,
    Epub,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Txt => "txt",
            FileType::Epub => "epub",
        }
    }

    /// Lowercased text after the last dot of `filename`.
    pub fn extension_of(filename: &str) -> Option<String> {
        filename
            .rsplit_once('.')
            .map(|(_, extension)| extension.to_ascii_lowercase())
            .filter(|extension| !extension.is_empty())
    }

    pub fn from_filename(filename: &str) -> Result<Self, IngestError> {
        let extension = Self::extension_of(filename)
            .ok_or_else(|| IngestError::UnsupportedFileType(filename.to_string()))?;
        extension.parse()
    }
}

impl FromStr for FileType {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(FileType::Pdf),
            "txt" => Ok(FileType::Txt),
            "epub" => Ok(FileType::Epub),
            other => Err(IngestError::UnsupportedFileType(other.to_string())),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub file_type: FileType,
    pub file_path: String,
    pub total_units: Option<u32>,
    pub checksum: Option<String>,
    pub upload_date: DateTime<Utc>,
}

impl Document {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|title| !title.trim().is_empty())
            .unwrap_or(&self.filename)
    }
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub filename: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub file_type: FileType,
    pub file_path: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    #[serde(flatten)]
    pub document: Document,
    pub chunk_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: u32,
    pub content: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
    pub section: Option<String>,
    pub embedding_id: String,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub document_id: i64,
    pub chunk_index: u32,
    pub content: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
    pub section: Option<String>,
    pub embedding_id: String,
}

/// Metadata stored next to every vector. `page_number` is 0 when the unit had no label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub document_id: i64,
    pub document_title: String,
    pub chunk_index: u32,
    pub page_number: u32,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
}

impl ChunkMetadata {
    pub fn into_map(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: i64,
    pub document_title: String,
    pub content_preview: String,
    pub page_number: Option<u32>,
    pub chapter: Option<String>,
    pub section: Option<String>,
    pub chunk_index: Option<u32>,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Set when the embedder or the index failed and the results are empty for that reason.
    pub degraded: Option<String>,
}

impl SearchOutcome {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            degraded: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkippedDocument {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub new_count: usize,
    pub existing_count: usize,
    pub errors: Vec<SkippedDocument>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub orphaned_documents: Vec<i64>,
    pub removed_entries: usize,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chars: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            min_chars: 10,
        }
    }
}
