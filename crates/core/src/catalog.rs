//! Relational side of the library: documents and their chunk rows.
//!
//! Every function takes a `&mut SqliteConnection` so the caller decides the
//! transaction boundary; pass `&mut *tx` inside a transaction or `&mut *conn`
//! for a pooled connection.

use crate::models::{ChunkRecord, Document, DocumentSummary, FileType, NewChunk, NewDocument};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::path::Path;

const MIGRATIONS: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL,
        title TEXT,
        author TEXT,
        file_type TEXT NOT NULL,
        file_path TEXT NOT NULL,
        total_units INTEGER,
        checksum TEXT,
        upload_date INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_documents_filename ON documents(filename)",
    "CREATE TABLE IF NOT EXISTS document_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        content TEXT NOT NULL,
        page_number INTEGER,
        chapter TEXT,
        section TEXT,
        embedding_id TEXT NOT NULL UNIQUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id)",
];

const DOCUMENT_COLUMNS: &str =
    "id, filename, title, author, file_type, file_path, total_units, checksum, upload_date";

/// Opens (creating if needed) a WAL-mode SQLite file with foreign keys enforced.
pub async fn connect(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn document_from_row(row: &SqliteRow) -> Result<Document, sqlx::Error> {
    let file_type: String = row.try_get("file_type")?;
    let file_type = file_type
        .parse::<FileType>()
        .map_err(|error| sqlx::Error::Decode(Box::new(error)))?;
    let total_units: Option<i64> = row.try_get("total_units")?;
    let upload_date: i64 = row.try_get("upload_date")?;

    Ok(Document {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        file_type,
        file_path: row.try_get("file_path")?,
        total_units: total_units.map(|units| units as u32),
        checksum: row.try_get("checksum")?,
        upload_date: DateTime::from_timestamp(upload_date, 0).unwrap_or_default(),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord, sqlx::Error> {
    let chunk_index: i64 = row.try_get("chunk_index")?;
    let page_number: Option<i64> = row.try_get("page_number")?;
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: chunk_index as u32,
        content: row.try_get("content")?,
        page_number: page_number.map(|page| page as u32),
        chapter: row.try_get("chapter")?,
        section: row.try_get("section")?,
        embedding_id: row.try_get("embedding_id")?,
    })
}

pub async fn insert_document(
    conn: &mut SqliteConnection,
    new: &NewDocument,
) -> Result<Document, sqlx::Error> {
    let now = Utc::now().timestamp();
    let id = sqlx::query(
        "INSERT INTO documents (filename, title, author, file_type, file_path, checksum, upload_date)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&new.filename)
    .bind(&new.title)
    .bind(&new.author)
    .bind(new.file_type.as_str())
    .bind(&new.file_path)
    .bind(&new.checksum)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    get_document(conn, id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn get_document(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(document_from_row).transpose()
}

pub async fn find_by_filename(
    conn: &mut SqliteConnection,
    filename: &str,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE filename = ? ORDER BY id LIMIT 1"
    ))
    .bind(filename)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(document_from_row).transpose()
}

pub async fn set_total_units(
    conn: &mut SqliteConnection,
    id: i64,
    total_units: Option<u32>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE documents SET total_units = ? WHERE id = ?")
        .bind(total_units.map(i64::from))
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn insert_chunk(conn: &mut SqliteConnection, chunk: &NewChunk) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO document_chunks
            (document_id, chunk_index, content, page_number, chapter, section, embedding_id)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(chunk.document_id)
    .bind(i64::from(chunk.chunk_index))
    .bind(&chunk.content)
    .bind(chunk.page_number.map(i64::from))
    .bind(&chunk.chapter)
    .bind(&chunk.section)
    .bind(&chunk.embedding_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn chunks_for_document(
    conn: &mut SqliteConnection,
    document_id: i64,
) -> Result<Vec<ChunkRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, document_id, chunk_index, content, page_number, chapter, section, embedding_id
         FROM document_chunks WHERE document_id = ? ORDER BY chunk_index",
    )
    .bind(document_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(chunk_from_row).collect()
}

pub async fn count_chunks(conn: &mut SqliteConnection, document_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(&mut *conn)
        .await
}

/// Newest first, each with its chunk count.
pub async fn list_documents(conn: &mut SqliteConnection) -> Result<Vec<DocumentSummary>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT d.id, d.filename, d.title, d.author, d.file_type, d.file_path, d.total_units,
                d.checksum, d.upload_date, COUNT(c.id) AS chunk_count
         FROM documents d
         LEFT JOIN document_chunks c ON c.document_id = d.id
         GROUP BY d.id
         ORDER BY d.upload_date DESC, d.id DESC",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(DocumentSummary {
                document: document_from_row(row)?,
                chunk_count: row.try_get("chunk_count")?,
            })
        })
        .collect()
}

pub async fn document_ids(conn: &mut SqliteConnection) -> Result<Vec<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
        .fetch_all(&mut *conn)
        .await
}

/// Deletes the document; its chunk rows go with it through the cascade.
pub async fn delete_document(conn: &mut SqliteConnection, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}
