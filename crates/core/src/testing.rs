//! Fixture builders shared by the unit tests.

use crate::catalog;
use crate::embeddings::CharacterNgramEmbedder;
use crate::ingest::IngestPipeline;
use crate::models::IngestionOptions;
use crate::stores::SqliteVectorIndex;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// Writes a PDF with one page per entry; an empty entry produces a page with
/// no text operators.
pub fn write_pdf(path: &Path, pages: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let operations = if text.is_empty() {
            Vec::new()
        } else {
            vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ]
        };
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path)?;
    Ok(())
}

/// Writes an EPUB whose spine lists one XHTML document per body fragment.
pub fn write_epub(path: &Path, chapters: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.start_file("mimetype", options)?;
    zip.write_all(b"application/epub+zip")?;

    zip.start_file("META-INF/container.xml", options)?;
    zip.write_all(
        br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
    )?;

    let mut manifest = String::from(
        r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#,
    );
    let mut spine = String::new();
    for index in 0..chapters.len() {
        let number = index + 1;
        manifest.push_str(&format!(
            r#"<item id="ch{number}" href="text/ch{number}.xhtml" media-type="application/xhtml+xml"/>"#
        ));
        spine.push_str(&format!(r#"<itemref idref="ch{number}"/>"#));
    }

    zip.start_file("OEBPS/content.opf", options)?;
    zip.write_all(
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>Test Book</dc:title></metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
        )
        .as_bytes(),
    )?;

    zip.start_file("OEBPS/nav.xhtml", options)?;
    zip.write_all(xhtml("<nav><ol><li>Contents</li></ol></nav>").as_bytes())?;

    for (index, body) in chapters.iter().enumerate() {
        zip.start_file(format!("OEBPS/text/ch{}.xhtml", index + 1), options)?;
        zip.write_all(xhtml(body).as_bytes())?;
    }

    zip.finish()?;
    Ok(())
}

fn xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head></head><body>{body}</body></html>"#
    )
}

/// Catalog, on-disk vector index and a pipeline over the trigram embedder,
/// all rooted in a temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub index: Arc<SqliteVectorIndex>,
    pub embedder: CharacterNgramEmbedder,
    pub pipeline: IngestPipeline,
}

impl Fixture {
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let pool = catalog::connect(&dir.path().join("catalog.sqlite")).await?;
        catalog::migrate(&pool).await?;
        let index = Arc::new(SqliteVectorIndex::open(&dir.path().join("vectors.sqlite")).await?);
        let embedder = CharacterNgramEmbedder::default();
        let pipeline = IngestPipeline::new(
            Arc::new(embedder),
            index.clone(),
            IngestionOptions::default(),
        )?;

        Ok(Self {
            dir,
            pool,
            index,
            embedder,
            pipeline,
        })
    }
}
