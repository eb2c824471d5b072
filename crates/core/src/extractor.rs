use crate::clean::decode_utf8_lossless;
use crate::error::IngestError;
use crate::models::FileType;
use lopdf::Document;
use quick_xml::escape::resolve_html5_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAX_EPUB_ENTRY_BYTES: u64 = 32 * 1024 * 1024;

/// One addressable unit of a document. `label` is the 1-based page (PDF) or
/// chapter (EPUB) number, `None` for formats without units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub label: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub units: Vec<PageText>,
    pub total_units: Option<u32>,
}

pub trait TextExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl TextExtractor for LopdfExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let pages = document.get_pages();
        let mut units = Vec::new();
        for page_no in pages.keys().copied() {
            let text = match document.extract_text(&[page_no]) {
                Ok(text) => text,
                Err(error) => {
                    warn!(path = %path.display(), page = page_no, %error, "page text extraction failed");
                    continue;
                }
            };

            if !text.trim().is_empty() {
                units.push(PageText {
                    label: Some(page_no),
                    text,
                });
            }
        }

        Ok(Extraction {
            units,
            total_units: Some(pages.len() as u32),
        })
    }
}

#[derive(Default)]
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, IngestError> {
        let bytes = std::fs::read(path)?;
        Ok(Extraction {
            units: vec![PageText {
                label: None,
                text: decode_utf8_lossless(&bytes),
            }],
            total_units: None,
        })
    }
}

/// Reads an EPUB container in spine order. Every content document advances the
/// chapter counter, including ones that turn out to hold no text.
#[derive(Default)]
pub struct EpubExtractor;

impl TextExtractor for EpubExtractor {
    fn extract(&self, path: &Path) -> Result<Extraction, IngestError> {
        let bytes = std::fs::read(path)?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice()))
            .map_err(|error| IngestError::EpubParse(error.to_string()))?;

        let container = read_entry(&mut archive, "META-INF/container.xml")?;
        let opf_path = rootfile_path(&container)?;
        let opf = read_entry(&mut archive, &opf_path)?;
        let package = parse_package(&opf)?;

        let base_dir = match opf_path.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => String::new(),
        };

        let mut units = Vec::new();
        let mut chapter = 0u32;
        for href in package.reading_order() {
            chapter += 1;
            let entry_name = resolve_href(&base_dir, href);
            let markup = match read_entry(&mut archive, &entry_name) {
                Ok(markup) => markup,
                Err(error) => {
                    warn!(path = %path.display(), entry = %entry_name, %error, "skipping unreadable epub document");
                    continue;
                }
            };

            let text = html_to_text(&markup);
            if !text.trim().is_empty() {
                units.push(PageText {
                    label: Some(chapter),
                    text,
                });
            }
        }

        debug!(path = %path.display(), chapters = chapter, non_empty = units.len(), "epub extracted");

        Ok(Extraction {
            units,
            total_units: Some(chapter),
        })
    }
}

pub fn extract_units_blocking(path: &Path, file_type: FileType) -> Result<Extraction, IngestError> {
    match file_type {
        FileType::Pdf => LopdfExtractor.extract(path),
        FileType::Txt => PlainTextExtractor.extract(path),
        FileType::Epub => EpubExtractor.extract(path),
    }
}

/// Runs extraction on the blocking pool.
pub async fn extract_units(path: &Path, file_type: FileType) -> Result<Extraction, IngestError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || extract_units_blocking(&path, file_type)).await?
}

fn read_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, IngestError> {
    let entry = archive
        .by_name(name)
        .map_err(|error| IngestError::EpubParse(format!("{name}: {error}")))?;
    let mut out = Vec::new();
    entry.take(MAX_EPUB_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_EPUB_ENTRY_BYTES {
        return Err(IngestError::EpubParse(format!(
            "{name} exceeds size limit ({MAX_EPUB_ENTRY_BYTES} bytes)"
        )));
    }
    Ok(out)
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

fn rootfile_path(container: &[u8]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(container);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::EpubParse(error.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Err(IngestError::EpubParse(
        "container.xml has no rootfile".to_string(),
    ))
}

struct ManifestItem {
    id: String,
    href: String,
    is_document: bool,
}

struct Package {
    manifest: Vec<ManifestItem>,
    spine: Vec<String>,
}

impl Package {
    fn reading_order(&self) -> Vec<&str> {
        let from_spine: Vec<&str> = self
            .spine
            .iter()
            .filter_map(|idref| self.manifest.iter().find(|item| &item.id == idref))
            .filter(|item| item.is_document)
            .map(|item| item.href.as_str())
            .collect();

        if !from_spine.is_empty() {
            return from_spine;
        }

        self.manifest
            .iter()
            .filter(|item| item.is_document)
            .map(|item| item.href.as_str())
            .collect()
    }
}

fn parse_package(opf: &[u8]) -> Result<Package, IngestError> {
    let mut reader = Reader::from_reader(opf);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut manifest = Vec::new();
    let mut spine = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    if let (Some(id), Some(href)) = (attribute(&e, b"id"), attribute(&e, b"href")) {
                        let media_type = attribute(&e, b"media-type").unwrap_or_default();
                        let is_nav = attribute(&e, b"properties").is_some_and(|properties| {
                            properties.split_whitespace().any(|p| p == "nav")
                        });
                        manifest.push(ManifestItem {
                            id,
                            href,
                            is_document: !is_nav
                                && matches!(
                                    media_type.as_str(),
                                    "application/xhtml+xml" | "text/html"
                                ),
                        });
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&e, b"idref") {
                        spine.push(idref);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::EpubParse(error.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(Package { manifest, spine })
}

fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Joins the text nodes of an (X)HTML document with single spaces, skipping
/// script and style bodies. Malformed markup keeps whatever was read so far.
pub fn html_to_text(markup: &[u8]) -> String {
    let mut reader = Reader::from_reader(markup);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut buf = Vec::new();
    let mut parts: Vec<String> = Vec::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if is_skipped_element(e.local_name().as_ref()) => skip_depth += 1,
            Ok(Event::End(e)) if is_skipped_element(e.local_name().as_ref()) => {
                skip_depth = skip_depth.saturating_sub(1)
            }
            Ok(Event::Text(text)) if skip_depth == 0 => {
                parts.push(decode_entities(&String::from_utf8_lossy(&text)));
            }
            Ok(Event::CData(data)) if skip_depth == 0 => {
                parts.push(String::from_utf8_lossy(&data.into_inner()).into_owned());
            }
            Ok(Event::Eof) => break,
            Err(error) => {
                debug!(%error, "stopping at malformed markup");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    parts.join(" ")
}

const MAX_ENTITY_LEN: usize = 32;

/// Resolves HTML5 named and numeric character references. Unknown or
/// malformed references are kept as written.
fn decode_entities(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let resolved = tail
            .find(';')
            .filter(|end| *end <= MAX_ENTITY_LEN)
            .and_then(|end| resolve_entity(&tail[..end]).map(|text| (text, end)));

        match resolved {
            Some((text, end)) => {
                out.push_str(&text);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    resolve_html5_entity(name).map(str::to_string)
}

fn is_skipped_element(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"script") || name.eq_ignore_ascii_case(b"style")
}
