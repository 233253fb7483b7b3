//! Per-extension text extraction.
//!
//! The [`ExtractorRegistry`] maps a lower-cased extension (with its leading
//! dot) to an [`Extractor`]. The scanner only keeps files whose extension is
//! registered, so the registry is also the supported-format set.
//!
//! Built-in extractors:
//!
//! | Extension | Extractor | Metadata |
//! |-----------|-----------|----------|
//! | `.txt`, `.md` | [`PlainText`] | none |
//! | `.pdf` | [`PdfExtractor`] (pdf-extract, lopdf) | `/Info` `/Title`, `/Author` |
//! | `.epub` | [`EpubExtractor`] (zip + quick-xml) | `dc:title`, `dc:creator` |
//! | `.docx` | [`DocxExtractor`] (zip + quick-xml) | `dc:title`, `dc:creator` |

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use quick_xml::events::Event;

use crate::error::ExtractError;

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Text plus optional metadata pulled out of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl Extracted {
    fn plain(text: String) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }
}

/// Turns one file into plain text. Implementations run on blocking threads.
pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Extracted, ExtractError>;
}

/// Closed set of supported extensions.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    by_ext: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `.txt`, `.md`, `.pdf`, `.epub`, `.docx`.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        let plain: Arc<dyn Extractor> = Arc::new(PlainText);
        reg.register_shared(".txt", plain.clone());
        reg.register_shared(".md", plain);
        reg.register(".pdf", PdfExtractor);
        reg.register(".epub", EpubExtractor);
        reg.register(".docx", DocxExtractor);
        reg
    }

    pub fn register(&mut self, ext: &str, extractor: impl Extractor + 'static) {
        self.register_shared(ext, Arc::new(extractor));
    }

    pub fn register_shared(&mut self, ext: &str, extractor: Arc<dyn Extractor>) {
        self.by_ext.insert(normalize_ext(ext), extractor);
    }

    pub fn supports(&self, ext: &str) -> bool {
        self.by_ext.contains_key(&normalize_ext(ext))
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_ext.keys().cloned().collect();
        exts.sort();
        exts
    }

    /// Dispatch on `ext` and extract `path`.
    pub fn extract(&self, path: &Path, ext: &str) -> Result<Extracted, ExtractError> {
        let extractor = self
            .by_ext
            .get(&normalize_ext(ext))
            .ok_or_else(|| ExtractError::UnsupportedExtension(ext.to_string()))?;
        extractor.extract(path)
    }
}

/// Lower-case and ensure a leading dot: `"MD"` → `".md"`.
pub fn normalize_ext(ext: &str) -> String {
    let lower = ext.to_ascii_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{}", lower)
    }
}

/// Extension of `path` in registry form, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| normalize_ext(&e.to_string_lossy()))
}

// ============ Plain text ============

/// Pass-through for text and markdown. Invalid UTF-8 is replaced, not rejected.
pub struct PlainText;

impl Extractor for PlainText {
    fn extract(&self, path: &Path) -> Result<Extracted, ExtractError> {
        let bytes = std::fs::read(path)?;
        Ok(Extracted::plain(String::from_utf8_lossy(&bytes).into_owned()))
    }
}

// ============ PDF ============

pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<Extracted, ExtractError> {
        let bytes = std::fs::read(path)?;
        extract_pdf(&bytes)
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let (title, author) = pdf_info(bytes);
    Ok(Extracted {
        text,
        title,
        author,
    })
}

/// `/Title` and `/Author` from the trailer's `/Info` dictionary.
/// Missing or unreadable metadata is not an extraction failure.
fn pdf_info(bytes: &[u8]) -> (Option<String>, Option<String>) {
    let doc = match lopdf::Document::load_mem(bytes) {
        Ok(doc) => doc,
        Err(_) => return (None, None),
    };
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| doc.dereference(obj).ok())
        .and_then(|(_, obj)| obj.as_dict().ok());
    let Some(info) = info else {
        return (None, None);
    };
    let field = |key: &[u8]| -> Option<String> {
        let obj = info.get(key).ok()?;
        let (_, obj) = doc.dereference(obj).ok()?;
        match obj {
            lopdf::Object::String(raw, _) => {
                let value = decode_pdf_text(raw).trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            _ => None,
        }
    };
    (field(&b"Title"[..]), field(&b"Author"[..]))
}

/// PDF text strings are UTF-16BE with a byte-order mark, or a Latin-1
/// superset (PDFDocEncoding) otherwise.
fn decode_pdf_text(raw: &[u8]) -> String {
    match raw {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => raw.iter().map(|&b| b as char).collect(),
    }
}

// ============ ZIP helpers ============

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn read_zip_entry_bounded(
    archive: &mut Archive<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Option<Vec<u8>>, String> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.to_string()),
    };
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        ));
    }
    Ok(Some(out))
}

fn text_of(te: &quick_xml::events::BytesText<'_>) -> String {
    te.unescape()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(te).into_owned())
}

/// `dc:title` and `dc:creator` from a Dublin Core metadata block
/// (EPUB package documents and OOXML `docProps/core.xml` share the shape).
fn dublin_core(xml: &[u8]) -> (Option<String>, Option<String>) {
    let mut title = None;
    let mut author = None;
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<&'static str> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    _ => None,
                };
            }
            Ok(Event::Text(te)) => {
                let value = text_of(&te);
                match current {
                    Some("title") if title.is_none() && !value.is_empty() => title = Some(value),
                    Some("creator") if author.is_none() && !value.is_empty() => {
                        author = Some(value)
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    (title, author)
}

// ============ DOCX ============

/// Word documents: concatenated `w:t` runs, one line per paragraph.
pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn extract(&self, path: &Path) -> Result<Extracted, ExtractError> {
        let bytes = std::fs::read(path)?;
        extract_docx(&bytes)
    }
}

fn extract_docx(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)
        .map_err(ExtractError::Ooxml)?
        .ok_or_else(|| ExtractError::Ooxml("word/document.xml not found".to_string()))?;
    let text = extract_w_t_elements(&doc_xml)?;

    let (title, author) = read_zip_entry_bounded(&mut archive, "docProps/core.xml", MAX_XML_ENTRY_BYTES)
        .ok()
        .flatten()
        .map(|xml| dublin_core(&xml))
        .unwrap_or_default();

    Ok(Extracted {
        text,
        title,
        author,
    })
}

fn extract_w_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => out.push_str(&text_of(&te)),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

// ============ EPUB ============

/// EPUB books: spine-ordered XHTML documents joined by blank lines.
///
/// Reads `META-INF/container.xml` to locate the package document, takes
/// title/author from its metadata, and walks the spine. Books without a
/// usable package document fall back to every XHTML entry in name order.
pub struct EpubExtractor;

impl Extractor for EpubExtractor {
    fn extract(&self, path: &Path) -> Result<Extracted, ExtractError> {
        let bytes = std::fs::read(path)?;
        extract_epub(&bytes)
    }
}

struct Package {
    title: Option<String>,
    author: Option<String>,
    /// Archive paths of content documents in reading order.
    spine: Vec<String>,
}

fn extract_epub(bytes: &[u8]) -> Result<Extracted, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Epub(e.to_string()))?;

    let package = match locate_package(&mut archive)? {
        Some(opf_path) => read_package(&mut archive, &opf_path)?,
        None => None,
    };

    let (title, author, spine) = match package {
        Some(p) if !p.spine.is_empty() => (p.title, p.author, p.spine),
        other => {
            let mut names: Vec<String> = archive
                .file_names()
                .filter(|n| {
                    let lower = n.to_ascii_lowercase();
                    lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
                })
                .map(|s| s.to_string())
                .collect();
            names.sort();
            let (title, author) = other.map(|p| (p.title, p.author)).unwrap_or_default();
            (title, author, names)
        }
    };

    let mut parts = Vec::with_capacity(spine.len());
    for name in spine {
        let Some(xml) = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)
            .map_err(ExtractError::Epub)?
        else {
            continue;
        };
        let text = xhtml_text(&xml);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }

    Ok(Extracted {
        text: parts.join("\n\n"),
        title,
        author,
    })
}

fn locate_package(archive: &mut Archive<'_>) -> Result<Option<String>, ExtractError> {
    let Some(xml) = read_zip_entry_bounded(archive, "META-INF/container.xml", MAX_XML_ENTRY_BYTES)
        .map_err(ExtractError::Epub)?
    else {
        return Ok(None);
    };
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"rootfile" => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"full-path" {
                        let value = attr
                            .unescape_value()
                            .map_err(|err| ExtractError::Epub(err.to_string()))?;
                        return Ok(Some(value.into_owned()));
                    }
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(ExtractError::Epub(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

fn read_package(archive: &mut Archive<'_>, opf_path: &str) -> Result<Option<Package>, ExtractError> {
    let Some(xml) =
        read_zip_entry_bounded(archive, opf_path, MAX_XML_ENTRY_BYTES).map_err(ExtractError::Epub)?
    else {
        return Ok(None);
    };
    let (title, author) = dublin_core(&xml);

    let base = match opf_path.rfind('/') {
        Some(pos) => &opf_path[..=pos],
        None => "",
    };

    let mut manifest: HashMap<String, String> = HashMap::new();
    let mut spine_ids: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"item" => {
                    let mut id = None;
                    let mut href = None;
                    for attr in e.attributes().flatten() {
                        let value = attr.unescape_value().map(|v| v.into_owned()).ok();
                        match attr.key.local_name().as_ref() {
                            b"id" => id = value,
                            b"href" => href = value,
                            _ => {}
                        }
                    }
                    if let (Some(id), Some(href)) = (id, href) {
                        manifest.insert(id, format!("{}{}", base, href));
                    }
                }
                b"itemref" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"idref" {
                            if let Ok(v) = attr.unescape_value() {
                                spine_ids.push(v.into_owned());
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Epub(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let spine = spine_ids
        .iter()
        .filter_map(|id| manifest.get(id).cloned())
        .collect();

    Ok(Some(Package {
        title,
        author,
        spine,
    }))
}

/// Visible text of an XHTML document. Skips `head`, `script`, and `style`;
/// block-level closes become line breaks. Lenient: stops at the first
/// parse error and keeps what it has.
fn xhtml_text(xml: &[u8]) -> String {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();
    let mut hidden_depth = 0usize;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if matches!(e.local_name().as_ref(), b"head" | b"script" | b"style") {
                    hidden_depth += 1;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"head" | b"script" | b"style" => hidden_depth = hidden_depth.saturating_sub(1),
                    b"p" | b"div" | b"li" | b"h1" | b"h2" | b"h3" | b"h4" | b"h5" | b"h6"
                    | b"tr" | b"blockquote" => {
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"br" => out.push('\n'),
            Ok(Event::Text(te)) if hidden_depth == 0 => out.push_str(&text_of(&te)),
            Ok(Event::CData(cd)) if hidden_depth == 0 => {
                out.push_str(&String::from_utf8_lossy(&cd))
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    out
}
