//! Document parsing: extension registry plus the built-in extractors.
//!
//! The pipeline consumes a [`DocumentParser`] that yields plain-text
//! [`Fragment`]s with per-fragment metadata. A [`ParserRegistry`] maps
//! lowercased extensions to parser instances, built once at startup; unknown
//! extensions fall through to the plain-text fallback. Binary formats (PDF,
//! OOXML) are unpacked with bounded reads so a hostile archive cannot balloon
//! memory.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// Maximum sheets processed in a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells processed per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// A piece of extracted text plus metadata (page number, sheet name, …).
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl Fragment {
    pub fn new(text: impl Into<String>) -> Self {
        Fragment {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    fn with(text: impl Into<String>, key: &str, value: impl ToString) -> Self {
        let mut fragment = Fragment::new(text);
        fragment
            .metadata
            .insert(key.to_string(), value.to_string());
        fragment
    }
}

/// Extracts plain text from one file on disk.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>>;
}

/// Extension → parser mapping, resolved once per ingestion run.
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn DocumentParser>>,
    fallback: Arc<dyn DocumentParser>,
}

impl ParserRegistry {
    /// Registry with the built-in parsers for every supported extension.
    pub fn with_builtins() -> Self {
        let plain: Arc<dyn DocumentParser> = Arc::new(PlainTextParser);
        let mut registry = ParserRegistry {
            parsers: HashMap::new(),
            fallback: plain.clone(),
        };
        for ext in ["txt", "md", "markdown", "csv", "doc", "ofd"] {
            registry.register(ext, plain.clone());
        }
        registry.register("pdf", Arc::new(PdfParser));
        registry.register("docx", Arc::new(DocxParser));
        registry.register("xlsx", Arc::new(XlsxParser));
        let html: Arc<dyn DocumentParser> = Arc::new(HtmlParser);
        registry.register("html", html.clone());
        registry.register("htm", html);
        registry
    }

    pub fn register(&mut self, extension: &str, parser: Arc<dyn DocumentParser>) {
        self.parsers.insert(extension.to_lowercase(), parser);
    }

    /// Parser for the extension, or the plain-text fallback.
    pub fn parser_for(&self, extension: &str) -> Arc<dyn DocumentParser> {
        self.parsers
            .get(&extension.to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// ============ Plain text ============

/// Reads the file as UTF-8, replacing invalid sequences.
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(vec![Fragment::new(text)])
    }
}

// ============ PDF ============

pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| anyhow!("PDF extraction failed: {}", e))?;
        Ok(vec![Fragment::new(text)])
    }
}

// ============ DOCX ============

pub struct DocxParser;

impl DocumentParser for DocxParser {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
            .map_err(|e| anyhow!("OOXML open failed: {}", e))?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
        let text = extract_w_t_elements(&xml)?;
        Ok(vec![Fragment::new(text)])
    }
}

/// Collect `w:t` runs, inserting a newline at each paragraph end.
fn extract_w_t_elements(xml: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => bail!("OOXML parse failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ XLSX ============

pub struct XlsxParser;

impl DocumentParser for XlsxParser {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
            .map_err(|e| anyhow!("OOXML open failed: {}", e))?;

        let shared_strings = read_shared_strings(&mut archive)?;
        let sheet_names = list_worksheet_names(&mut archive);

        let mut fragments = Vec::new();
        for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
            let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
            let cells = extract_sheet_cells(&sheet_xml, &shared_strings)?;
            if !cells.is_empty() {
                fragments.push(Fragment::with(cells, "sheet", idx + 1));
            }
        }
        Ok(fragments)
    }
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        strings.push(te.unescape().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => bail!("OOXML parse failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Cell values in document order: shared strings resolved, inline values
/// kept verbatim.
fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_v = false;
    let mut cell_is_shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"c" {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                } else if e.local_name().as_ref() == b"v" {
                    in_v = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_v => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared {
                        if let Some(shared) = s.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                            cells.push(shared.clone());
                        }
                    } else {
                        cells.push(s.to_string());
                    }
                }
                in_v = false;
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"v" {
                    in_v = false;
                } else if e.local_name().as_ref() == b"c" {
                    cell_is_shared = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => bail!("OOXML parse failed: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| anyhow!("ZIP entry {}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| anyhow!("ZIP entry {}: {}", name, e))?;
    if out.len() as u64 >= max_bytes {
        bail!("ZIP entry {} exceeds size limit ({} bytes)", name, max_bytes);
    }
    Ok(out)
}

// ============ HTML ============

/// Tag-stripping extractor tolerant of real-world markup: skips `script`,
/// `style` and comments, decodes the common entities, and inserts line breaks
/// at block-level closers.
pub struct HtmlParser;

impl DocumentParser for HtmlParser {
    fn parse(&self, path: &Path) -> Result<Vec<Fragment>> {
        let bytes =
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let html = String::from_utf8_lossy(&bytes);
        Ok(vec![Fragment::new(strip_html(&html))])
    }
}

fn strip_html(html: &str) -> String {
    let mut out = String::new();
    let mut rest = html;
    let mut skip_until: Option<&str> = None;

    while let Some(open) = rest.find('<') {
        if skip_until.is_none() {
            push_decoded(&mut out, &rest[..open]);
        }
        rest = &rest[open..];

        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => {
                    rest = &rest[end + 3..];
                    continue;
                }
                None => break,
            }
        }

        let Some(close) = rest.find('>') else { break };
        let tag = rest[1..close].trim();
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        match skip_until {
            Some(until) if tag.starts_with('/') && name == until => skip_until = None,
            None if name == "script" || name == "style" => skip_until = Some(if name == "script" { "script" } else { "style" }),
            _ => {}
        }

        if skip_until.is_none()
            && matches!(name.as_str(), "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
            && !out.ends_with('\n')
        {
            out.push('\n');
        }

        rest = &rest[close + 1..];
    }
    if skip_until.is_none() {
        push_decoded(&mut out, rest);
    }
    out.trim().to_string()
}

fn push_decoded(out: &mut String, text: &str) {
    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    out.push_str(&decoded);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_fallback_to_plain_text() {
        let registry = ParserRegistry::with_builtins();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.unknown");
        std::fs::write(&path, "plain body").unwrap();
        let fragments = registry.parser_for("unknown").parse(&path).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].text, "plain body");
    }

    #[test]
    fn test_plain_text_lossy_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, [b'h', b'i', 0xFF, b'!']).unwrap();
        let fragments = PlainTextParser.parse(&path).unwrap();
        assert!(fragments[0].text.starts_with("hi"));
        assert!(fragments[0].text.ends_with('!'));
    }

    #[test]
    fn test_strip_html_basics() {
        let text = strip_html(
            "<html><head><style>p { color: red }</style></head>\
             <body><p>Hello &amp; welcome</p><script>var x = 1;</script>\
             <p>Second</p></body></html>",
        );
        assert!(text.contains("Hello & welcome"));
        assert!(text.contains("Second"));
        assert!(!text.contains("color"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn test_strip_html_unclosed_comment() {
        assert_eq!(strip_html("before<!-- never closed"), "before");
    }

    #[test]
    fn test_docx_text_runs() {
        let xml = br#"<?xml version="1.0"?>
            <w:document xmlns:w="ns"><w:body>
              <w:p><w:r><w:t>First run</w:t></w:r><w:r><w:t> and second.</w:t></w:r></w:p>
              <w:p><w:r><w:t>Next paragraph.</w:t></w:r></w:p>
            </w:body></w:document>"#;
        let text = extract_w_t_elements(xml).unwrap();
        assert!(text.contains("First run and second."));
        assert!(text.contains("Next paragraph."));
        assert!(text.matches('\n').count() >= 2);
    }

    #[test]
    fn test_sheet_cells_resolve_shared_strings() {
        let shared = vec!["alpha".to_string(), "beta".to_string()];
        let xml = br#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c><v>42</v></c><c t="s"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let cells = extract_sheet_cells(xml, &shared).unwrap();
        assert_eq!(cells, "alpha 42 beta");
    }
}
