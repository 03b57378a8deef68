//! XML rendering of bundle content, and the light-weight header parse the
//! registry uses to describe existing bundles without trusting file names.

use crate::builtin::get_bundle_readme_text;
use crate::bundle::BundleType;
use crate::error::{AppError, Result};
use crate::gather::{FileRecord, NodeKind, TreeNode, build_tree_from_paths, render_ascii_tree};
use byte_unit::{Byte, UnitType};
use chrono::{DateTime, SecondsFormat, Utc};
use log;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

pub const DOCUMENT_ELEMENT: &str = "document";

/// Top-level metadata written into `<bundle_metadata>`.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleHeader {
    pub id: String,
    pub project_name: String,
    pub bundle_type: BundleType,
    pub derived_from_tag: Option<String>,
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub token_estimate: Option<usize>,
    pub ignore_patterns: Vec<String>,
}

/// A file as embedded in a bundle, with tags resolved from the state store.
#[derive(Debug, Clone, Copy)]
pub struct DocumentFile<'a> {
    pub record: &'a FileRecord,
    pub tags: &'a [String],
}

pub struct RenderOptions {
    pub include_ai_readme: bool,
    pub indent: usize,
}

pub fn render_bundle_document(
    header: &BundleHeader,
    files: &[DocumentFile<'_>],
    options: &RenderOptions,
) -> Result<String> {
    log::debug!(
        "Rendering bundle document {} with {} files",
        header.id,
        files.len()
    );
    let mut writer = if options.indent > 0 {
        Writer::new_with_indent(Vec::new(), b' ', options.indent)
    } else {
        Writer::new(Vec::new())
    };
    let w = &mut writer;

    emit(w, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    start(
        w,
        "bundle",
        &[("id", header.id.as_str()), ("type", header.bundle_type.as_str())],
    )?;

    write_metadata(w, header, files)?;
    if options.include_ai_readme {
        text_element(w, "ai_readme", &ai_readme(header, !files.is_empty()))?;
    }

    let paths: Vec<&str> = files.iter().map(|f| f.record.path.as_str()).collect();
    let tree = build_tree_from_paths(paths.as_slice());
    start(w, "directory_structure", &[])?;
    start(w, "tree", &[])?;
    for node in &tree {
        write_tree_node(w, node)?;
    }
    end(w, "tree")?;
    text_element(w, "ascii_tree", &render_ascii_tree(&header.project_name, &tree))?;
    end(w, "directory_structure")?;

    start(w, "documents", &[])?;
    for (i, file) in files.iter().enumerate() {
        write_document(w, i + 1, file)?;
    }
    end(w, "documents")?;
    end(w, "bundle")?;

    String::from_utf8(writer.into_inner()).map_err(|e| AppError::XmlSerialize(e.to_string()))
}

fn write_metadata(w: &mut Writer<Vec<u8>>, header: &BundleHeader, files: &[DocumentFile<'_>]) -> Result<()> {
    let total_size: u64 = files.iter().map(|f| f.record.size).sum();
    start(w, "bundle_metadata", &[])?;
    text_element(w, "project_name", &header.project_name)?;
    text_element(w, "bundle_id", &header.id)?;
    text_element(w, "bundle_type", header.bundle_type.as_str())?;
    if let Some(tag) = &header.derived_from_tag {
        text_element(w, "derived_from_tag", tag)?;
    }
    if let Some(description) = &header.description {
        text_element(w, "description", description)?;
    }
    text_element(w, "created", &format_timestamp(&header.created))?;
    text_element(w, "file_count", &files.len().to_string())?;
    text_element(w, "total_size", &readable_size(total_size))?;
    if let Some(tokens) = header.token_estimate {
        text_element(w, "token_estimate", &tokens.to_string())?;
    }
    start(w, "ignore_patterns", &[])?;
    for pattern in &header.ignore_patterns {
        text_element(w, "pattern", pattern)?;
    }
    end(w, "ignore_patterns")?;
    end(w, "bundle_metadata")
}

fn write_tree_node(w: &mut Writer<Vec<u8>>, node: &TreeNode) -> Result<()> {
    match node.kind {
        NodeKind::File => emit(
            w,
            Event::Empty(BytesStart::new("file").with_attributes([("name", node.name.as_str())])),
        ),
        NodeKind::Directory => {
            start(w, "directory", &[("name", node.name.as_str())])?;
            for child in &node.children {
                write_tree_node(w, child)?;
            }
            end(w, "directory")
        }
    }
}

fn write_document(w: &mut Writer<Vec<u8>>, index: usize, file: &DocumentFile<'_>) -> Result<()> {
    let record = file.record;
    let index = index.to_string();
    let mut attrs = vec![("index", index.as_str())];
    if record.binary {
        attrs.push(("binary", "true"));
    }
    start(w, DOCUMENT_ELEMENT, &attrs)?;
    text_element(w, "source", &record.path)?;
    text_element(w, "tags", &file.tags.join(","))?;

    let size = record.size.to_string();
    let size_readable = readable_size(record.size);
    let modified = format_timestamp(&record.last_modified);
    emit(
        w,
        Event::Empty(BytesStart::new("metadata").with_attributes([
            ("size", size.as_str()),
            ("size_readable", size_readable.as_str()),
            ("last_modified", modified.as_str()),
            ("extension", record.extension()),
            ("directory", record.directory.as_str()),
        ])),
    )?;

    start(w, "document_content", &[])?;
    if !record.content.is_empty() {
        emit(
            w,
            Event::Text(BytesText::from_escaped(partial_escape(&record.content))),
        )?;
    }
    end(w, "document_content")?;
    end(w, DOCUMENT_ELEMENT)
}

fn ai_readme(header: &BundleHeader, has_documents: bool) -> String {
    let text = get_bundle_readme_text();
    let mut parts: Vec<&str> = vec![&text.intro, &text.key_sections_header, &text.metadata_desc];
    if header.derived_from_tag.is_some() {
        parts.push(&text.tag_desc);
    }
    parts.push(&text.tree_desc);
    parts.push(if has_documents {
        &text.documents_desc
    } else {
        &text.empty_desc
    });
    parts.join("\n")
}

fn emit(w: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    w.write_event(event)
        .map_err(|e| AppError::XmlSerialize(e.to_string()))
}

fn start(w: &mut Writer<Vec<u8>>, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
    emit(
        w,
        Event::Start(BytesStart::new(name).with_attributes(attrs.iter().copied())),
    )
}

fn end(w: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    emit(w, Event::End(BytesEnd::new(name)))
}

fn text_element(w: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    start(w, name, &[])?;
    if !text.is_empty() {
        emit(w, Event::Text(BytesText::new(text)))?;
    }
    end(w, name)
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn readable_size(bytes: u64) -> String {
    Byte::from_u64(bytes)
        .get_appropriate_unit(UnitType::Binary)
        .to_string()
}

/// Estimated cl100k token count for the given texts.
#[cfg(feature = "token_estimate")]
pub fn estimate_tokens<'a>(texts: impl Iterator<Item = &'a str>) -> Result<Option<usize>> {
    let bpe = tiktoken_rs::cl100k_base().map_err(|e| AppError::TikToken(e.to_string()))?;
    Ok(Some(texts.map(|t| bpe.encode_ordinary(t).len()).sum()))
}

#[cfg(not(feature = "token_estimate"))]
pub fn estimate_tokens<'a>(_texts: impl Iterator<Item = &'a str>) -> Result<Option<usize>> {
    log::debug!("Token estimation requested but the token_estimate feature is disabled.");
    Ok(None)
}

/// What the registry needs from a bundle document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBundle {
    pub document_count: usize,
    pub project_name: Option<String>,
    pub bundle_type: Option<String>,
    pub derived_from_tag: Option<String>,
    pub description: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Counts `<document>` elements and reads the metadata header. Any XML
/// syntax error fails the whole parse.
pub fn parse_bundle_document(content: &str) -> Result<ParsedBundle> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut parsed = ParsedBundle::default();
    let mut in_metadata = false;
    let mut current: Option<String> = None;
    let mut saw_root = false;
    let mut depth = 0usize;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| AppError::XmlSerialize(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(e) => {
                saw_root = true;
                depth += 1;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    DOCUMENT_ELEMENT => parsed.document_count += 1,
                    "bundle_metadata" => in_metadata = true,
                    _ => {}
                }
                current = Some(name);
            }
            Event::Empty(e) => {
                saw_root = true;
                if e.name().as_ref() == DOCUMENT_ELEMENT.as_bytes() {
                    parsed.document_count += 1;
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                if e.name().as_ref() == b"bundle_metadata" {
                    in_metadata = false;
                }
                current = None;
            }
            Event::Text(t) if in_metadata => {
                let value = t
                    .unescape()
                    .map_err(|e| AppError::XmlSerialize(e.to_string()))?
                    .into_owned();
                match current.as_deref() {
                    Some("project_name") => parsed.project_name = Some(value),
                    Some("bundle_type") => parsed.bundle_type = Some(value),
                    Some("derived_from_tag") => parsed.derived_from_tag = Some(value),
                    Some("description") => parsed.description = Some(value),
                    Some("created") => {
                        parsed.created = DateTime::parse_from_rfc3339(&value)
                            .map(|dt| dt.with_timezone(&Utc))
                            .ok();
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(AppError::XmlSerialize(format!(
            "bundle document ends with {} unclosed element(s)",
            depth
        )));
    }
    if !saw_root {
        return Err(AppError::XmlSerialize(
            "bundle document has no elements".to_string(),
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BundleHeader {
        BundleHeader {
            id: "tag-core-1".to_string(),
            project_name: "demo".to_string(),
            bundle_type: BundleType::TagDerived,
            derived_from_tag: Some("core".to_string()),
            description: Some("Files tagged with \"core\"".to_string()),
            created: Utc::now(),
            token_estimate: None,
            ignore_patterns: vec!["*.md".to_string()],
        }
    }

    #[test]
    fn document_escapes_content_and_parses_back() {
        let record = FileRecord::new(
            "src/a.ts",
            Utc::now(),
            30,
            "if (a < b && c) { x = \"</document>\"; }".to_string(),
        );
        let tags = vec!["core".to_string(), "api".to_string()];
        let files = [DocumentFile {
            record: &record,
            tags: &tags,
        }];
        let options = RenderOptions {
            include_ai_readme: true,
            indent: 2,
        };
        let xml = render_bundle_document(&header(), &files, &options).unwrap();

        assert!(xml.contains("&lt;/document&gt;"));
        assert!(xml.contains("<tags>core,api</tags>"));
        assert!(xml.contains("<source>src/a.ts</source>"));
        assert!(xml.contains("extension=\"ts\""));
        assert!(xml.contains("└── a.ts"));

        let parsed = parse_bundle_document(&xml).unwrap();
        assert_eq!(parsed.document_count, 1);
        assert_eq!(parsed.bundle_type.as_deref(), Some("tag-derived"));
        assert_eq!(parsed.derived_from_tag.as_deref(), Some("core"));
        assert_eq!(parsed.description.as_deref(), Some("Files tagged with \"core\""));
        assert_eq!(parsed.project_name.as_deref(), Some("demo"));
        assert!(parsed.created.is_some());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_bundle_document("").is_err());
        assert!(parse_bundle_document("<bundle><documents></bundle>").is_err());
        assert!(parse_bundle_document("<bundle><documents>").is_err());
    }

    #[test]
    fn readable_sizes() {
        assert!(readable_size(0).starts_with('0'));
        assert!(readable_size(2048).starts_with("2"));
    }
}
