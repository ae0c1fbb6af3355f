//! The OPC container behind a DOCX file: zip parts, relationships and
//! content types.

use super::xml::attr;
use super::DocxError;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
pub const PACKAGE_RELS_PART: &str = "_rels/.rels";

pub const REL_OFFICE_DOCUMENT: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
pub const REL_IMAGE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
pub const REL_STYLES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles";
pub const REL_NUMBERING: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/numbering";
pub const REL_FOOTNOTES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/footnotes";
pub const REL_ENDNOTES: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/endnotes";

pub const CT_MAIN_DOCUMENT: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml";
pub const CT_STYLES: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml";
pub const CT_NUMBERING: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.numbering+xml";
pub const CT_FOOTNOTES: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.footnotes+xml";
pub const CT_ENDNOTES: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.endnotes+xml";
pub const CT_RELATIONSHIPS: &str = "application/vnd.openxmlformats-package.relationships+xml";

const NS_RELATIONSHIPS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const NS_CONTENT_TYPES: &str = "http://schemas.openxmlformats.org/package/2006/content-types";
const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

fn zip_error(err: zip::result::ZipError) -> DocxError {
    DocxError(format!("zip error: {err}"))
}

/// All parts of a package, in archive order.
#[derive(Debug, Clone, Default)]
pub struct Package {
    parts: Vec<(String, Vec<u8>)>,
}

impl Package {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocxError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(zip_error)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| DocxError(format!("cannot read part '{name}': {e}")))?;
            parts.push((name, data));
        }
        if !parts.iter().any(|(n, _)| n == CONTENT_TYPES_PART) {
            return Err(DocxError(format!(
                "not an Office package: '{CONTENT_TYPES_PART}' is missing"
            )));
        }
        Ok(Self { parts })
    }

    /// Write the package as a zip archive, content types first.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocxError> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let ordered = self
            .parts
            .iter()
            .filter(|(n, _)| n == CONTENT_TYPES_PART)
            .chain(self.parts.iter().filter(|(n, _)| n != CONTENT_TYPES_PART));
        for (name, data) in ordered {
            writer.start_file(name.as_str(), options).map_err(zip_error)?;
            writer
                .write_all(data)
                .map_err(|e| DocxError(format!("cannot write part '{name}': {e}")))?;
        }
        let cursor = writer.finish().map_err(zip_error)?;
        Ok(cursor.into_inner())
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    /// Part content as UTF-8 text.
    pub fn part_str(&self, name: &str) -> Result<Option<String>, DocxError> {
        match self.part(name) {
            None => Ok(None),
            Some(data) => String::from_utf8(data.to_vec())
                .map(Some)
                .map_err(|_| DocxError(format!("part '{name}' is not valid UTF-8"))),
        }
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.part(name).is_some()
    }

    /// Insert or replace a part.
    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        match self.parts.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = data,
            None => self.parts.push((name.to_string(), data)),
        }
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(n, _)| n.as_str())
    }

    /// First free name of the form `<stem><n>.<ext>`, counting from 1.
    pub fn unique_part_name(&self, stem: &str, ext: &str) -> String {
        (1u32..)
            .map(|n| format!("{stem}{n}.{ext}"))
            .find(|name| !self.has_part(name))
            .unwrap_or_else(|| format!("{stem}.{ext}"))
    }

    pub fn relationships(&self, part: &str) -> Result<Relationships, DocxError> {
        let path = rels_path_for(part);
        match self.part_str(&path)? {
            Some(xml) => Relationships::parse(&xml),
            None => Ok(Relationships::default()),
        }
    }

    pub fn set_relationships(&mut self, part: &str, rels: &Relationships) {
        self.set_part(&rels_path_for(part), rels.to_xml().into_bytes());
    }

    pub fn content_types(&self) -> Result<ContentTypes, DocxError> {
        let xml = self
            .part_str(CONTENT_TYPES_PART)?
            .ok_or_else(|| DocxError(format!("'{CONTENT_TYPES_PART}' is missing")))?;
        ContentTypes::parse(&xml)
    }

    pub fn set_content_types(&mut self, types: &ContentTypes) {
        self.set_part(CONTENT_TYPES_PART, types.to_xml().into_bytes());
    }

    /// Name of the main document part, from the package relationships.
    pub fn main_document_part(&self) -> Result<String, DocxError> {
        let rels = self.relationships("")?;
        Ok(rels
            .find_by_type(REL_OFFICE_DOCUMENT)
            .map(|r| resolve_target("", &r.target))
            .unwrap_or_else(|| "word/document.xml".to_string()))
    }
}

/// Relationship part that belongs to `part` (`""` for the package itself).
pub fn rels_path_for(part: &str) -> String {
    if part.is_empty() {
        return PACKAGE_RELS_PART.to_string();
    }
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn part_dir(part: &str) -> &str {
    part.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
}

/// Resolve a relationship target of `source_part` to a part name.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut segments: Vec<&str> = part_dir(source_part)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Target of a relationship from `source_part` to `target_part`.
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    let dir = part_dir(source_part);
    if dir.is_empty() {
        return target_part.to_string();
    }
    match target_part.strip_prefix(dir).and_then(|r| r.strip_prefix('/')) {
        Some(rest) => rest.to_string(),
        None => format!("/{target_part}"),
    }
}

/// One `<Relationship>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

/// A parsed `.rels` part.
#[derive(Debug, Clone, Default)]
pub struct Relationships {
    entries: Vec<Relationship>,
}

impl Relationships {
    pub fn parse(xml: &str) -> Result<Self, DocxError> {
        let mut reader = Reader::from_str(xml);
        let mut entries = Vec::new();
        loop {
            let pos = reader.buffer_position();
            match reader.read_event() {
                Ok(Event::Empty(e)) | Ok(Event::Start(e))
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    let mut rel = Relationship {
                        id: String::new(),
                        rel_type: String::new(),
                        target: String::new(),
                        external: false,
                    };
                    for a in e.attributes().flatten() {
                        let value = a
                            .unescape_value()
                            .map(|v| v.into_owned())
                            .unwrap_or_default();
                        match a.key.as_ref() {
                            b"Id" => rel.id = value,
                            b"Type" => rel.rel_type = value,
                            b"Target" => rel.target = value,
                            b"TargetMode" => rel.external = value == "External",
                            _ => {}
                        }
                    }
                    entries.push(rel);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(DocxError(format!("bad relationships at byte {pos}: {e}"))),
                _ => {}
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, id: &str) -> Option<&Relationship> {
        self.entries.iter().find(|r| r.id == id)
    }

    pub fn find_by_type(&self, rel_type: &str) -> Option<&Relationship> {
        self.entries.iter().find(|r| r.rel_type == rel_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relationship> {
        self.entries.iter()
    }

    /// Add a relationship under a fresh `rIdN` id and return that id.
    pub fn add(&mut self, rel_type: &str, target: &str, external: bool) -> String {
        let next = self
            .entries
            .iter()
            .filter_map(|r| r.id.strip_prefix("rId").and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0)
            + 1;
        let id = format!("rId{next}");
        self.entries.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
            external,
        });
        id
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!("{XML_DECL}<Relationships xmlns=\"{NS_RELATIONSHIPS}\">");
        for r in &self.entries {
            out.push_str(&format!(
                r#"<Relationship Id="{}" Type="{}" Target="{}""#,
                escape(r.id.as_str()),
                escape(r.rel_type.as_str()),
                escape(r.target.as_str())
            ));
            if r.external {
                out.push_str(r#" TargetMode="External""#);
            }
            out.push_str("/>");
        }
        out.push_str("</Relationships>");
        out
    }
}

/// A parsed `[Content_Types].xml`.
#[derive(Debug, Clone, Default)]
pub struct ContentTypes {
    defaults: Vec<(String, String)>,
    overrides: Vec<(String, String)>,
}

impl ContentTypes {
    pub fn parse(xml: &str) -> Result<Self, DocxError> {
        let mut reader = Reader::from_str(xml);
        let mut types = Self::default();
        loop {
            let pos = reader.buffer_position();
            let after_event = reader.read_event();
            let after = reader.buffer_position();
            match after_event {
                Ok(Event::Empty(e)) | Ok(Event::Start(e)) => {
                    let tag = &xml[xml[..after].rfind('<').unwrap_or(0)..after];
                    let content_type = attr(tag, "ContentType").unwrap_or_default();
                    match e.local_name().as_ref() {
                        b"Default" => {
                            if let Some(ext) = attr(tag, "Extension") {
                                types.defaults.push((ext.to_ascii_lowercase(), content_type));
                            }
                        }
                        b"Override" => {
                            if let Some(part) = attr(tag, "PartName") {
                                let part = part.trim_start_matches('/').to_string();
                                types.overrides.push((part, content_type));
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(DocxError(format!("bad content types at byte {pos}: {e}"))),
                _ => {}
            }
        }
        Ok(types)
    }

    pub fn has_default(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.defaults.iter().any(|(e, _)| *e == ext)
    }

    pub fn default_for(&self, ext: &str) -> Option<&str> {
        let ext = ext.to_ascii_lowercase();
        self.defaults
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, ct)| ct.as_str())
    }

    pub fn override_for(&self, part: &str) -> Option<&str> {
        let part = part.trim_start_matches('/');
        self.overrides
            .iter()
            .find(|(p, _)| p == part)
            .map(|(_, ct)| ct.as_str())
    }

    pub fn ensure_default(&mut self, ext: &str, content_type: &str) {
        if !self.has_default(ext) {
            self.defaults
                .push((ext.to_ascii_lowercase(), content_type.to_string()));
        }
    }

    pub fn ensure_override(&mut self, part: &str, content_type: &str) {
        let part = part.trim_start_matches('/');
        if !self.overrides.iter().any(|(p, _)| p == part) {
            self.overrides.push((part.to_string(), content_type.to_string()));
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = format!("{XML_DECL}<Types xmlns=\"{NS_CONTENT_TYPES}\">");
        for (ext, ct) in &self.defaults {
            out.push_str(&format!(
                r#"<Default Extension="{}" ContentType="{}"/>"#,
                escape(ext.as_str()),
                escape(ct.as_str())
            ));
        }
        for (part, ct) in &self.overrides {
            out.push_str(&format!(
                r#"<Override PartName="/{}" ContentType="{}"/>"#,
                escape(part.as_str()),
                escape(ct.as_str())
            ));
        }
        out.push_str("</Types>");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELS: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
        r#"<Relationship Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/?a=1&amp;b=2" TargetMode="External"/>"#,
        r#"</Relationships>"#,
    );

    #[test]
    fn relationships_parse_and_add() {
        let mut rels = Relationships::parse(RELS).unwrap();
        assert_eq!(rels.get("rId1").unwrap().target, "styles.xml");
        let link = rels.get("rId7").unwrap();
        assert!(link.external);
        assert_eq!(link.target, "https://example.com/?a=1&b=2");

        let id = rels.add(REL_IMAGE, "media/image1.png", false);
        assert_eq!(id, "rId8");
        let xml = rels.to_xml();
        assert!(xml.contains(r#"Target="https://example.com/?a=1&amp;b=2" TargetMode="External""#));
        assert!(xml.contains(r#"Id="rId8""#));
        assert_eq!(Relationships::parse(&xml).unwrap().iter().count(), 3);
    }

    #[test]
    fn content_types_ensure_is_idempotent() {
        let xml = r#"<Types xmlns="x"><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="main"/></Types>"#;
        let mut ct = ContentTypes::parse(xml).unwrap();
        ct.ensure_default("PNG", "image/png");
        ct.ensure_default("png", "image/png");
        ct.ensure_override("/word/document.xml", "main");
        ct.ensure_override("word/numbering.xml", CT_NUMBERING);
        let out = ct.to_xml();
        assert_eq!(out.matches("Extension=\"png\"").count(), 1);
        assert_eq!(out.matches("/word/document.xml").count(), 1);
        assert!(out.contains(r#"PartName="/word/numbering.xml""#));
    }

    #[test]
    fn target_resolution() {
        assert_eq!(rels_path_for("word/document.xml"), "word/_rels/document.xml.rels");
        assert_eq!(rels_path_for(""), "_rels/.rels");
        assert_eq!(resolve_target("word/document.xml", "media/a.png"), "word/media/a.png");
        assert_eq!(resolve_target("word/document.xml", "../customXml/i.xml"), "customXml/i.xml");
        assert_eq!(resolve_target("", "word/document.xml"), "word/document.xml");
        assert_eq!(resolve_target("word/document.xml", "/word/x.xml"), "word/x.xml");
        assert_eq!(relative_target("word/document.xml", "word/media/b.png"), "media/b.png");
        assert_eq!(relative_target("word/document.xml", "other/b.png"), "/other/b.png");
    }

    #[test]
    fn package_round_trip_puts_content_types_first() {
        let mut pkg = Package::default();
        pkg.set_part("word/document.xml", b"<w:document/>".to_vec());
        pkg.set_part(CONTENT_TYPES_PART, b"<Types/>".to_vec());
        let bytes = pkg.to_bytes().unwrap();

        let mut archive = ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        assert_eq!(archive.by_index(0).unwrap().name(), CONTENT_TYPES_PART);
        let back = Package::from_bytes(&bytes).unwrap();
        assert_eq!(back.part("word/document.xml"), Some(&b"<w:document/>"[..]));
        assert_eq!(back.unique_part_name("word/media/image", "png"), "word/media/image1.png");
    }

    #[test]
    fn non_office_zip_is_rejected() {
        let mut pkg = Package::default();
        pkg.set_part("readme.txt", b"hi".to_vec());
        let bytes = pkg.to_bytes().unwrap();
        assert!(Package::from_bytes(&bytes).is_err());
        assert!(Package::from_bytes(b"not a zip").is_err());
    }
}
