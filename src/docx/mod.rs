//! Minimal WordprocessingML document model.
//!
//! A [`WordDocument`] keeps every package part untouched except the main
//! document, whose `w:body` is held as a list of top-level [`Block`]s
//! (paragraphs, tables, anything else) plus the trailing section properties.
//! Rendering and splicing operate on that list; everything outside it is
//! written back byte-for-byte.

pub(crate) mod merge;
pub mod package;
pub mod picture;
pub mod runs;
pub mod xml;

use crate::error::DossierError;
use once_cell::sync::Lazy;
use package::{
    relative_target, ContentTypes, Package, Relationships, CONTENT_TYPES_PART, CT_MAIN_DOCUMENT,
    CT_RELATIONSHIPS, PACKAGE_RELS_PART, REL_IMAGE, REL_OFFICE_DOCUMENT,
};
use picture::InlineImage;
use regex::Regex;
use std::path::Path;
use xml::{find_element, split_element, Piece};

/// Low-level DOCX failure: malformed XML, a broken zip or a missing part.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DocxError(pub String);

impl From<DocxError> for DossierError {
    fn from(err: DocxError) -> Self {
        DossierError::Generation(err.0)
    }
}

pub const NS_W: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
pub const NS_R: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

static RE_DOC_PR_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<wp:docPr\b[^>]*?\bid="(\d+)""#).unwrap());

/// Kind of a top-level body block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Table,
    Other,
}

/// One top-level child of `w:body`, as raw XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    xml: String,
}

impl Block {
    pub fn new(xml: impl Into<String>) -> Self {
        Self { xml: xml.into() }
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    pub fn kind(&self) -> BlockKind {
        match xml::tag_name(&self.xml) {
            "w:p" => BlockKind::Paragraph,
            "w:tbl" => BlockKind::Table,
            _ => BlockKind::Other,
        }
    }

    /// Visible text of the block; empty when the XML cannot be read.
    pub fn text(&self) -> String {
        runs::fragment_text(&self.xml).unwrap_or_default()
    }

    /// A paragraph with a single plain-text run.
    pub fn paragraph(text: &str) -> Self {
        Self::new(format!(
            r#"<w:p><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
            quick_xml::escape::escape(text)
        ))
    }
}

/// An in-memory DOCX document.
#[derive(Debug, Clone)]
pub struct WordDocument {
    package: Package,
    main_part: String,
    /// Main part markup up to and including the `<w:body>` start tag.
    head: String,
    blocks: Vec<Block>,
    /// Section properties, `</w:body>` and the rest of the main part.
    tail: String,
    next_drawing_id: u32,
}

impl WordDocument {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocxError> {
        let package = Package::from_bytes(bytes)?;
        let main_part = package.main_document_part()?;
        let xml = package
            .part_str(&main_part)?
            .ok_or_else(|| DocxError(format!("main document part '{main_part}' is missing")))?;

        let body = find_element(&xml, "w:body")?
            .ok_or_else(|| DocxError("document has no <w:body>".into()))?;
        let element = split_element(&xml[body.clone()])?;

        let (head, blocks, tail) = if element.is_empty_tag() {
            (
                format!("{}<w:body>", &xml[..body.start]),
                Vec::new(),
                format!("</w:body>{}", &xml[body.end..]),
            )
        } else {
            let pieces = &element.pieces;
            // The body's own section properties are its last child.
            let sect_idx = pieces
                .iter()
                .rposition(|p| matches!(p, Piece::Child { .. }))
                .filter(|&i| matches!(pieces[i], Piece::Child { name: "w:sectPr", .. }))
                .unwrap_or(pieces.len());

            let mut blocks = Vec::new();
            for piece in &pieces[..sect_idx] {
                match piece {
                    Piece::Child { xml, .. } => blocks.push(Block::new(*xml)),
                    Piece::Between(text) if !text.trim().is_empty() => {
                        blocks.push(Block::new(*text))
                    }
                    Piece::Between(_) => {}
                }
            }
            let mut tail = String::new();
            for piece in &pieces[sect_idx..] {
                match piece {
                    Piece::Child { xml, .. } => tail.push_str(xml),
                    Piece::Between(text) => tail.push_str(text),
                }
            }
            tail.push_str(element.close);
            tail.push_str(&xml[body.end..]);
            (
                format!("{}{}", &xml[..body.start], element.open),
                blocks,
                tail,
            )
        };

        let next_drawing_id = RE_DOC_PR_ID
            .captures_iter(&xml)
            .filter_map(|c| c[1].parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            package,
            main_part,
            head,
            blocks,
            tail,
            next_drawing_id,
        })
    }

    pub fn open(path: &Path) -> Result<Self, DocxError> {
        let bytes = std::fs::read(path)
            .map_err(|e| DocxError(format!("cannot read '{}': {e}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    /// An empty document with the minimal set of parts Word accepts.
    pub fn blank() -> Self {
        let mut package = Package::default();
        let mut types = ContentTypes::default();
        types.ensure_default("rels", CT_RELATIONSHIPS);
        types.ensure_default("xml", "application/xml");
        types.ensure_override("word/document.xml", CT_MAIN_DOCUMENT);
        package.set_part(CONTENT_TYPES_PART, types.to_xml().into_bytes());

        let mut rels = Relationships::default();
        rels.add(REL_OFFICE_DOCUMENT, "word/document.xml", false);
        package.set_part(PACKAGE_RELS_PART, rels.to_xml().into_bytes());

        let head = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="{NS_W}" xmlns:r="{NS_R}"><w:body>"#
        );
        let tail = "</w:body></w:document>".to_string();
        let mut doc = Self {
            package,
            main_part: "word/document.xml".to_string(),
            head,
            blocks: Vec::new(),
            tail,
            next_drawing_id: 1,
        };
        doc.store_main_part();
        doc
    }

    /// Serialize the document, including any edited blocks, to DOCX bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocxError> {
        let mut package = self.package.clone();
        package.set_part(&self.main_part, self.main_xml().into_bytes());
        package.to_bytes()
    }

    fn main_xml(&self) -> String {
        let mut out = String::with_capacity(
            self.head.len() + self.tail.len() + self.blocks.iter().map(|b| b.xml.len()).sum::<usize>(),
        );
        out.push_str(&self.head);
        for block in &self.blocks {
            out.push_str(&block.xml);
        }
        out.push_str(&self.tail);
        out
    }

    fn store_main_part(&mut self) {
        let xml = self.main_xml();
        self.package.set_part(&self.main_part, xml.into_bytes());
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn take_blocks(&mut self) -> Vec<Block> {
        std::mem::take(&mut self.blocks)
    }

    pub fn set_blocks(&mut self, blocks: Vec<Block>) {
        self.blocks = blocks;
    }

    pub fn push_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn push_paragraph(&mut self, text: &str) {
        self.blocks.push(Block::paragraph(text));
    }

    /// Insert `blocks` right after the block at `index`, in order.
    pub fn insert_blocks_after(&mut self, index: usize, blocks: Vec<Block>) {
        let at = (index + 1).min(self.blocks.len());
        self.blocks.splice(at..at, blocks);
    }

    pub fn replace_block(&mut self, index: usize, block: Block) {
        if let Some(slot) = self.blocks.get_mut(index) {
            *slot = block;
        }
    }

    /// Index of the first top-level paragraph whose text contains `needle`.
    pub fn find_paragraph_containing(&self, needle: &str) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.kind() == BlockKind::Paragraph && b.text().contains(needle))
    }

    /// Concatenated text of every top-level block, one line per block.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(Block::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub(crate) fn package_mut(&mut self) -> &mut Package {
        &mut self.package
    }

    pub fn main_part(&self) -> &str {
        &self.main_part
    }

    pub(crate) fn next_drawing_id(&mut self) -> u32 {
        let id = self.next_drawing_id;
        self.next_drawing_id += 1;
        id
    }

    /// Store `image` as a media part referenced from the main document.
    /// Returns the relationship id and the media file name.
    pub fn add_image_part(&mut self, image: &InlineImage) -> Result<(String, String), DocxError> {
        let ext = image.extension();
        let media = self.package.unique_part_name("word/media/image", ext);
        self.package.set_part(&media, image.bytes.clone());

        let mut rels = self.package.relationships(&self.main_part)?;
        let rel_id = rels.add(REL_IMAGE, &relative_target(&self.main_part, &media), false);
        self.package.set_relationships(&self.main_part, &rels);

        let mut types = self.package.content_types()?;
        types.ensure_default(ext, image.content_type());
        self.package.set_content_types(&types);

        let name = media.rsplit('/').next().unwrap_or(&media).to_string();
        Ok((rel_id, name))
    }

    /// Add `image` to the package and return an inline-picture run
    /// `width_emu` wide.
    pub fn add_image(&mut self, image: &InlineImage, width_emu: u64) -> Result<String, DocxError> {
        let (rel_id, name) = self.add_image_part(image)?;
        let id = self.next_drawing_id();
        let (cx, cy) = image.extent_for_width(width_emu);
        Ok(picture::drawing_run(&rel_id, id, cx, cy, &name))
    }

    /// A paragraph holding only `image`.
    pub fn image_paragraph(&mut self, image: &InlineImage, width_emu: u64) -> Result<Block, DocxError> {
        let run = self.add_image(image, width_emu)?;
        Ok(Block::new(format!("<w:p>{run}</w:p>")))
    }
}
