//! Importing the body of one document into another.
//!
//! Body markup refers to package-level resources by id: pictures and links
//! through `r:*` relationship attributes, list formatting through
//! `w:numId`, paragraph and run styles through `w:styleId`, notes through
//! `w:footnoteReference`/`w:endnoteReference`. Drawings carry a
//! document-wide `wp:docPr` id. Moving blocks between packages therefore
//! means copying those resources and rewriting the ids so they cannot
//! collide with the target's own.

use super::package::{
    relative_target, resolve_target, Package, CT_ENDNOTES, CT_FOOTNOTES, CT_NUMBERING, CT_STYLES,
    REL_ENDNOTES, REL_FOOTNOTES, REL_NUMBERING, REL_STYLES,
};
use super::xml::{attr, find_element, set_attr, split_element, Element, Piece};
use super::{Block, DocxError, WordDocument};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

static RE_REL_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\b(r:[A-Za-z]+)="([^"]*)""#).unwrap());
static RE_STYLE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<w:style\b[^>]*?\bw:styleId="([^"]*)""#).unwrap());
static RE_NUM_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<w:numId\b[^>]*?\bw:val=")(\d+)(")"#).unwrap());
static RE_ABSTRACT_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(<w:abstractNumId\b[^>]*?\bw:val=")(\d+)(")"#).unwrap());
static RE_NSID: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<w:nsid\b[^>]*/>"#).unwrap());
static RE_PIC_BULLET_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<w:lvlPicBulletId\b[^>]*/>"#).unwrap());
static RE_DRAWING_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(<(wp:docPr|pic:cNvPr)\b[^>]*?\bid=")(\d+)(")"#).unwrap()
});
static RE_NOTE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<w:(footnote|endnote)Reference\b[^>]*/>"#).unwrap());

/// Footnotes or endnotes: the two note stories share one layout.
struct NoteKind {
    /// `footnote` or `endnote`, as used in element names.
    tag: &'static str,
    file_name: &'static str,
    rel_type: &'static str,
    content_type: &'static str,
}

const FOOTNOTES: NoteKind = NoteKind {
    tag: "footnote",
    file_name: "footnotes.xml",
    rel_type: REL_FOOTNOTES,
    content_type: CT_FOOTNOTES,
};

const ENDNOTES: NoteKind = NoteKind {
    tag: "endnote",
    file_name: "endnotes.xml",
    rel_type: REL_ENDNOTES,
    content_type: CT_ENDNOTES,
};

/// Copy the body of `source` into `target`'s package and return the blocks,
/// rewritten to reference `target`'s resources. The blocks are not inserted;
/// the caller decides where they go.
///
/// Section properties of `source` are dropped so the target keeps its page
/// layout.
pub(crate) fn import_body(
    target: &mut WordDocument,
    source: &WordDocument,
) -> Result<Vec<Block>, DocxError> {
    let mut xmls = source
        .blocks()
        .iter()
        .map(|b| strip_section_breaks(b.xml()))
        .collect::<Result<Vec<_>, _>>()?;

    let target_main = target.main_part().to_string();
    remap_relationships(target, &target_main, source, source.main_part(), &mut xmls)?;
    renumber_drawings(target, &mut xmls);

    let num_map = merge_numbering(target, source, &xmls)?;
    if !num_map.is_empty() {
        for xml in xmls.iter_mut() {
            *xml = rewrite_num_ids(xml, &num_map);
        }
    }
    merge_notes(target, source, &mut xmls, &FOOTNOTES, &num_map)?;
    merge_notes(target, source, &mut xmls, &ENDNOTES, &num_map)?;
    merge_styles(target, source, &num_map)?;

    Ok(xmls.into_iter().map(Block::new).collect())
}

fn strip_section_breaks(xml: &str) -> Result<String, DocxError> {
    let mut out = xml.to_string();
    while let Some(range) = find_element(&out, "w:sectPr")? {
        out.replace_range(range, "");
    }
    Ok(out)
}

/// Name for a copy of `part` that is free in `package`
/// (`word/media/image3.png` → `word/media/imageN.png`).
fn copy_name(package: &Package, part: &str) -> String {
    let (stem, ext) = match part.rsplit_once('.') {
        Some((stem, ext)) if !stem.ends_with('/') && !ext.contains('/') => (stem, ext),
        _ => (part, "bin"),
    };
    let stem = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    package.unique_part_name(stem, ext)
}

/// Copy what the `r:*` attributes in `xmls` point at from `source_part`'s
/// relationships to `target_part`'s, rewriting the ids in place.
fn remap_relationships(
    target: &mut WordDocument,
    target_part: &str,
    source: &WordDocument,
    source_part: &str,
    xmls: &mut [String],
) -> Result<(), DocxError> {
    let mut ids: Vec<String> = Vec::new();
    for xml in xmls.iter() {
        for caps in RE_REL_ATTR.captures_iter(xml) {
            if !ids.iter().any(|id| id == &caps[2]) {
                ids.push(caps[2].to_string());
            }
        }
    }
    if ids.is_empty() {
        return Ok(());
    }

    let source_rels = source.package().relationships(source_part)?;
    let source_types = source.package().content_types()?;
    let mut target_rels = target.package().relationships(target_part)?;
    let mut target_types = target.package().content_types()?;

    let mut map: HashMap<String, String> = HashMap::new();
    for id in ids {
        let Some(rel) = source_rels.get(&id) else {
            continue;
        };
        let new_id = if rel.external {
            target_rels.add(&rel.rel_type, &rel.target, true)
        } else {
            let part = resolve_target(source_part, &rel.target);
            let Some(data) = source.package().part(&part) else {
                debug!("Relationship {} points at missing part '{}'", id, part);
                continue;
            };
            let new_part = copy_name(target.package(), &part);
            target.package_mut().set_part(&new_part, data.to_vec());
            if let Some(ct) = source_types.override_for(&part) {
                target_types.ensure_override(&new_part, ct);
            } else if let Some(ext) = new_part.rsplit_once('.').map(|(_, e)| e) {
                if let Some(ct) = source_types.default_for(ext) {
                    target_types.ensure_default(ext, ct);
                }
            }
            target_rels.add(&rel.rel_type, &relative_target(target_part, &new_part), false)
        };
        map.insert(id, new_id);
    }
    debug!("Remapped {} relationship(s)", map.len());

    target.package_mut().set_relationships(target_part, &target_rels);
    target.package_mut().set_content_types(&target_types);

    for xml in xmls.iter_mut() {
        *xml = RE_REL_ATTR
            .replace_all(xml, |c: &Captures| match map.get(&c[2]) {
                Some(new_id) => format!("{}=\"{}\"", &c[1], new_id),
                None => c[0].to_string(),
            })
            .into_owned();
    }
    Ok(())
}

/// Give every imported drawing a `wp:docPr` id from `target`'s sequence.
///
/// The `pic:cNvPr` inside a drawing takes the id of the `wp:docPr` before it.
fn renumber_drawings(target: &mut WordDocument, xmls: &mut [String]) {
    let mut count = 0usize;
    for xml in xmls.iter_mut() {
        if !RE_DRAWING_ID.is_match(xml) {
            continue;
        }
        let mut current: Option<u32> = None;
        *xml = RE_DRAWING_ID
            .replace_all(xml, |c: &Captures| {
                let id = match (&c[2], current.take()) {
                    ("pic:cNvPr", Some(id)) => id,
                    _ => {
                        count += 1;
                        target.next_drawing_id()
                    }
                };
                if &c[2] == "wp:docPr" {
                    current = Some(id);
                }
                format!("{}{}{}", &c[1], id, &c[4])
            })
            .into_owned();
    }
    if count > 0 {
        debug!("Renumbered {} drawing(s)", count);
    }
}

/// The part `doc`'s main document relates to with `rel_type`, and its text.
fn related_part(doc: &WordDocument, rel_type: &str) -> Result<Option<(String, String)>, DocxError> {
    let rels = doc.package().relationships(doc.main_part())?;
    let Some(rel) = rels.find_by_type(rel_type) else {
        return Ok(None);
    };
    let name = resolve_target(doc.main_part(), &rel.target);
    Ok(doc.package().part_str(&name)?.map(|xml| (name, xml)))
}

/// Attach a new part to the main document.
fn add_related_part(
    doc: &mut WordDocument,
    file_name: &str,
    rel_type: &str,
    content_type: &str,
    xml: String,
) -> Result<String, DocxError> {
    let main = doc.main_part().to_string();
    let dir = main.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let name = if dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{dir}/{file_name}")
    };
    doc.package_mut().set_part(&name, xml.into_bytes());

    let mut rels = doc.package().relationships(&main)?;
    rels.add(rel_type, &relative_target(&main, &name), false);
    doc.package_mut().set_relationships(&main, &rels);

    let mut types = doc.package().content_types()?;
    types.ensure_override(&name, content_type);
    doc.package_mut().set_content_types(&types);
    Ok(name)
}

/// Prolog, root element and epilog of a part.
fn split_root<'a>(xml: &'a str, name: &str) -> Result<(&'a str, Element<'a>, &'a str), DocxError> {
    let range = find_element(xml, name)?
        .ok_or_else(|| DocxError(format!("part has no <{name}> root")))?;
    let element = split_element(&xml[range.clone()])?;
    Ok((&xml[..range.start], element, &xml[range.end..]))
}

/// Start and end tags of `element`, expanding `<x/>` to `<x>` + `</x>`.
fn open_close(element: &Element<'_>) -> (String, String) {
    if element.is_empty_tag() {
        let open = element.open.trim_end_matches("/>").trim_end();
        (format!("{open}>"), format!("</{}>", element.name))
    } else {
        (element.open.to_string(), element.close.to_string())
    }
}

fn max_attr(element: &Element<'_>, child: &str, name: &str) -> u32 {
    element
        .children()
        .filter(|(n, _)| *n == child)
        .filter_map(|(_, xml)| attr(xml, name).and_then(|v| v.parse::<u32>().ok()))
        .max()
        .unwrap_or(0)
}

fn rewrite_num_ids(xml: &str, map: &HashMap<String, String>) -> String {
    RE_NUM_ID
        .replace_all(xml, |c: &Captures| match map.get(&c[2]) {
            Some(new_id) => format!("{}{}{}", &c[1], new_id, &c[3]),
            None => c[0].to_string(),
        })
        .into_owned()
}

/// Import `source`'s list definitions into `target` under fresh ids and
/// return the `w:numId` mapping (old → new).
fn merge_numbering(
    target: &mut WordDocument,
    source: &WordDocument,
    xmls: &[String],
) -> Result<HashMap<String, String>, DocxError> {
    let mut num_map = HashMap::new();
    let source_styles = related_part(source, REL_STYLES)?;
    let referenced = xmls.iter().any(|x| x.contains("<w:numId"))
        || source_styles
            .as_ref()
            .is_some_and(|(_, xml)| xml.contains("<w:numId"));
    if !referenced {
        return Ok(num_map);
    }
    let Some((_, source_xml)) = related_part(source, REL_NUMBERING)? else {
        return Ok(num_map);
    };
    let (_, source_el, _) = split_root(&source_xml, "w:numbering")?;
    if source_el.is_empty_tag() {
        return Ok(num_map);
    }

    let (target_name, target_xml) = match related_part(target, REL_NUMBERING)? {
        Some(found) => found,
        None => {
            let (open, close) = open_close(&source_el);
            let xml = format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>{open}{close}"#
            );
            let name = add_related_part(target, "numbering.xml", REL_NUMBERING, CT_NUMBERING, xml.clone())?;
            (name, xml)
        }
    };
    let (prolog, target_el, epilog) = split_root(&target_xml, "w:numbering")?;

    let mut next_abstract = max_attr(&target_el, "w:abstractNum", "w:abstractNumId") + 1;
    let mut next_num = max_attr(&target_el, "w:num", "w:numId") + 1;

    let mut abstract_map: HashMap<String, String> = HashMap::new();
    let mut new_abstracts = String::new();
    for (name, xml) in source_el.children().filter(|(n, _)| *n == "w:abstractNum") {
        let Some(old) = attr(xml, "w:abstractNumId") else {
            debug!("Skipping {} without id", name);
            continue;
        };
        let new = next_abstract.to_string();
        next_abstract += 1;
        let renumbered = set_attr(xml, "w:abstractNumId", &new);
        let renumbered = RE_NSID.replace_all(&renumbered, "");
        let renumbered = RE_PIC_BULLET_REF.replace_all(&renumbered, "");
        new_abstracts.push_str(&renumbered);
        abstract_map.insert(old, new);
    }

    let mut new_nums = String::new();
    for (_, xml) in source_el.children().filter(|(n, _)| *n == "w:num") {
        let Some(old) = attr(xml, "w:numId") else {
            continue;
        };
        let new = next_num.to_string();
        next_num += 1;
        let renumbered = set_attr(xml, "w:numId", &new);
        let renumbered = RE_ABSTRACT_REF.replace_all(&renumbered, |c: &Captures| {
            match abstract_map.get(&c[2]) {
                Some(id) => format!("{}{}{}", &c[1], id, &c[3]),
                None => c[0].to_string(),
            }
        });
        new_nums.push_str(&renumbered);
        num_map.insert(old, new);
    }

    // Schema order: numPicBullet*, abstractNum*, num*, then the rest.
    let (mut bullets, mut abstracts, mut nums, mut rest) =
        (String::new(), String::new(), String::new(), String::new());
    for piece in &target_el.pieces {
        if let Piece::Child { name, xml } = piece {
            match *name {
                "w:numPicBullet" => bullets.push_str(xml),
                "w:abstractNum" => abstracts.push_str(xml),
                "w:num" => nums.push_str(xml),
                _ => rest.push_str(xml),
            }
        }
    }
    let (open, close) = open_close(&target_el);
    let merged = format!(
        "{prolog}{open}{bullets}{abstracts}{new_abstracts}{nums}{new_nums}{rest}{close}{epilog}"
    );
    target.package_mut().set_part(&target_name, merged.into_bytes());
    debug!("Imported {} list definition(s)", num_map.len());
    Ok(num_map)
}

/// Copy the notes the imported body references into `target`'s notes part
/// under fresh ids and point the references at them.
///
/// A reference whose note cannot be found in `source` is dropped.
fn merge_notes(
    target: &mut WordDocument,
    source: &WordDocument,
    xmls: &mut [String],
    kind: &NoteKind,
    num_map: &HashMap<String, String>,
) -> Result<(), DocxError> {
    let mut referenced: Vec<String> = Vec::new();
    for xml in xmls.iter() {
        for c in RE_NOTE_REF.captures_iter(xml).filter(|c| &c[1] == kind.tag) {
            if let Some(id) = attr(&c[0], "w:id") {
                if !referenced.contains(&id) {
                    referenced.push(id);
                }
            }
        }
    }
    if referenced.is_empty() {
        return Ok(());
    }

    let root = format!("w:{}s", kind.tag);
    let note = format!("w:{}", kind.tag);
    let mut id_map: HashMap<String, String> = HashMap::new();

    if let Some((source_name, source_xml)) = related_part(source, kind.rel_type)? {
        let (_, source_el, _) = split_root(&source_xml, &root)?;
        let source_notes: HashMap<String, &str> = source_el
            .children()
            .filter(|(n, _)| *n == note)
            .filter_map(|(_, xml)| attr(xml, "w:id").map(|id| (id, xml)))
            .collect();

        let (target_name, target_xml) = match related_part(target, kind.rel_type)? {
            Some(found) => found,
            None => {
                // Separator notes carry a w:type and are referenced from settings.
                let (open, close) = open_close(&source_el);
                let separators: String = source_el
                    .children()
                    .filter(|(n, xml)| *n == note && attr(xml, "w:type").is_some())
                    .map(|(_, xml)| xml)
                    .collect();
                let xml = format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>{open}{separators}{close}"#
                );
                let name =
                    add_related_part(target, kind.file_name, kind.rel_type, kind.content_type, xml.clone())?;
                (name, xml)
            }
        };
        let (prolog, target_el, epilog) = split_root(&target_xml, &root)?;
        let mut next_id = max_attr(&target_el, &note, "w:id") + 1;

        let mut copied: Vec<String> = Vec::new();
        for old in &referenced {
            let Some(xml) = source_notes.get(old) else {
                warn!("{} {} is referenced but not defined; dropping the reference", note, old);
                continue;
            };
            let new = next_id.to_string();
            next_id += 1;
            copied.push(rewrite_num_ids(&set_attr(xml, "w:id", &new), num_map));
            id_map.insert(old.clone(), new);
        }
        remap_relationships(target, &target_name, source, &source_name, &mut copied)?;
        renumber_drawings(target, &mut copied);

        let existing: String = target_el
            .pieces
            .iter()
            .map(|piece| match piece {
                Piece::Child { xml, .. } => *xml,
                Piece::Between(text) => *text,
            })
            .collect();
        let (open, close) = open_close(&target_el);
        let merged = format!("{prolog}{open}{existing}{}{close}{epilog}", copied.concat());
        target.package_mut().set_part(&target_name, merged.into_bytes());
        debug!("Imported {} {}(s)", id_map.len(), kind.tag);
    } else {
        warn!(
            "Imported body references {} {}(s) but has no {} part; dropping the references",
            referenced.len(),
            kind.tag,
            kind.file_name
        );
    }

    for xml in xmls.iter_mut() {
        *xml = RE_NOTE_REF
            .replace_all(xml, |c: &Captures| {
                if &c[1] != kind.tag {
                    return c[0].to_string();
                }
                match attr(&c[0], "w:id").and_then(|id| id_map.get(&id)) {
                    Some(new) => set_attr(&c[0], "w:id", new),
                    None => String::new(),
                }
            })
            .into_owned();
    }
    Ok(())
}

/// Add `source` styles whose ids `target` does not define yet.
fn merge_styles(
    target: &mut WordDocument,
    source: &WordDocument,
    num_map: &HashMap<String, String>,
) -> Result<(), DocxError> {
    let Some((_, source_xml)) = related_part(source, REL_STYLES)? else {
        return Ok(());
    };

    let Some((target_name, target_xml)) = related_part(target, REL_STYLES)? else {
        add_related_part(
            target,
            "styles.xml",
            REL_STYLES,
            CT_STYLES,
            rewrite_num_ids(&source_xml, num_map),
        )?;
        return Ok(());
    };

    let existing: HashSet<&str> = RE_STYLE_ID
        .captures_iter(&target_xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    let (_, source_el, _) = split_root(&source_xml, "w:styles")?;

    let mut added = String::new();
    let mut count = 0usize;
    for (_, xml) in source_el.children().filter(|(n, _)| *n == "w:style") {
        match attr(xml, "w:styleId") {
            Some(id) if !existing.contains(id.as_str()) => {
                added.push_str(&rewrite_num_ids(xml, num_map));
                count += 1;
            }
            _ => {}
        }
    }
    if added.is_empty() {
        return Ok(());
    }

    let close = target_xml
        .rfind("</w:styles>")
        .ok_or_else(|| DocxError(format!("'{target_name}' has no closing </w:styles>")))?;
    let merged = format!("{}{}{}", &target_xml[..close], added, &target_xml[close..]);
    target.package_mut().set_part(&target_name, merged.into_bytes());
    debug!("Merged {} style(s)", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::package::{ContentTypes, REL_IMAGE, CONTENT_TYPES_PART};
    use crate::docx::testing::{docx_with_body, p};
    use crate::docx::NS_W;

    fn attach(doc: &mut WordDocument, file: &str, rel_type: &str, ct: &str, xml: &str) {
        add_related_part(doc, file, rel_type, ct, xml.to_string()).unwrap();
    }

    fn styles(ids: &[&str]) -> String {
        let body: String = ids
            .iter()
            .map(|id| format!(r#"<w:style w:type="paragraph" w:styleId="{id}"><w:name w:val="{id}"/></w:style>"#))
            .collect();
        format!(r#"<?xml version="1.0"?><w:styles xmlns:w="{NS_W}">{body}</w:styles>"#)
    }

    fn numbering(abstract_id: u32, num_id: u32) -> String {
        format!(
            concat!(
                r#"<w:numbering xmlns:w="{ns}">"#,
                r#"<w:abstractNum w:abstractNumId="{a}"><w:nsid w:val="ABCD"/><w:lvl w:ilvl="0"/></w:abstractNum>"#,
                r#"<w:num w:numId="{n}"><w:abstractNumId w:val="{a}"/></w:num>"#,
                r#"</w:numbering>"#
            ),
            ns = NS_W,
            a = abstract_id,
            n = num_id
        )
    }

    fn list_item(num_id: u32, text: &str) -> String {
        format!(
            r#"<w:p><w:pPr><w:pStyle w:val="ListBullet"/><w:numPr><w:ilvl w:val="0"/><w:numId w:val="{num_id}"/></w:numPr></w:pPr><w:r><w:t>{text}</w:t></w:r></w:p>"#
        )
    }

    #[test]
    fn images_and_links_get_fresh_ids() {
        let mut target = WordDocument::blank();
        let img = crate::docx::picture::InlineImage::from_bytes(
            crate::docx::picture::png_fixture(2, 2),
        )
        .unwrap();
        target.add_image(&img, 10).unwrap(); // occupies rId1 and image1.png

        let mut source = WordDocument::blank();
        let run = source.add_image(&img, 10).unwrap();
        let mut rels = source.package().relationships("word/document.xml").unwrap();
        let link = rels.add("http://x/hyperlink", "https://example.com", true);
        source.package_mut().set_relationships("word/document.xml", &rels);
        source.push_block(Block::new(format!("<w:p>{run}</w:p>")));
        source.push_block(Block::new(format!(
            r#"<w:p><w:hyperlink r:id="{link}"><w:r><w:t>site</w:t></w:r></w:hyperlink></w:p>"#
        )));

        let blocks = import_body(&mut target, &source).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].xml().contains(r#"r:embed="rId2""#), "{}", blocks[0].xml());
        assert!(blocks[1].xml().contains(r#"r:id="rId3""#), "{}", blocks[1].xml());

        let rels = target.package().relationships("word/document.xml").unwrap();
        assert_eq!(rels.get("rId2").unwrap().rel_type, REL_IMAGE);
        assert_eq!(rels.get("rId2").unwrap().target, "media/image2.png");
        assert!(rels.get("rId3").unwrap().external);
        assert!(target.package().has_part("word/media/image2.png"));
    }

    #[test]
    fn section_properties_are_dropped() {
        let body = format!(
            r#"{}<w:p><w:pPr><w:sectPr><w:pgSz w:w="1"/></w:sectPr></w:pPr></w:p>"#,
            p("text")
        );
        let source = WordDocument::from_bytes(&docx_with_body(&body)).unwrap();
        let mut target = WordDocument::blank();
        let blocks = import_body(&mut target, &source).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| !b.xml().contains("sectPr")));
    }

    #[test]
    fn missing_styles_are_appended_once() {
        let mut target = WordDocument::blank();
        attach(&mut target, "styles.xml", REL_STYLES, CT_STYLES, &styles(&["Normal", "Title"]));
        let mut source = WordDocument::blank();
        attach(&mut source, "styles.xml", REL_STYLES, CT_STYLES, &styles(&["Normal", "BodyText"]));
        source.push_paragraph("x");

        import_body(&mut target, &source).unwrap();
        let merged = target.package().part_str("word/styles.xml").unwrap().unwrap();
        assert_eq!(merged.matches(r#"w:styleId="Normal""#).count(), 1);
        assert_eq!(merged.matches(r#"w:styleId="BodyText""#).count(), 1);
        assert!(merged.ends_with("</w:styles>"));
    }

    #[test]
    fn styles_part_is_created_when_target_has_none() {
        let mut target = WordDocument::blank();
        let mut source = WordDocument::blank();
        attach(&mut source, "styles.xml", REL_STYLES, CT_STYLES, &styles(&["Compact"]));
        import_body(&mut target, &source).unwrap();

        assert!(target.package().has_part("word/styles.xml"));
        let types: ContentTypes = target.package().content_types().unwrap();
        assert_eq!(types.override_for("word/styles.xml"), Some(CT_STYLES));
        assert!(target.package().has_part(CONTENT_TYPES_PART));
    }

    #[test]
    fn numbering_is_renumbered() {
        let mut target = WordDocument::blank();
        attach(&mut target, "numbering.xml", REL_NUMBERING, CT_NUMBERING, &numbering(0, 1));
        let mut source = WordDocument::blank();
        attach(&mut source, "numbering.xml", REL_NUMBERING, CT_NUMBERING, &numbering(0, 1));
        source.push_block(Block::new(list_item(1, "first")));

        let blocks = import_body(&mut target, &source).unwrap();
        assert!(blocks[0].xml().contains(r#"<w:numId w:val="2"/>"#), "{}", blocks[0].xml());

        let merged = target.package().part_str("word/numbering.xml").unwrap().unwrap();
        assert!(merged.contains(r#"<w:abstractNum w:abstractNumId="1">"#), "{merged}");
        assert!(merged.contains(r#"<w:num w:numId="2"><w:abstractNumId w:val="1"/></w:num>"#), "{merged}");
        assert_eq!(merged.matches("<w:nsid").count(), 1, "imported nsid is stripped");
        let first_num = merged.find("<w:num ").unwrap();
        let last_abstract = merged.rfind("<w:abstractNum ").unwrap();
        assert!(last_abstract < first_num, "abstract definitions precede nums");
    }

    #[test]
    fn numbering_part_is_created_when_missing() {
        let mut target = WordDocument::blank();
        let mut source = WordDocument::blank();
        attach(&mut source, "numbering.xml", REL_NUMBERING, CT_NUMBERING, &numbering(4, 7));
        source.push_block(Block::new(list_item(7, "only")));

        let blocks = import_body(&mut target, &source).unwrap();
        assert!(blocks[0].xml().contains(r#"<w:numId w:val="1"/>"#));
        let created = target.package().part_str("word/numbering.xml").unwrap().unwrap();
        assert!(created.contains(r#"<w:num w:numId="1"><w:abstractNumId w:val="1"/></w:num>"#), "{created}");
        let rels = target.package().relationships("word/document.xml").unwrap();
        assert!(rels.find_by_type(REL_NUMBERING).is_some());
    }

    fn footnotes(notes: &[(&str, &str)]) -> String {
        let body: String = notes
            .iter()
            .map(|(id, text)| {
                format!(r#"<w:footnote w:id="{id}"><w:p><w:r><w:t>{text}</w:t></w:r></w:p></w:footnote>"#)
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><w:footnotes xmlns:w="{NS_W}"><w:footnote w:type="separator" w:id="-1"><w:p/></w:footnote><w:footnote w:type="continuationSeparator" w:id="0"><w:p/></w:footnote>{body}</w:footnotes>"#
        )
    }

    fn noted(text: &str, id: u32) -> String {
        format!(
            r#"<w:p><w:r><w:t>{text}</w:t></w:r><w:r><w:rPr><w:rStyle w:val="FootnoteReference"/></w:rPr><w:footnoteReference w:id="{id}"/></w:r></w:p>"#
        )
    }

    #[test]
    fn imported_drawings_get_unused_ids() {
        let img = crate::docx::picture::InlineImage::from_bytes(
            crate::docx::picture::png_fixture(2, 2),
        )
        .unwrap();
        let mut target = WordDocument::blank();
        let own = target.add_image(&img, 10).unwrap();
        target.push_block(Block::new(format!("<w:p>{own}</w:p>")));

        let mut source = WordDocument::blank();
        for _ in 0..2 {
            let run = source.add_image(&img, 10).unwrap();
            source.push_block(Block::new(format!("<w:p>{run}</w:p>")));
        }

        let blocks = import_body(&mut target, &source).unwrap();
        let ids: Vec<String> = blocks
            .iter()
            .chain(target.blocks())
            .flat_map(|b| {
                RE_DRAWING_ID
                    .captures_iter(b.xml())
                    .filter(|c| &c[2] == "wp:docPr")
                    .map(|c| c[3].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(ids.len(), 3);
        let unique: HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 3, "{ids:?}");
        assert!(blocks[1].xml().contains(r#"<pic:cNvPr id="3""#), "{}", blocks[1].xml());
        assert_eq!(target.next_drawing_id(), 4);
    }

    #[test]
    fn footnotes_follow_the_imported_body() {
        let mut target = WordDocument::blank();
        attach(&mut target, "footnotes.xml", REL_FOOTNOTES, CT_FOOTNOTES, &footnotes(&[("1", "own note")]));
        let mut source = WordDocument::blank();
        attach(&mut source, "footnotes.xml", REL_FOOTNOTES, CT_FOOTNOTES, &footnotes(&[("1", "imported note")]));
        source.push_block(Block::new(noted("Revenue", 1)));

        let blocks = import_body(&mut target, &source).unwrap();
        assert!(blocks[0].xml().contains(r#"<w:footnoteReference w:id="2"/>"#), "{}", blocks[0].xml());

        let merged = target.package().part_str("word/footnotes.xml").unwrap().unwrap();
        assert!(merged.contains(r#"<w:footnote w:id="1"><w:p><w:r><w:t>own note"#), "{merged}");
        assert!(merged.contains(r#"<w:footnote w:id="2"><w:p><w:r><w:t>imported note"#), "{merged}");
        assert_eq!(merged.matches(r#"w:type="separator""#).count(), 1);
        assert!(merged.ends_with("</w:footnotes>"));
    }

    #[test]
    fn footnotes_part_is_created_when_missing() {
        let mut target = WordDocument::blank();
        let mut source = WordDocument::blank();
        attach(&mut source, "footnotes.xml", REL_FOOTNOTES, CT_FOOTNOTES, &footnotes(&[("5", "only note"), ("6", "unused")]));
        source.push_block(Block::new(noted("Assets", 5)));

        let blocks = import_body(&mut target, &source).unwrap();
        assert!(blocks[0].xml().contains(r#"<w:footnoteReference w:id="1"/>"#), "{}", blocks[0].xml());

        let created = target.package().part_str("word/footnotes.xml").unwrap().unwrap();
        assert!(created.contains(r#"w:type="continuationSeparator""#), "{created}");
        assert!(created.contains("only note"));
        assert!(!created.contains("unused"));
        let rels = target.package().relationships("word/document.xml").unwrap();
        assert!(rels.find_by_type(REL_FOOTNOTES).is_some());
        let types = target.package().content_types().unwrap();
        assert_eq!(types.override_for("word/footnotes.xml"), Some(CT_FOOTNOTES));
    }

    #[test]
    fn dangling_note_references_are_dropped() {
        let mut target = WordDocument::blank();
        let mut source = WordDocument::blank();
        source.push_block(Block::new(noted("Liabilities", 3)));
        source.push_block(Block::new(
            r#"<w:p><w:r><w:endnoteReference w:id="1"/></w:r></w:p>"#,
        ));

        let blocks = import_body(&mut target, &source).unwrap();
        assert!(blocks.iter().all(|b| !b.xml().contains("noteReference")));
        assert!(blocks[0].xml().contains("Liabilities"));
        assert!(!target.package().has_part("word/footnotes.xml"));
    }
}
