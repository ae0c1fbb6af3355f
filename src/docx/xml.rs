//! Span-level XML helpers on top of `quick-xml`.
//!
//! WordprocessingML is edited here by slicing the original text rather than
//! by building a DOM: untouched elements are copied byte-for-byte, so
//! namespaces, unknown extensions and vendor markup survive a round trip.

use super::DocxError;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::ops::Range;

/// One direct child of an element, or the text/markup between children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece<'a> {
    Child { name: &'a str, xml: &'a str },
    Between(&'a str),
}

/// An element split into its start tag, content pieces and end tag.
///
/// For an empty element (`<w:p/>`) `open` holds the whole tag and `close` is
/// empty.
#[derive(Debug, Clone)]
pub struct Element<'a> {
    pub name: &'a str,
    pub open: &'a str,
    pub pieces: Vec<Piece<'a>>,
    pub close: &'a str,
}

impl<'a> Element<'a> {
    pub fn is_empty_tag(&self) -> bool {
        self.close.is_empty()
    }

    /// Direct child elements only.
    pub fn children(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Child { name, xml } => Some((*name, *xml)),
            Piece::Between(_) => None,
        })
    }
}

fn xml_error(err: quick_xml::Error, pos: usize) -> DocxError {
    DocxError(format!("XML error at byte {pos}: {err}"))
}

/// Start offset of the tag that ends at `after`.
///
/// `<` cannot appear unescaped inside a tag, so the last `<` before the end
/// of the tag is its first byte.
fn tag_start(xml: &str, after: usize) -> usize {
    xml[..after].rfind('<').unwrap_or(0)
}

/// Qualified name of the tag at the start of `raw` (`<w:p w:rsidR="…">` → `w:p`).
pub fn tag_name(raw: &str) -> &str {
    let rest = raw.trim_start().trim_start_matches('<').trim_start_matches('/');
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Split `xml`, which must hold exactly one element, into its parts.
pub fn split_element(xml: &str) -> Result<Element<'_>, DocxError> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut open: Option<Range<usize>> = None;
    let mut pieces = Vec::new();
    let mut child_start = 0usize;
    let mut last = 0usize;

    loop {
        let pos = reader.buffer_position();
        let event = reader.read_event().map_err(|e| xml_error(e, pos))?;
        let after = reader.buffer_position();
        match event {
            Event::Start(_) => {
                depth += 1;
                let start = tag_start(xml, after);
                if depth == 1 {
                    open = Some(start..after);
                    last = after;
                } else if depth == 2 {
                    if start > last {
                        pieces.push(Piece::Between(&xml[last..start]));
                    }
                    child_start = start;
                }
            }
            Event::End(_) => {
                let start = tag_start(xml, after);
                match depth {
                    0 => return Err(DocxError(format!("unbalanced end tag at byte {start}"))),
                    1 => {
                        if start > last {
                            pieces.push(Piece::Between(&xml[last..start]));
                        }
                        let open = open.unwrap_or(0..0);
                        let open_xml = &xml[open];
                        return Ok(Element {
                            name: tag_name(open_xml),
                            open: open_xml,
                            pieces,
                            close: &xml[start..after],
                        });
                    }
                    2 => {
                        let child = &xml[child_start..after];
                        pieces.push(Piece::Child {
                            name: tag_name(child),
                            xml: child,
                        });
                        last = after;
                    }
                    _ => {}
                }
                depth -= 1;
            }
            Event::Empty(_) => {
                let start = tag_start(xml, after);
                match depth {
                    0 => {
                        let whole = &xml[start..after];
                        return Ok(Element {
                            name: tag_name(whole),
                            open: whole,
                            pieces: Vec::new(),
                            close: "",
                        });
                    }
                    1 => {
                        if start > last {
                            pieces.push(Piece::Between(&xml[last..start]));
                        }
                        let child = &xml[start..after];
                        pieces.push(Piece::Child {
                            name: tag_name(child),
                            xml: child,
                        });
                        last = after;
                    }
                    _ => {}
                }
            }
            Event::Eof => return Err(DocxError("unterminated element".into())),
            _ => {}
        }
    }
}

/// Byte range of the first element named `name` (including nested
/// occurrences of the same name).
pub fn find_element(xml: &str, name: &str) -> Result<Option<Range<usize>>, DocxError> {
    let mut reader = Reader::from_str(xml);
    let mut found_start: Option<usize> = None;
    let mut nesting = 0usize;

    loop {
        let pos = reader.buffer_position();
        let event = reader.read_event().map_err(|e| xml_error(e, pos))?;
        let after = reader.buffer_position();
        match event {
            Event::Start(e) if e.name().as_ref() == name.as_bytes() => {
                if found_start.is_none() {
                    found_start = Some(tag_start(xml, after));
                }
                nesting += 1;
            }
            Event::End(e) if e.name().as_ref() == name.as_bytes() => {
                nesting = nesting.saturating_sub(1);
                if nesting == 0 {
                    if let Some(start) = found_start {
                        return Ok(Some(start..after));
                    }
                }
            }
            Event::Empty(e) if e.name().as_ref() == name.as_bytes() && found_start.is_none() => {
                return Ok(Some(tag_start(xml, after)..after));
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

/// Value of attribute `name` on the start tag at the beginning of `tag`.
pub fn attr(tag: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(tag);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == name.as_bytes())
                    .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

static RE_START_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^<[^>]*?>"#).unwrap());

/// Replace the value of attribute `name` in the start tag at the beginning of
/// `xml`, leaving the rest untouched. Returns `xml` unchanged when the
/// attribute is absent.
pub fn set_attr(xml: &str, name: &str, value: &str) -> String {
    let Some(m) = RE_START_TAG.find(xml) else {
        return xml.to_string();
    };
    let tag = m.as_str();
    let needle = format!("{name}=\"");
    let Some(pos) = tag.find(&needle) else {
        return xml.to_string();
    };
    let value_start = pos + needle.len();
    let Some(value_len) = tag[value_start..].find('"') else {
        return xml.to_string();
    };
    let mut out = String::with_capacity(xml.len() + value.len());
    out.push_str(&xml[..value_start]);
    out.push_str(&quick_xml::escape::escape(value));
    out.push_str(&xml[value_start + value_len..]);
    out
}
