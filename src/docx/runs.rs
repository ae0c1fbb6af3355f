//! Run-aware text editing inside a WordprocessingML fragment.
//!
//! Word splits visible text across many `<w:r><w:t>…</w:t></w:r>` runs
//! (spell-check marks, revision ids, formatting changes), so a tag such as
//! `{{ company_name }}` may be spread over three `w:t` nodes. [`TextRuns`]
//! exposes the concatenated text of every `w:t` in a fragment and lets
//! callers replace byte ranges of that text: the replacement lands in the
//! first run the range touches, keeping that run's formatting, and the rest of
//! the range is removed from the following runs.

use super::xml::tag_name;
use super::DocxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::ops::Range;

const PRESERVE_OPEN: &str = r#"<w:t xml:space="preserve">"#;

#[derive(Debug, Clone)]
struct TextNode {
    /// Original `<w:t>…</w:t>` markup, emitted verbatim while unmodified.
    raw: String,
    text: String,
    /// `<w:rPr>` of the enclosing run, reused when the run has to be split.
    run_props: String,
    dirty: bool,
}

impl TextNode {
    fn fresh(text: String, run_props: String) -> Self {
        Self {
            raw: String::new(),
            text,
            run_props,
            dirty: true,
        }
    }

    fn write(&self, out: &mut String) {
        if self.dirty {
            out.push_str(PRESERVE_OPEN);
            out.push_str(&quick_xml::escape::escape(self.text.as_str()));
            out.push_str("</w:t>");
        } else {
            out.push_str(&self.raw);
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Markup(String),
    Text(TextNode),
}

/// What to put in place of a replaced range.
#[derive(Debug, Clone, Copy)]
pub enum Replacement<'a> {
    /// Plain text, inserted into the first affected run.
    Text(&'a str),
    /// A complete `<w:r>…</w:r>` element (e.g. an inline drawing). The run
    /// holding the range is split around it.
    Run(&'a str),
}

/// Text view over a WordprocessingML fragment.
#[derive(Debug, Clone)]
pub struct TextRuns {
    segments: Vec<Segment>,
}

impl TextRuns {
    pub fn parse(xml: &str) -> Result<Self, DocxError> {
        let mut reader = Reader::from_str(xml);
        let mut segments = Vec::new();
        let mut last = 0usize;
        let mut open_text: Option<(usize, String)> = None;
        let mut rpr_start: Option<usize> = None;
        let mut run_props = String::new();

        loop {
            let pos = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|e| DocxError(format!("XML error at byte {pos}: {e}")))?;
            let after = reader.buffer_position();
            let start = || xml[..after].rfind('<').unwrap_or(0);
            match event {
                Event::Start(e) => match e.name().as_ref() {
                    b"w:t" => {
                        let s = start();
                        if s > last {
                            segments.push(Segment::Markup(xml[last..s].to_string()));
                        }
                        open_text = Some((s, String::new()));
                    }
                    b"w:r" => run_props.clear(),
                    b"w:rPr" => rpr_start = Some(start()),
                    _ => {}
                },
                Event::Empty(e) if e.name().as_ref() == b"w:rPr" => {
                    run_props = xml[start()..after].to_string();
                }
                Event::End(e) => match e.name().as_ref() {
                    b"w:t" => {
                        if let Some((s, text)) = open_text.take() {
                            segments.push(Segment::Text(TextNode {
                                raw: xml[s..after].to_string(),
                                text,
                                run_props: run_props.clone(),
                                dirty: false,
                            }));
                            last = after;
                        }
                    }
                    b"w:rPr" => {
                        if let Some(s) = rpr_start.take() {
                            run_props = xml[s..after].to_string();
                        }
                    }
                    _ => {}
                },
                Event::Text(t) => {
                    if let Some((_, text)) = open_text.as_mut() {
                        let unescaped = t
                            .unescape()
                            .map_err(|e| DocxError(format!("bad text at byte {pos}: {e}")))?;
                        text.push_str(&unescaped);
                    }
                }
                Event::CData(c) => {
                    if let Some((_, text)) = open_text.as_mut() {
                        text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if last < xml.len() {
            segments.push(Segment::Markup(xml[last..].to_string()));
        }
        Ok(Self { segments })
    }

    /// Concatenated text of every `w:t` node.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text(node) => Some(node.text.as_str()),
                Segment::Markup(_) => None,
            })
            .collect()
    }

    /// `true` when some text node was modified.
    pub fn is_modified(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Text(n) if n.dirty))
    }

    /// Replace `range` (byte offsets into [`TextRuns::text`]) with
    /// `replacement`. Callers replacing several ranges must go from the last
    /// range to the first so earlier offsets stay valid.
    pub fn replace(&mut self, range: Range<usize>, replacement: Replacement<'_>) {
        if range.start >= range.end {
            return;
        }

        // (segment index, text start offset, text length) of every text node.
        let mut nodes = Vec::new();
        let mut offset = 0usize;
        for (i, seg) in self.segments.iter().enumerate() {
            if let Segment::Text(node) = seg {
                nodes.push((i, offset, node.text.len()));
                offset += node.text.len();
            }
        }

        let mut first = true;
        let mut inserts: Vec<(usize, Vec<Segment>)> = Vec::new();
        for &(i, seg_start, len) in &nodes {
            let seg_end = seg_start + len;
            if seg_end <= range.start || seg_start >= range.end {
                continue;
            }
            let local_start = range.start.saturating_sub(seg_start);
            let local_end = range.end.min(seg_end) - seg_start;
            let Segment::Text(node) = &mut self.segments[i] else {
                continue;
            };
            node.dirty = true;
            if !first {
                node.text.replace_range(local_start..local_end, "");
                continue;
            }
            first = false;
            match replacement {
                Replacement::Text(text) => node.text.replace_range(local_start..local_end, text),
                Replacement::Run(run) => {
                    let tail = node.text[local_end..].to_string();
                    node.text.truncate(local_start);
                    let split = format!("</w:r>{run}<w:r>{}", node.run_props);
                    let tail_node = TextNode::fresh(tail, node.run_props.clone());
                    inserts.push((i, vec![Segment::Markup(split), Segment::Text(tail_node)]));
                }
            }
        }

        for (i, segs) in inserts.into_iter().rev() {
            for (k, seg) in segs.into_iter().enumerate() {
                self.segments.insert(i + 1 + k, seg);
            }
        }
    }

    /// Serialize back to XML.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Markup(m) => out.push_str(m),
                Segment::Text(node) => node.write(&mut out),
            }
        }
        out
    }
}

/// Concatenated `w:t` text of a fragment.
pub fn fragment_text(xml: &str) -> Result<String, DocxError> {
    TextRuns::parse(xml).map(|r| r.text())
}

/// `true` when the fragment is a paragraph element.
pub fn is_paragraph(xml: &str) -> bool {
    tag_name(xml) == "w:p"
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPLIT: &str = concat!(
        r#"<w:p><w:pPr><w:jc w:val="center"/></w:pPr>"#,
        r#"<w:r><w:rPr><w:b/></w:rPr><w:t>Hello {{ comp</w:t></w:r>"#,
        r#"<w:r><w:t>any_name }}</w:t></w:r>"#,
        r#"<w:r><w:t xml:space="preserve"> ltd</w:t></w:r></w:p>"#,
    );

    #[test]
    fn text_concatenates_runs() {
        let runs = TextRuns::parse(SPLIT).unwrap();
        assert_eq!(runs.text(), "Hello {{ company_name }} ltd");
        assert_eq!(runs.to_xml(), SPLIT, "unmodified runs round-trip verbatim");
    }

    #[test]
    fn replace_across_runs_keeps_first_run_formatting() {
        let mut runs = TextRuns::parse(SPLIT).unwrap();
        let text = runs.text();
        let start = text.find("{{").unwrap();
        let end = text.find("}}").unwrap() + 2;
        runs.replace(start..end, Replacement::Text("ACME & Co"));
        assert_eq!(runs.text(), "Hello ACME & Co ltd");
        let xml = runs.to_xml();
        assert!(xml.contains(r#"<w:rPr><w:b/></w:rPr><w:t xml:space="preserve">Hello ACME &amp; Co</w:t>"#), "{xml}");
        assert!(xml.contains(r#"<w:r><w:t xml:space="preserve"></w:t></w:r>"#), "{xml}");
        assert!(runs.is_modified());
    }

    #[test]
    fn run_replacement_splits_the_run() {
        let xml = r#"<w:p><w:r><w:rPr><w:i/></w:rPr><w:t>a[IMG]b</w:t></w:r></w:p>"#;
        let mut runs = TextRuns::parse(xml).unwrap();
        runs.replace(1..6, Replacement::Run("<w:r><w:drawing/></w:r>"));
        assert_eq!(
            runs.to_xml(),
            concat!(
                r#"<w:p><w:r><w:rPr><w:i/></w:rPr><w:t xml:space="preserve">a</w:t></w:r>"#,
                r#"<w:r><w:drawing/></w:r>"#,
                r#"<w:r><w:rPr><w:i/></w:rPr><w:t xml:space="preserve">b</w:t></w:r></w:p>"#,
            )
        );
    }

    #[test]
    fn entities_are_unescaped_in_text() {
        let runs = TextRuns::parse("<w:p><w:r><w:t>R&amp;D &lt;1&gt;</w:t></w:r></w:p>").unwrap();
        assert_eq!(runs.text(), "R&D <1>");
    }

    #[test]
    fn paragraph_detection() {
        assert!(is_paragraph(r#"<w:p w:rsidR="1"><w:r/></w:p>"#));
        assert!(!is_paragraph("<w:pPr/>"));
        assert!(!is_paragraph("<w:tbl></w:tbl>"));
    }
}
