//! Template rendering: fill `{{ … }}` and `{%p/tr for … %}` tags from a
//! [`FormContext`].
//!
//! ## Tag syntax
//!
//! | Tag                                   | Effect                                  |
//! |---------------------------------------|-----------------------------------------|
//! | `{{ field }}`                         | text, image or placeholder-token field  |
//! | `{{ item.attr }}`                     | attribute of the current loop record    |
//! | `{%p for item in list %}` / `{%p endfor %}`   | repeat the blocks between the tags |
//! | `{%tr for item in list %}` / `{%tr endfor %}` | repeat the table rows between them |
//!
//! Control tags sit in a paragraph (or row) of their own; that whole element
//! is dropped from the output. Tags may be split across runs: the text view
//! from [`TextRuns`] sees them whole, and the replacement lands in the first
//! run, keeping its formatting.
//!
//! Elements without a `{` are copied byte-for-byte, and paragraphs whose tags
//! produce no change are returned unmodified.

use crate::context::{FieldValue, FormContext, Record};
use crate::docx::runs::{Replacement, TextRuns};
use crate::docx::xml::{split_element, tag_name, Piece};
use crate::docx::{Block, WordDocument};
use crate::error::DossierError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

static RE_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_]\w*)(?:\.([A-Za-z_]\w*))?\s*\}\}").unwrap()
});

static RE_LOOP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{%\s*(p|tr)\s+for\s+([A-Za-z_]\w*)\s+in\s+([A-Za-z_]\w*)\s*%\}").unwrap()
});

static RE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{%\s*(p|tr)\s+endfor\s*%\}").unwrap());

/// Any `{{ … }}` expression, well-formed or not.
static RE_ANY_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{.*?\}\}").unwrap());

/// Any `{% … %}` statement.
static RE_ANY_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{%.*?%\}").unwrap());

/// Renders a template document against a context.
pub trait FieldResolver {
    /// Produce a new document; `template` is left untouched.
    fn render(&self, template: &WordDocument, ctx: &FormContext) -> Result<WordDocument, DossierError>;
}

/// Load the template asset.
pub fn load_template(path: &Path) -> Result<WordDocument, DossierError> {
    if !path.is_file() {
        return Err(DossierError::TemplateNotFound {
            path: path.to_path_buf(),
        });
    }
    let doc = WordDocument::open(path).map_err(|e| {
        DossierError::InvalidTemplate(format!("'{}' is not a usable DOCX: {}", path.display(), e))
    })?;
    info!("Template loaded: {} ({} blocks)", path.display(), doc.blocks().len());
    Ok(doc)
}

/// Default [`FieldResolver`].
#[derive(Debug, Clone, Copy)]
pub struct TemplateRenderer {
    /// Display width of image fields.
    pub width_emu: u64,
}

impl TemplateRenderer {
    pub fn new(width_emu: u64) -> Self {
        Self { width_emu }
    }
}

impl FieldResolver for TemplateRenderer {
    fn render(&self, template: &WordDocument, ctx: &FormContext) -> Result<WordDocument, DossierError> {
        let mut doc = template.clone();
        let blocks = doc.take_blocks();
        let rendered = {
            let mut render = Render {
                doc: &mut doc,
                ctx,
                width_emu: self.width_emu,
                images: HashMap::new(),
                used: BTreeSet::new(),
            };
            let items: Vec<Item<'_>> = blocks.iter().map(|b| Item::Element(b.xml())).collect();
            let out = render.items(&items, &Scope::default())?;
            for field in ctx.fields().filter(|f| !render.used.contains(*f)) {
                warn!("Context field '{}' is not used by the template", field);
            }
            out
        };
        doc.set_blocks(rendered.into_iter().map(Block::new).collect());
        debug!("Rendered template into {} blocks", doc.blocks().len());
        Ok(doc)
    }
}

// ── Rendering ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Paragraph,
    Row,
}

impl LoopKind {
    fn parse(s: &str) -> Self {
        if s == "tr" {
            LoopKind::Row
        } else {
            LoopKind::Paragraph
        }
    }

    fn element(self) -> &'static str {
        match self {
            LoopKind::Paragraph => "w:p",
            LoopKind::Row => "w:tr",
        }
    }
}

#[derive(Debug)]
enum Control {
    Start {
        kind: LoopKind,
        var: String,
        list: String,
    },
    End(LoopKind),
}

/// Sibling content being rendered: child elements and the text between them.
#[derive(Debug, Clone, Copy)]
enum Item<'a> {
    Element(&'a str),
    Raw(&'a str),
}

/// Loop variables in scope, innermost last.
#[derive(Debug, Default, Clone)]
struct Scope<'r> {
    vars: Vec<(String, &'r Record)>,
}

impl<'r> Scope<'r> {
    fn lookup(&self, var: &str) -> Option<&'r Record> {
        self.vars.iter().rev().find(|(v, _)| v == var).map(|(_, r)| *r)
    }

    fn with(&self, var: &str, record: &'r Record) -> Self {
        let mut vars = self.vars.clone();
        vars.push((var.to_string(), record));
        Self { vars }
    }
}

struct Render<'a> {
    doc: &'a mut WordDocument,
    ctx: &'a FormContext,
    width_emu: u64,
    /// Field name → (relationship id, media name) of images already stored.
    images: HashMap<String, (String, String)>,
    used: BTreeSet<String>,
}

impl<'a> Render<'a> {
    fn items(&mut self, items: &[Item<'_>], scope: &Scope<'a>) -> Result<Vec<String>, DossierError> {
        let mut out = Vec::with_capacity(items.len());
        let mut i = 0;
        while i < items.len() {
            let xml = match items[i] {
                Item::Raw(raw) => {
                    out.push(raw.to_string());
                    i += 1;
                    continue;
                }
                Item::Element(xml) => xml,
            };
            match control(xml)? {
                None => out.push(self.element(xml, scope)?),
                Some(Control::End(kind)) => {
                    return Err(DossierError::InvalidTemplate(format!(
                        "'{{%{} endfor %}}' without a matching for",
                        tag_of(kind)
                    )))
                }
                Some(Control::Start { kind, var, list }) => {
                    let end = matching_end(items, i, kind)?;
                    let body = &items[i + 1..end];
                    let records = self.group(&list)?;
                    debug!("Loop over '{}': {} record(s)", list, records.len());
                    for record in records {
                        out.extend(self.items(body, &scope.with(&var, record))?);
                    }
                    i = end;
                }
            }
            i += 1;
        }
        Ok(out)
    }

    fn group(&mut self, list: &str) -> Result<&'a [Record], DossierError> {
        self.used.insert(list.to_string());
        let ctx: &'a FormContext = self.ctx;
        match ctx.get(list) {
            Some(FieldValue::Group(records)) => Ok(records.as_slice()),
            Some(other) => Err(DossierError::InvalidTemplate(format!(
                "cannot loop over '{}': it is a {} field, not a list",
                list,
                other.kind()
            ))),
            None => Err(DossierError::MissingField {
                field: list.to_string(),
            }),
        }
    }

    fn element(&mut self, xml: &str, scope: &Scope<'a>) -> Result<String, DossierError> {
        if !xml.contains('{') {
            return Ok(xml.to_string());
        }
        if tag_name(xml) == "w:p" {
            return self.paragraph(xml, scope);
        }
        let element = split_element(xml)?;
        if element.is_empty_tag() {
            return Ok(xml.to_string());
        }
        let items: Vec<Item<'_>> = element
            .pieces
            .iter()
            .map(|p| match p {
                Piece::Child { xml, .. } => Item::Element(*xml),
                Piece::Between(raw) => Item::Raw(*raw),
            })
            .collect();
        let mut out = String::with_capacity(xml.len());
        out.push_str(element.open);
        for piece in self.items(&items, scope)? {
            out.push_str(&piece);
        }
        out.push_str(element.close);
        Ok(out)
    }

    fn paragraph(&mut self, xml: &str, scope: &Scope<'a>) -> Result<String, DossierError> {
        let mut runs = TextRuns::parse(xml)?;
        let text = runs.text();
        if !text.contains('{') {
            return Ok(xml.to_string());
        }

        if let Some(block) = RE_ANY_BLOCK.find(&text) {
            let tag = block.as_str();
            let hint = if RE_LOOP.is_match(tag) || RE_END.is_match(tag) {
                "loop tags must be alone in a paragraph ({%p …%}) or a table row ({%tr …%})"
            } else {
                "only {%p for%} and {%tr for%} loops are supported"
            };
            return Err(DossierError::InvalidTemplate(format!("unsupported tag '{tag}': {hint}")));
        }

        let mut matches = Vec::new();
        for m in RE_ANY_VAR.find_iter(&text) {
            let caps = RE_VAR
                .captures(m.as_str())
                .filter(|c| c.get(0).map(|g| g.as_str().len()) == Some(m.as_str().len()))
                .ok_or_else(|| {
                    DossierError::InvalidTemplate(format!("malformed expression '{}'", m.as_str()))
                })?;
            let name = caps[1].to_string();
            let attr = caps.get(2).map(|a| a.as_str().to_string());
            matches.push((m.range(), name, attr));
        }
        if matches.is_empty() {
            if text.contains("{{") {
                return Err(DossierError::InvalidTemplate(format!(
                    "unterminated expression in '{}'",
                    text.trim()
                )));
            }
            return Ok(xml.to_string());
        }

        // Right to left, so earlier byte offsets stay valid.
        for (range, name, attr) in matches.into_iter().rev() {
            match self.resolve(&name, attr.as_deref(), scope)? {
                Resolved::Text(value) => runs.replace(range, Replacement::Text(&value)),
                Resolved::Run(run) => runs.replace(range, Replacement::Run(&run)),
            }
        }
        if runs.is_modified() {
            Ok(runs.to_xml())
        } else {
            Ok(xml.to_string())
        }
    }

    fn resolve(
        &mut self,
        name: &str,
        attr: Option<&str>,
        scope: &Scope<'a>,
    ) -> Result<Resolved, DossierError> {
        if let Some(record) = scope.lookup(name) {
            let Some(attr) = attr else {
                return Err(DossierError::InvalidTemplate(format!(
                    "loop variable '{name}' is a record; use '{name}.<attribute>'"
                )));
            };
            return record
                .get(attr)
                .map(|v| Resolved::Text(v.to_string()))
                .ok_or_else(|| DossierError::MissingField {
                    field: format!("{name}.{attr}"),
                });
        }

        self.used.insert(name.to_string());
        let value = self.ctx.get(name);
        match (value, attr) {
            (None, None) => Err(DossierError::MissingField {
                field: name.to_string(),
            }),
            (None, Some(attr)) => Err(DossierError::MissingField {
                field: format!("{name}.{attr}"),
            }),
            (Some(FieldValue::Group(_)), _) => Err(DossierError::InvalidTemplate(format!(
                "'{name}' is a list; render it with a {{%p for%}} or {{%tr for%}} loop"
            ))),
            (Some(other), Some(attr)) => Err(DossierError::InvalidTemplate(format!(
                "'{name}.{attr}': '{name}' is a {} field and has no attributes",
                other.kind()
            ))),
            (Some(FieldValue::Text(text)), None) => Ok(Resolved::Text(text.clone())),
            (Some(FieldValue::Token(token)), None) => Ok(Resolved::Text(token.as_str().to_string())),
            (Some(FieldValue::Image(image)), None) => {
                let (rel_id, media) = match self.images.get(name) {
                    Some(stored) => stored.clone(),
                    None => {
                        let stored = self.doc.add_image_part(image)?;
                        self.images.insert(name.to_string(), stored.clone());
                        stored
                    }
                };
                let id = self.doc.next_drawing_id();
                let (cx, cy) = image.extent_for_width(self.width_emu);
                Ok(Resolved::Run(crate::docx::picture::drawing_run(
                    &rel_id, id, cx, cy, &media,
                )))
            }
        }
    }
}

enum Resolved {
    Text(String),
    Run(String),
}

fn tag_of(kind: LoopKind) -> &'static str {
    match kind {
        LoopKind::Paragraph => "p",
        LoopKind::Row => "tr",
    }
}

/// Classify `xml` as a loop start or end element.
fn control(xml: &str) -> Result<Option<Control>, DossierError> {
    let name = tag_name(xml);
    if (name != "w:p" && name != "w:tr") || !xml.contains('%') {
        return Ok(None);
    }
    let text = TextRuns::parse(xml)?.text();
    if let Some(caps) = RE_LOOP.captures(&text) {
        let kind = LoopKind::parse(&caps[1]);
        if kind.element() == name {
            return Ok(Some(Control::Start {
                kind,
                var: caps[2].to_string(),
                list: caps[3].to_string(),
            }));
        }
    }
    if let Some(caps) = RE_END.captures(&text) {
        let kind = LoopKind::parse(&caps[1]);
        if kind.element() == name {
            return Ok(Some(Control::End(kind)));
        }
    }
    Ok(None)
}

/// Index of the end tag closing the loop opened at `start`.
fn matching_end(items: &[Item<'_>], start: usize, kind: LoopKind) -> Result<usize, DossierError> {
    let mut depth = 0usize;
    for (offset, item) in items[start + 1..].iter().enumerate() {
        let Item::Element(xml) = item else { continue };
        match control(xml)? {
            Some(Control::Start { kind: k, .. }) if k == kind => depth += 1,
            Some(Control::End(k)) if k == kind => {
                if depth == 0 {
                    return Ok(start + 1 + offset);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(DossierError::InvalidTemplate(format!(
        "'{{%{} for %}}' is never closed with '{{%{} endfor %}}'",
        tag_of(kind),
        tag_of(kind)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{fields, PlaceholderToken};
    use crate::docx::picture::{inches_to_emu, png_fixture, InlineImage};
    use crate::docx::testing::{docx_with_body, p};
    use crate::docx::BlockKind;

    fn render(body: &str, ctx: &FormContext) -> Result<WordDocument, DossierError> {
        let template = WordDocument::from_bytes(&docx_with_body(body)).unwrap();
        TemplateRenderer::new(inches_to_emu(6.0)).render(&template, ctx)
    }

    fn texts(doc: &WordDocument) -> Vec<String> {
        doc.blocks().iter().map(Block::text).collect()
    }

    fn partners(n: usize) -> Vec<Record> {
        (1..=n)
            .map(|i| {
                Record::new()
                    .with(fields::PARTNER_NAME, format!("Partner {i}"))
                    .with(fields::PARTNER_ROLE, format!("Role {i}"))
            })
            .collect()
    }

    #[test]
    fn scalar_split_across_runs_keeps_first_run_formatting() {
        let body = concat!(
            r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>Company: {{ comp</w:t></w:r>"#,
            r#"<w:r><w:t>any_name }}</w:t></w:r><w:r><w:t>!</w:t></w:r></w:p>"#
        );
        let mut ctx = FormContext::new();
        ctx.insert_text(fields::COMPANY_NAME, "Acme & Filhos");
        let doc = render(body, &ctx).unwrap();

        assert_eq!(texts(&doc), vec!["Company: Acme & Filhos!"]);
        let xml = doc.blocks()[0].xml();
        assert!(xml.contains("<w:b/></w:rPr><w:t xml:space=\"preserve\">Company: Acme &amp; Filhos</w:t>"));
    }

    #[test]
    fn untouched_blocks_are_byte_identical() {
        let plain = r#"<w:p w:rsidR="00AB"><w:r><w:t>no tags here</w:t></w:r></w:p>"#;
        let literal = p("Token [[INCOME_STATEMENT]] stays as text");
        let body = format!("{plain}{literal}");
        let template = WordDocument::from_bytes(&docx_with_body(&body)).unwrap();
        let doc = TemplateRenderer::new(1).render(&template, &FormContext::new()).unwrap();
        assert_eq!(doc.blocks(), template.blocks());
    }

    #[test]
    fn token_field_renders_literal() {
        let mut ctx = FormContext::new();
        ctx.insert_placeholder_tokens();
        let doc = render(&p("{{ income_statement }}"), &ctx).unwrap();
        assert_eq!(texts(&doc), vec!["[[INCOME_STATEMENT]]"]);
        let token = PlaceholderToken::new("INCOME_STATEMENT").unwrap();
        assert_eq!(doc.find_paragraph_containing(token.as_str()), Some(0));
    }

    #[test]
    fn paragraph_loop_repeats_per_record_without_bleed() {
        let body = format!(
            "{}{}{}{}{}",
            p("Partners:"),
            p("{%p for partner in partners %}"),
            p("{{ partner.name }} - {{ partner.role }}"),
            p("{%p endfor %}"),
            p("End")
        );
        for n in [0usize, 1, 3] {
            let mut ctx = FormContext::new();
            ctx.insert_group(fields::PARTNERS, partners(n));
            let doc = render(&body, &ctx).unwrap();
            let mut expected = vec!["Partners:".to_string()];
            expected.extend((1..=n).map(|i| format!("Partner {i} - Role {i}")));
            expected.push("End".to_string());
            assert_eq!(texts(&doc), expected, "n = {n}");
        }
    }

    #[test]
    fn row_loop_repeats_table_rows() {
        let row = |cells: &[&str]| {
            let cells: String = cells.iter().map(|c| format!("<w:tc>{}</w:tc>", p(c))).collect();
            format!("<w:tr>{cells}</w:tr>")
        };
        let table = format!(
            "<w:tbl><w:tblPr/>{}{}{}{}</w:tbl>",
            row(&["Name", "Role"]),
            row(&["{%tr for s in partners %}", ""]),
            row(&["{{ s.name }}", "{{ s.role }}"]),
            row(&["{%tr endfor %}", ""]),
        );
        let mut ctx = FormContext::new();
        ctx.insert_group(fields::PARTNERS, partners(2));
        let doc = render(&table, &ctx).unwrap();

        assert_eq!(doc.blocks()[0].kind(), BlockKind::Table);
        let xml = doc.blocks()[0].xml();
        assert_eq!(xml.matches("<w:tr>").count(), 3);
        assert!(xml.starts_with("<w:tbl><w:tblPr/>"));
        assert_eq!(doc.blocks()[0].text(), "NameRolePartner 1Role 1Partner 2Role 2");
    }

    #[test]
    fn loops_nest() {
        let body = format!(
            "{}{}{}{}{}{}",
            p("{%p for a in outer %}"),
            p("{{ a.name }}"),
            p("{%p for b in inner %}"),
            p("{{ a.name }}/{{ b.name }}"),
            p("{%p endfor %}"),
            p("{%p endfor %}"),
        );
        let mut ctx = FormContext::new();
        ctx.insert_group("outer", vec![Record::new().with("name", "x"), Record::new().with("name", "y")]);
        ctx.insert_group("inner", vec![Record::new().with("name", "1"), Record::new().with("name", "2")]);
        let doc = render(&body, &ctx).unwrap();
        assert_eq!(texts(&doc), vec!["x", "x/1", "x/2", "y", "y/1", "y/2"]);
    }

    #[test]
    fn image_field_becomes_inline_drawing() {
        let mut ctx = FormContext::new();
        let image = InlineImage::from_bytes(png_fixture(200, 100)).unwrap();
        ctx.insert_image(fields::BALANCE_SHEET_PART1, image);
        let body = format!("{}{}", p("{{ balance_sheet_part1 }}"), p("again {{ balance_sheet_part1 }}"));
        let doc = render(&body, &ctx).unwrap();

        let first = doc.blocks()[0].xml();
        assert!(first.contains(r#"<wp:extent cx="5486400" cy="2743200"/>"#), "{first}");
        assert!(!doc.text().contains("{{"));

        let media: Vec<_> = doc
            .package()
            .part_names()
            .filter(|n| n.starts_with("word/media/"))
            .collect();
        assert_eq!(media.len(), 1, "repeated image shares one media part");
        let ids: Vec<_> = doc
            .blocks()
            .iter()
            .filter_map(|b| crate::docx::xml::attr(&b.xml()[b.xml().find("<wp:docPr").unwrap()..], "id"))
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let err = render(&p("{{ legal_name }}"), &FormContext::new()).unwrap_err();
        assert!(matches!(err, DossierError::MissingField { ref field } if field == "legal_name"));

        let mut ctx = FormContext::new();
        ctx.insert_group(fields::PARTNERS, vec![Record::new().with("name", "A")]);
        let body = format!("{}{}{}", p("{%p for s in partners %}"), p("{{ s.tax_id }}"), p("{%p endfor %}"));
        let err = render(&body, &ctx).unwrap_err();
        assert!(matches!(err, DossierError::MissingField { ref field } if field == "s.tax_id"));
    }

    #[test]
    fn misuse_of_lists_and_tags_is_invalid() {
        let mut ctx = FormContext::new();
        ctx.insert_group(fields::PARTNERS, partners(1));
        ctx.insert_text(fields::COMPANY_NAME, "Acme");

        let cases = [
            p("{{ partners }}"),
            format!("{}{}", p("{%p for x in company_name %}"), p("{%p endfor %}")),
            format!("{}{}", p("{%p for x in partners %}"), p("{{ x.name }}")),
            p("{%p endfor %}"),
            p("{% if company_name %}"),
            p("{{ company name }}"),
            p("Dear {{ company_name"),
        ];
        for body in cases {
            let err = render(&body, &ctx).unwrap_err();
            assert!(matches!(err, DossierError::InvalidTemplate(_)), "{body}: {err:?}");
        }
    }
}
