//! Placeholder splicing: put whole auxiliary documents where the rendered
//! template holds their tokens.
//!
//! The paragraph holding a token keeps its surrounding text; only the token
//! substrings are removed. The auxiliary body is inserted right after that
//! paragraph, with its images, hyperlinks, styles and list numbering carried
//! over by [`crate::docx::merge`].

use crate::config::PlaceholderPolicy;
use crate::context::PlaceholderToken;
use crate::docx::merge::import_body;
use crate::docx::runs::{Replacement, TextRuns};
use crate::docx::{Block, WordDocument};
use crate::error::DossierError;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Replaces a placeholder token with document content.
pub trait PlaceholderResolver {
    /// Splice `content` at the first paragraph holding `token`. Returns
    /// `false` when no paragraph holds it.
    fn splice(
        &self,
        doc: &mut WordDocument,
        token: &PlaceholderToken,
        content: &WordDocument,
    ) -> Result<bool, DossierError>;
}

/// Default [`PlaceholderResolver`] working on top-level body paragraphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaceholderSplicer;

impl PlaceholderResolver for PlaceholderSplicer {
    fn splice(
        &self,
        doc: &mut WordDocument,
        token: &PlaceholderToken,
        content: &WordDocument,
    ) -> Result<bool, DossierError> {
        let Some(index) = doc.find_paragraph_containing(token.as_str()) else {
            return Ok(false);
        };

        let mut runs = TextRuns::parse(doc.blocks()[index].xml())?;
        let text = runs.text();
        let len = token.as_str().len();
        // Back to front, so earlier offsets stay valid.
        let starts: Vec<usize> = text.match_indices(token.as_str()).map(|(i, _)| i).collect();
        for start in starts.into_iter().rev() {
            runs.replace(start..start + len, Replacement::Text(""));
        }
        doc.replace_block(index, Block::new(runs.to_xml()));

        let blocks = import_body(doc, content)?;
        debug!("Splicing {} block(s) at {} (block {})", blocks.len(), token, index);
        doc.insert_blocks_after(index, blocks);
        Ok(true)
    }
}

/// Outcome of [`splice_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpliceReport {
    pub spliced: Vec<PlaceholderToken>,
    pub unmatched: Vec<PlaceholderToken>,
}

/// Splice every `(token, content)` pair in order.
pub fn splice_all(
    resolver: &dyn PlaceholderResolver,
    doc: &mut WordDocument,
    items: &[(PlaceholderToken, WordDocument)],
    policy: PlaceholderPolicy,
) -> Result<SpliceReport, DossierError> {
    let mut report = SpliceReport::default();
    for (token, content) in items {
        if resolver.splice(doc, token, content)? {
            info!("Spliced {} ({} blocks)", token, content.blocks().len());
            report.spliced.push(token.clone());
            continue;
        }
        match policy {
            PlaceholderPolicy::Ignore => {
                warn!("Placeholder {} not found in the rendered document; skipping", token);
                report.unmatched.push(token.clone());
            }
            PlaceholderPolicy::Error => {
                return Err(DossierError::UnmatchedPlaceholder {
                    token: token.to_string(),
                })
            }
        }
    }
    Ok(report)
}
