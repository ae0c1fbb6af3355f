//! Pipeline stages for dossier generation.
//!
//! Each submodule implements one step; [`crate::generate`] chains them.
//!
//! ## Data Flow
//!
//! ```text
//! materialize ──▶ rasterize ──▶ convert ──▶ template ──▶ splice ──▶ bytes
//!  (scratch dir)   (pdfium)     (pandoc)    (context)    (tokens)
//! ```
//!
//! 1. [`materialize`]: reject incomplete bundles, then write uploads into a
//!    run-scoped scratch directory
//! 2. [`rasterize`]: render balance-sheet pages to PNG; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`convert`]: turn every auxiliary upload into a DOCX document
//! 4. [`template`]: fill the template's tags from the form context
//! 5. [`splice`]: replace placeholder paragraphs with auxiliary bodies
//!
//! [`availability`] memoizes the locate-or-install step for the external
//! tools used by stages 2 and 3.

pub mod availability;
pub mod convert;
pub mod materialize;
pub mod rasterize;
pub mod splice;
pub mod template;

use crate::bundle::Slot;
use crate::error::DossierError;
use thiserror::Error;

/// Failure reported by a pluggable backend (rasterizer or converter).
///
/// Backends do not know which slot they are working on; the pipeline adds
/// that context with [`StageError::for_slot`].
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The external tool is missing and could not be installed.
    #[error("{tool} is not available: {detail}")]
    Unavailable {
        tool: String,
        hint: String,
        detail: String,
    },

    /// The tool ran but could not process the input.
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    pub fn failed(detail: impl Into<String>) -> Self {
        StageError::Failed(detail.into())
    }

    /// Attach the slot being processed.
    pub fn for_slot(self, slot: Slot) -> DossierError {
        match self {
            StageError::Unavailable { tool, hint, detail } => {
                DossierError::ConverterUnavailable { tool, hint, detail }
            }
            StageError::Failed(detail) => DossierError::Conversion { slot, detail },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_carry_the_slot() {
        let e = StageError::failed("bad xref table").for_slot(Slot::IncomeStatement);
        assert!(matches!(
            e,
            DossierError::Conversion { slot: Slot::IncomeStatement, ref detail } if detail == "bad xref table"
        ));
    }

    #[test]
    fn unavailable_maps_to_converter_unavailable() {
        let e = StageError::Unavailable {
            tool: "pandoc".into(),
            hint: "PANDOC_PATH".into(),
            detail: "offline".into(),
        }
        .for_slot(Slot::ExplanatoryNotes);
        assert!(matches!(e, DossierError::ConverterUnavailable { .. }));
        assert_eq!(e.slot(), None);
    }
}
