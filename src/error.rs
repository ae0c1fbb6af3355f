//! Error types for the dossier library.
//!
//! Every stage failure is converted into one [`DossierError`] variant at the
//! pipeline boundary. Each message states what failed, why, and what the
//! caller can do about it, so the CLI (or any other front end) can show it
//! verbatim.
//!
//! Two conditions are *not* errors: a placeholder token that is
//! absent from the rendered document (unless
//! [`crate::config::PlaceholderPolicy::Error`] is configured) and failures
//! while deleting scratch files.

use crate::bundle::Slot;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the dossier library.
#[derive(Debug, Error)]
pub enum DossierError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// A slot required by the active pipeline variant is absent or empty.
    #[error("The '{slot}' file is required but was not provided.\nUpload it and generate again.")]
    MissingInput { slot: Slot },

    /// A PDF has fewer pages than a fixed-position extraction needs.
    #[error(
        "The '{slot}' PDF must have at least {required} pages, but it has {found}.\n\
Upload the complete document."
    )]
    InsufficientPages {
        slot: Slot,
        required: usize,
        found: usize,
    },

    /// Form data could not be turned into a template context.
    #[error("Invalid form data: {0}")]
    InvalidForm(String),

    /// A local input file does not exist.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// An HTTP input could not be fetched.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    // ── Conversion errors ─────────────────────────────────────────────────
    /// An external tool is missing and the one-time remediation failed.
    #[error(
        "{tool} is required but is not available: {detail}\n\
Install it and make sure it is on PATH, or point {hint} at an existing copy."
    )]
    ConverterUnavailable {
        tool: String,
        hint: String,
        detail: String,
    },

    /// Source content could not be converted (corrupt PDF, unsupported layout,
    /// converter exit failure).
    #[error("Could not convert '{slot}': {detail}")]
    Conversion { slot: Slot, detail: String },

    // ── Template errors ───────────────────────────────────────────────────
    /// The template asset is missing: a deployment problem, not a per-request one.
    #[error(
        "DOCX template not found at '{path}'.\n\
Make sure the template is deployed, or set DOSSIER_TEMPLATE to its location."
    )]
    TemplateNotFound { path: PathBuf },

    /// The template references a field the form context does not provide.
    #[error("The template uses the field '{field}', but the form data does not provide it.")]
    MissingField { field: String },

    /// The template (or an auxiliary document) is not a usable DOCX, or its
    /// tags are malformed.
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// A placeholder token was not found and the policy says this is fatal.
    #[error(
        "Placeholder '{token}' was not found in the rendered document.\n\
Add it to the template or switch the unmatched-placeholder policy to 'ignore'."
    )]
    UnmatchedPlaceholder { token: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Any other failure, carrying the original message.
    #[error("Error during generation: {0}")]
    Generation(String),
}

impl DossierError {
    /// The input slot this error is about, when there is one.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            DossierError::MissingInput { slot }
            | DossierError::InsufficientPages { slot, .. }
            | DossierError::Conversion { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        DossierError::Generation(format!("{context}: {err}"))
    }
}
