//! # dossier
//!
//! Assemble an accounting dossier (DOCX) from a template, structured form
//! data and the supporting documents a client uploads.
//!
//! ## Why this crate?
//!
//! A dossier mixes three kinds of content: company facts typed into a form,
//! two balance-sheet pages that only exist as a PDF, and whole documents
//! (income statement, explanatory notes, liability letter) in whatever format
//! the client had at hand. This crate renders the form data into a fixed
//! DOCX template, embeds the balance-sheet pages as images and splices each
//! supporting document in at its placeholder, producing one Word file.
//!
//! ## Pipeline Overview
//!
//! ```text
//! InputBundle + FormContext
//!  │
//!  ├─ 1. Materialize  check slots, copy uploads into a per-run scratch dir
//!  ├─ 2. Rasterize    balance-sheet pages 1–2 → PNG via pdfium (spawn_blocking)
//!  ├─ 3. Convert      Markdown/text/HTML/ODT → DOCX via pandoc; PDFs → images
//!  ├─ 4. Render       fill {{ tags }} and {%p/tr for %} loops in the template
//!  ├─ 5. Splice       replace [[TOKENS]] with the converted documents
//!  └─ 6. Finalize     DOCX bytes + Dossie_Contabil_<company>.docx
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dossier::{generate, DossierConfig, FormInput, InputBundle, Slot, Upload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let form = FormInput::from_json(&std::fs::read_to_string("form.json")?)?;
//!     let bundle = InputBundle::new()
//!         .with(Slot::BalanceSheet, Upload::new("balanco.pdf", std::fs::read("balanco.pdf")?))
//!         .with(Slot::IncomeStatement, Upload::new("dre.pdf", std::fs::read("dre.pdf")?))
//!         .with(Slot::ExplanatoryNotes, Upload::new("notas.md", std::fs::read("notas.md")?))
//!         .with(Slot::LiabilityLetter, Upload::new("carta.docx", std::fs::read("carta.docx")?));
//!
//!     let config = DossierConfig::builder()
//!         .template_path("templates/dossier_template.docx")
//!         .build()?;
//!     let dossier = generate(&bundle, form.into_context()?, &config).await?;
//!     std::fs::write(&dossier.file_name, &dossier.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `dossier` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! dossier = { version = "0.1", default-features = false }
//! ```
//!
//! ## External tools
//!
//! pdfium (PDF rasterisation) and pandoc (markup conversion) are located on
//! first use and downloaded once per process when missing; see
//! [`pipeline::availability`]. Both backends sit behind traits
//! ([`PageRasterizer`], [`MarkupConverter`]) and can be replaced through
//! [`DossierConfig`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod bundle;
pub mod config;
pub mod context;
pub mod docx;
pub mod error;
pub mod generate;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use bundle::{load_upload, InputBundle, SourceFormat, Slot, Upload};
pub use config::{BalanceSheetMode, DossierConfig, DossierConfigBuilder, PlaceholderPolicy};
pub use context::{
    fields, output_file_name, FieldValue, FiscalPeriod, FormContext, FormInput, Partner,
    PlaceholderToken, Record,
};
pub use docx::picture::InlineImage;
pub use docx::WordDocument;
pub use error::DossierError;
pub use generate::{
    generate, generate_sync, generate_to_file, split_outcome, Dossier, GenerationStats, StageTiming,
};
pub use pipeline::convert::{MarkupConverter, PandocConverter};
pub use pipeline::rasterize::{PageRasterizer, PdfiumRasterizer, RasterPage, RenderOptions};
pub use pipeline::splice::{PlaceholderResolver, PlaceholderSplicer};
pub use pipeline::template::{FieldResolver, TemplateRenderer};
pub use pipeline::StageError;
pub use progress::{GenerationProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
