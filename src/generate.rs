//! Dossier generation entry points.
//!
//! [`generate`] runs the whole pipeline for one request: every stage runs in
//! order, the first failure aborts the run, and the run's scratch directory
//! is removed whatever the outcome.

use crate::bundle::{InputBundle, Slot, SourceFormat};
use crate::config::{BalanceSheetMode, DossierConfig};
use crate::context::{fields, output_file_name, FieldValue, FormContext, PlaceholderToken, SPLICED_SLOTS};
use crate::docx::picture::{inches_to_emu, InlineImage};
use crate::docx::WordDocument;
use crate::error::DossierError;
use crate::pipeline::convert::{convert_auxiliary, needs_converter, ConvertContext, PandocConverter};
use crate::pipeline::materialize::{materialize, required_slots, Materialized, Scratch};
use crate::pipeline::rasterize::{extract_two_pages, PdfiumRasterizer, RenderOptions};
use crate::pipeline::splice::{splice_all, PlaceholderSplicer};
use crate::pipeline::template::{load_template, FieldResolver, TemplateRenderer};
use crate::pipeline::StageError;
use crate::progress::{ProgressCallback, Stage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// A finished dossier.
#[derive(Clone)]
pub struct Dossier {
    /// The DOCX file.
    pub bytes: Vec<u8>,
    /// Suggested download name, `Dossie_Contabil_<company>.docx`.
    pub file_name: String,
    pub stats: GenerationStats,
}

impl std::fmt::Debug for Dossier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dossier")
            .field("len", &self.bytes.len())
            .field("file_name", &self.file_name)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Time spent in one stage.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// Statistics about one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub run_id: String,
    pub stages: Vec<StageTiming>,
    /// Tokens replaced by auxiliary content.
    pub spliced: Vec<PlaceholderToken>,
    /// Tokens not found in the rendered document.
    pub unmatched_placeholders: Vec<PlaceholderToken>,
    /// Balance-sheet pages embedded (always 2).
    pub balance_sheet_pages: usize,
    pub output_bytes: usize,
    pub total_duration_ms: u64,
}

/// Stage bookkeeping: timings plus progress callbacks.
struct Stages {
    progress: Option<ProgressCallback>,
    timings: Vec<StageTiming>,
}

impl Stages {
    fn start(&self, stage: Stage) -> Instant {
        info!("{}", stage);
        if let Some(cb) = &self.progress {
            cb.on_stage_start(stage);
        }
        Instant::now()
    }

    fn finish(&mut self, stage: Stage, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.timings.push(StageTiming { stage, elapsed_ms });
        if let Some(cb) = &self.progress {
            cb.on_stage_complete(stage, elapsed_ms);
        }
    }
}

/// Run a backend's blocking `prepare` step off the async workers.
async fn prepare_backend<F>(slot: Slot, prepare: F) -> Result<(), DossierError>
where
    F: FnOnce() -> Result<(), StageError> + Send + 'static,
{
    tokio::task::spawn_blocking(prepare)
        .await
        .map_err(|e| DossierError::Generation(format!("Backend setup panicked: {e}")))?
        .map_err(|e| e.for_slot(slot))
}

async fn read_image(slot: Slot, path: &Path) -> Result<InlineImage, DossierError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| DossierError::io(&format!("Failed to read '{}'", path.display()), e))?;
    InlineImage::from_bytes(bytes).map_err(|e| DossierError::Conversion {
        slot,
        detail: e.to_string(),
    })
}

/// Generate a dossier from the uploads in `bundle` and the form `context`.
///
/// # Errors
/// Every failure is classified as a [`DossierError`]; the first one aborts
/// the run. An unmatched placeholder is only an error under
/// [`crate::config::PlaceholderPolicy::Error`].
pub async fn generate(
    bundle: &InputBundle,
    context: FormContext,
    config: &DossierConfig,
) -> Result<Dossier, DossierError> {
    let run_id = Uuid::new_v4().simple().to_string();
    let span = info_span!("dossier", run_id = %run_id);
    run(bundle, context, config, run_id).instrument(span).await
}

async fn run(
    bundle: &InputBundle,
    mut context: FormContext,
    config: &DossierConfig,
    run_id: String,
) -> Result<Dossier, DossierError> {
    let total_start = Instant::now();
    let mut stages = Stages {
        progress: config.progress_callback.clone(),
        timings: Vec::with_capacity(Stage::ALL.len()),
    };
    let width_emu = inches_to_emu(config.embed_width_inches);
    let download_timeout = Duration::from_secs(config.download_timeout_secs);
    let render = RenderOptions {
        dpi: config.dpi,
        max_pixels: config.max_rendered_pixels,
    };

    // ── Step 1: Materialize inputs ───────────────────────────────────────
    let t = stages.start(Stage::Materialize);
    let scratch = Scratch::create(config.scratch_root.as_deref(), &run_id)?;
    let required = required_slots(config.balance_sheet_mode);
    let inputs = materialize(bundle, &required, &scratch).await?;
    let template = load_template(&config.template_path)?;
    stages.finish(Stage::Materialize, t);

    // ── Step 2: Balance-sheet images ─────────────────────────────────────
    let t = stages.start(Stage::Rasterize);
    let rasterizer = config
        .rasterizer
        .clone()
        .unwrap_or_else(|| Arc::new(PdfiumRasterizer::new().with_download_timeout(download_timeout)));
    if let Some(slot) = first_pdf_slot(&inputs) {
        let (r, progress) = (Arc::clone(&rasterizer), stages.progress.clone());
        prepare_backend(slot, move || r.prepare(progress.as_ref())).await?;
    }
    let (part1, part2) = match config.balance_sheet_mode {
        BalanceSheetMode::TwoPagePdf => {
            let input = inputs.get(Slot::BalanceSheet)?;
            let (first, second) =
                extract_two_pages(Arc::clone(&rasterizer), input.path.clone(), input.slot, render).await?;
            (first.into_inline_image(), second.into_inline_image())
        }
        BalanceSheetMode::SplitImages => {
            let a = inputs.get(Slot::BalanceSheetPart1)?;
            let b = inputs.get(Slot::BalanceSheetPart2)?;
            (read_image(a.slot, &a.path).await?, read_image(b.slot, &b.path).await?)
        }
    };
    context.insert_image(fields::BALANCE_SHEET_PART1, part1);
    context.insert_image(fields::BALANCE_SHEET_PART2, part2);
    stages.finish(Stage::Rasterize, t);

    // ── Step 3: Convert auxiliary documents ──────────────────────────────
    let t = stages.start(Stage::Convert);
    let converter = config
        .converter
        .clone()
        .unwrap_or_else(|| Arc::new(PandocConverter::new().with_download_timeout(download_timeout)));
    let markup_slot = SPLICED_SLOTS
        .into_iter()
        .find(|s| inputs.get(*s).map(|i| needs_converter(i.format)).unwrap_or(false));
    if let Some(slot) = markup_slot {
        let (c, progress) = (Arc::clone(&converter), stages.progress.clone());
        prepare_backend(slot, move || c.prepare(progress.as_ref())).await?;
    }
    let convert_ctx = ConvertContext {
        converter,
        rasterizer,
        render,
        scratch_dir: scratch.path().to_path_buf(),
        reference_doc: config
            .use_template_styles
            .then(|| config.template_path.clone()),
        width_emu,
    };
    let mut auxiliary: Vec<(PlaceholderToken, WordDocument)> = Vec::with_capacity(SPLICED_SLOTS.len());
    for slot in SPLICED_SLOTS {
        let input = inputs.get(slot)?;
        let doc = convert_auxiliary(slot, &input.path, input.format, &convert_ctx).await?;
        if let Some((_, token)) = PlaceholderToken::for_slot(slot) {
            auxiliary.push((token, doc));
        }
    }
    stages.finish(Stage::Convert, t);

    // ── Step 4: Render template ──────────────────────────────────────────
    let t = stages.start(Stage::Render);
    context.insert_placeholder_tokens();
    let mut document = TemplateRenderer::new(width_emu).render(&template, &context)?;
    stages.finish(Stage::Render, t);

    // ── Step 5: Splice auxiliary documents ───────────────────────────────
    let t = stages.start(Stage::Splice);
    let report = splice_all(&PlaceholderSplicer, &mut document, &auxiliary, config.unmatched_placeholder)?;
    stages.finish(Stage::Splice, t);

    // ── Step 6: Finalize ─────────────────────────────────────────────────
    let t = stages.start(Stage::Finalize);
    let bytes = document.to_bytes()?;
    let company = match context.get(fields::COMPANY_NAME) {
        Some(FieldValue::Text(name)) => name.as_str(),
        _ => "",
    };
    let file_name = output_file_name(company);
    scratch.close();
    stages.finish(Stage::Finalize, t);

    if let Some(cb) = &stages.progress {
        cb.on_generation_complete(bytes.len());
    }
    let stats = GenerationStats {
        run_id,
        stages: stages.timings,
        spliced: report.spliced,
        unmatched_placeholders: report.unmatched,
        balance_sheet_pages: 2,
        output_bytes: bytes.len(),
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    };
    info!(
        "Dossier ready: {} ({} bytes, {} ms)",
        file_name, stats.output_bytes, stats.total_duration_ms
    );
    Ok(Dossier {
        bytes,
        file_name,
        stats,
    })
}

/// First materialized input that will be rasterized.
fn first_pdf_slot(inputs: &Materialized) -> Option<Slot> {
    inputs
        .iter()
        .find(|i| i.format == SourceFormat::Pdf)
        .map(|i| i.slot)
}

/// Synchronous wrapper around [`generate`].
///
/// Creates a temporary tokio runtime internally.
pub fn generate_sync(
    bundle: &InputBundle,
    context: FormContext,
    config: &DossierConfig,
) -> Result<Dossier, DossierError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DossierError::Generation(format!("Failed to create tokio runtime: {e}")))?
        .block_on(generate(bundle, context, config))
}

/// Generate a dossier and write it to `output`.
///
/// When `output` is an existing directory the file is written inside it under
/// [`Dossier::file_name`]. The write is atomic (temp file + rename), so a
/// failed run never leaves a partial file behind. Returns the path written.
pub async fn generate_to_file(
    bundle: &InputBundle,
    context: FormContext,
    config: &DossierConfig,
    output: impl AsRef<Path>,
) -> Result<(PathBuf, GenerationStats), DossierError> {
    let dossier = generate(bundle, context, config).await?;
    let output = output.as_ref();
    let path = if output.is_dir() {
        output.join(&dossier.file_name)
    } else {
        output.to_path_buf()
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DossierError::io(&format!("Cannot create '{}'", parent.display()), e))?;
    }
    let tmp_path = path.with_extension("docx.tmp");
    let written = match tokio::fs::write(&tmp_path, &dossier.bytes).await {
        Ok(()) => tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| DossierError::io(&format!("Failed to write '{}'", path.display()), e)),
        Err(e) => Err(DossierError::io(&format!("Failed to write '{}'", tmp_path.display()), e)),
    };
    if let Err(err) = written {
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove '{}': {}", tmp_path.display(), e);
            }
        }
        return Err(err);
    }
    Ok((path, dossier.stats))
}

/// The `(document, error)` pair form of a result: exactly one side is set.
pub fn split_outcome(result: Result<Dossier, DossierError>) -> (Option<Dossier>, Option<DossierError>) {
    match result {
        Ok(dossier) => (Some(dossier), None),
        Err(err) => (None, Some(err)),
    }
}
