//! Configuration for dossier generation.
//!
//! All generation behaviour is controlled through [`DossierConfig`], built
//! via [`DossierConfigBuilder`]. Callers set only what they care about and
//! rely on the documented defaults for the rest.

use crate::error::DossierError;
use crate::pipeline::convert::MarkupConverter;
use crate::pipeline::rasterize::PageRasterizer;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default location of the dossier template, relative to the working directory.
pub const DEFAULT_TEMPLATE_PATH: &str = "templates/dossier_template.docx";

/// Configuration for one dossier generation.
///
/// # Example
/// ```rust
/// use dossier::{DossierConfig, PlaceholderPolicy};
///
/// let config = DossierConfig::builder()
///     .template_path("assets/template.docx")
///     .dpi(150)
///     .unmatched_placeholder(PlaceholderPolicy::Error)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 150);
/// ```
#[derive(Clone)]
pub struct DossierConfig {
    /// DOCX template rendered for every run. Default: [`DEFAULT_TEMPLATE_PATH`].
    pub template_path: PathBuf,

    /// Rendering DPI for PDF pages. Range: 72–600. Default: 200.
    pub dpi: u32,

    /// Cap on either dimension of a rendered page, in pixels. Default: 4000.
    ///
    /// An A4 page at 200 DPI is about 1654 × 2339 px; the cap only bites for
    /// oversized pages.
    pub max_rendered_pixels: u32,

    /// Display width of embedded page images, in inches. Default: 6.0.
    pub embed_width_inches: f32,

    /// Where the balance sheet comes from. Default: [`BalanceSheetMode::TwoPagePdf`].
    pub balance_sheet_mode: BalanceSheetMode,

    /// What to do when a placeholder token is absent from the rendered
    /// document. Default: [`PlaceholderPolicy::Ignore`].
    pub unmatched_placeholder: PlaceholderPolicy,

    /// Pass the template to pandoc as `--reference-doc`, so converted
    /// documents use the template's styles. Default: true.
    pub use_template_styles: bool,

    /// Parent directory for per-run scratch directories. Default: the system
    /// temporary directory.
    pub scratch_root: Option<PathBuf>,

    /// Download timeout in seconds. Default: 120.
    ///
    /// Bounds the archive download when the default pdfium or pandoc backend
    /// has to install its tool. URL inputs are fetched before a run starts;
    /// pass the same value to [`load_upload`](crate::load_upload).
    pub download_timeout_secs: u64,

    /// Page rasterizer. Default: pdfium.
    pub rasterizer: Option<Arc<dyn PageRasterizer>>,

    /// Markup-to-DOCX converter. Default: pandoc.
    pub converter: Option<Arc<dyn MarkupConverter>>,

    /// Optional stage-level progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for DossierConfig {
    fn default() -> Self {
        Self {
            template_path: PathBuf::from(DEFAULT_TEMPLATE_PATH),
            dpi: 200,
            max_rendered_pixels: 4000,
            embed_width_inches: 6.0,
            balance_sheet_mode: BalanceSheetMode::default(),
            unmatched_placeholder: PlaceholderPolicy::default(),
            use_template_styles: true,
            scratch_root: None,
            download_timeout_secs: 120,
            rasterizer: None,
            converter: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for DossierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DossierConfig")
            .field("template_path", &self.template_path)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("embed_width_inches", &self.embed_width_inches)
            .field("balance_sheet_mode", &self.balance_sheet_mode)
            .field("unmatched_placeholder", &self.unmatched_placeholder)
            .field("use_template_styles", &self.use_template_styles)
            .field("scratch_root", &self.scratch_root)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("rasterizer", &self.rasterizer.as_ref().map(|r| r.name()))
            .field("converter", &self.converter.as_ref().map(|c| c.name()))
            .field("progress_callback", &self.progress_callback.as_ref().map(|_| "<dyn callback>"))
            .finish()
    }
}

impl DossierConfig {
    /// Create a new builder for `DossierConfig`.
    pub fn builder() -> DossierConfigBuilder {
        DossierConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`DossierConfig`].
#[derive(Debug)]
pub struct DossierConfigBuilder {
    config: DossierConfig,
}

impl DossierConfigBuilder {
    pub fn template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.template_path = path.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px;
        self
    }

    pub fn embed_width_inches(mut self, inches: f32) -> Self {
        self.config.embed_width_inches = inches;
        self
    }

    pub fn balance_sheet_mode(mut self, mode: BalanceSheetMode) -> Self {
        self.config.balance_sheet_mode = mode;
        self
    }

    pub fn unmatched_placeholder(mut self, policy: PlaceholderPolicy) -> Self {
        self.config.unmatched_placeholder = policy;
        self
    }

    pub fn use_template_styles(mut self, v: bool) -> Self {
        self.config.use_template_styles = v;
        self
    }

    pub fn scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(dir.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.config.rasterizer = Some(rasterizer);
        self
    }

    pub fn converter(mut self, converter: Arc<dyn MarkupConverter>) -> Self {
        self.config.converter = Some(converter);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<DossierConfig, DossierError> {
        let c = &self.config;
        if !(72..=600).contains(&c.dpi) {
            return Err(DossierError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.max_rendered_pixels < 100 {
            return Err(DossierError::InvalidConfig(format!(
                "max_rendered_pixels must be ≥ 100, got {}",
                c.max_rendered_pixels
            )));
        }
        if !(c.embed_width_inches > 0.0 && c.embed_width_inches <= 20.0) {
            return Err(DossierError::InvalidConfig(format!(
                "Embed width must be between 0 and 20 inches, got {}",
                c.embed_width_inches
            )));
        }
        if c.download_timeout_secs == 0 {
            return Err(DossierError::InvalidConfig(
                "Download timeout must be ≥ 1 second".into(),
            ));
        }
        if c.template_path.as_os_str().is_empty() {
            return Err(DossierError::InvalidConfig("Template path is empty".into()));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the two balance-sheet pages are supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSheetMode {
    /// One PDF (`balance_sheet` slot); pages 1 and 2 are rasterized. (default)
    #[default]
    TwoPagePdf,
    /// Two pre-rasterized images (`balance_sheet_part1`/`balance_sheet_part2`).
    SplitImages,
}

/// Behaviour when a placeholder token is not found in the rendered document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderPolicy {
    /// Skip the splice, log a warning and report it in the stats. (default)
    #[default]
    Ignore,
    /// Fail with [`DossierError::UnmatchedPlaceholder`].
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = DossierConfig::builder().build().unwrap();
        assert_eq!(c.dpi, 200);
        assert_eq!(c.embed_width_inches, 6.0);
        assert_eq!(c.template_path, PathBuf::from(DEFAULT_TEMPLATE_PATH));
        assert_eq!(c.balance_sheet_mode, BalanceSheetMode::TwoPagePdf);
        assert_eq!(c.unmatched_placeholder, PlaceholderPolicy::Ignore);
        assert!(c.use_template_styles);
    }

    #[test]
    fn dpi_out_of_range_is_rejected() {
        let err = DossierConfig::builder().dpi(40).build().unwrap_err();
        assert!(matches!(err, DossierError::InvalidConfig(_)));
        assert!(DossierConfig::builder().dpi(601).build().is_err());
        assert!(DossierConfig::builder().dpi(600).build().is_ok());
    }

    #[test]
    fn bad_width_and_timeout_are_rejected() {
        assert!(DossierConfig::builder().embed_width_inches(0.0).build().is_err());
        assert!(DossierConfig::builder().embed_width_inches(f32::NAN).build().is_err());
        assert!(DossierConfig::builder().download_timeout_secs(0).build().is_err());
        assert!(DossierConfig::builder().template_path("").build().is_err());
    }

    #[test]
    fn policy_parses_from_json() {
        let p: PlaceholderPolicy = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(p, PlaceholderPolicy::Error);
        let m: BalanceSheetMode = serde_json::from_str("\"split_images\"").unwrap();
        assert_eq!(m, BalanceSheetMode::SplitImages);
    }

    #[test]
    fn debug_hides_trait_objects() {
        let c = DossierConfig::default();
        let s = format!("{c:?}");
        assert!(s.contains("dpi: 200"));
        assert!(s.contains("rasterizer: None"));
    }
}
