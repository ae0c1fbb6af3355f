//! PDF rasterisation: render pages to PNG via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and not
//! async-aware. [`extract_two_pages`] and [`extract_all_pages`] move the work
//! onto tokio's blocking pool so the runtime's worker threads never stall.

use super::availability::{pdfium_availability, ToolAvailability, DEFAULT_DOWNLOAD_TIMEOUT};
use super::StageError;
use crate::bundle::Slot;
use crate::docx::picture::InlineImage;
use crate::error::DossierError;
use crate::progress::ProgressCallback;
use image::ImageFormat;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Resolution settings for one render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_pixels: u32,
}

/// One rendered page, PNG-encoded.
#[derive(Clone)]
pub struct RasterPage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for RasterPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterPage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("png_len", &self.png.len())
            .finish()
    }
}

impl RasterPage {
    pub fn into_inline_image(self) -> InlineImage {
        InlineImage {
            bytes: self.png,
            width_px: self.width,
            height_px: self.height,
            format: ImageFormat::Png,
        }
    }
}

/// Turns PDF pages into images.
///
/// Calls are blocking; the pipeline runs them on tokio's blocking pool.
pub trait PageRasterizer: Send + Sync {
    fn name(&self) -> &str;

    /// Make the backend ready (e.g. install a missing library). Called once
    /// per run before the first page is rendered.
    fn prepare(&self, progress: Option<&ProgressCallback>) -> Result<(), StageError> {
        let _ = progress;
        Ok(())
    }

    fn page_count(&self, pdf: &Path) -> Result<usize, StageError>;

    /// Render the 0-based `indices`, in the given order.
    fn render_pages(
        &self,
        pdf: &Path,
        indices: &[usize],
        options: RenderOptions,
    ) -> Result<Vec<RasterPage>, StageError>;
}

// ── pdfium backend ──────────────────────────────────────────────────────────

/// Default rasterizer backed by `pdfium-render`.
///
/// The library path is memoized by a [`ToolAvailability`], the process-wide
/// [`pdfium_availability`] unless another is injected; the binding itself is
/// cheap and made per call so it never crosses threads.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    availability: Arc<ToolAvailability>,
    download_timeout: Duration,
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self::with_availability(pdfium_availability())
    }

    pub fn with_availability(availability: Arc<ToolAvailability>) -> Self {
        Self {
            availability,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Bound on downloading pdfium when it has to be installed.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn availability(&self) -> &Arc<ToolAvailability> {
        &self.availability
    }

    /// Bind the pdfium library, locating or installing it on first use.
    fn pdfium(&self, progress: Option<&ProgressCallback>) -> Result<Pdfium, StageError> {
        let lib = self.availability.ensure_with(progress, self.download_timeout)?;
        tool_auto::bind_pdfium_from_path(&lib).map_err(|e| StageError::Unavailable {
            tool: "pdfium".into(),
            hint: tool_auto::Tool::Pdfium.override_var().into(),
            detail: e.to_string(),
        })
    }
}

fn load<'a>(pdfium: &'a Pdfium, pdf: &Path) -> Result<PdfDocument<'a>, StageError> {
    pdfium
        .load_pdf_from_file(pdf, None)
        .map_err(|e| StageError::failed(format!("cannot open PDF: {e:?}")))
}

impl PageRasterizer for PdfiumRasterizer {
    fn name(&self) -> &str {
        "pdfium"
    }

    fn prepare(&self, progress: Option<&ProgressCallback>) -> Result<(), StageError> {
        self.pdfium(progress).map(|_| ())
    }

    fn page_count(&self, pdf: &Path) -> Result<usize, StageError> {
        let pdfium = self.pdfium(None)?;
        let document = load(&pdfium, pdf)?;
        Ok(document.pages().len() as usize)
    }

    fn render_pages(
        &self,
        pdf: &Path,
        indices: &[usize],
        options: RenderOptions,
    ) -> Result<Vec<RasterPage>, StageError> {
        let pdfium = self.pdfium(None)?;
        let document = load(&pdfium, pdf)?;
        let pages = document.pages();
        let total = pages.len() as usize;

        let max = options.max_pixels as i32;
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(options.dpi as f32 / 72.0)
            .set_maximum_width(max)
            .set_maximum_height(max);

        let mut out = Vec::with_capacity(indices.len());
        for &idx in indices {
            if idx >= total {
                return Err(StageError::failed(format!(
                    "page {} requested but the PDF has {} page(s)",
                    idx + 1,
                    total
                )));
            }
            let page = pages
                .get(idx as u16)
                .map_err(|e| StageError::failed(format!("page {}: {e:?}", idx + 1)))?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| StageError::failed(format!("page {}: {e:?}", idx + 1)))?;
            let image = bitmap.as_image();
            let (width, height) = (image.width(), image.height());

            let mut png = Vec::new();
            image
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .map_err(|e| StageError::failed(format!("page {}: PNG encoding failed: {e}", idx + 1)))?;
            debug!("Rendered page {} → {}x{} px", idx + 1, width, height);
            out.push(RasterPage { png, width, height });
        }
        Ok(out)
    }
}

// ── Extraction helpers ──────────────────────────────────────────────────────

async fn blocking<T, F>(f: F) -> Result<T, DossierError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DossierError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DossierError::Generation(format!("Render task panicked: {e}")))?
}

/// Reject pages a custom rasterizer returned without pixels.
fn check_dimensions(slot: Slot, pages: &[RasterPage]) -> Result<(), DossierError> {
    match pages.iter().position(|p| p.width == 0 || p.height == 0) {
        Some(i) => Err(DossierError::Conversion {
            slot,
            detail: format!(
                "rasterizer returned an empty page {} ({}x{} px)",
                i + 1,
                pages[i].width,
                pages[i].height
            ),
        }),
        None => Ok(()),
    }
}

/// Pages 1 and 2 of `pdf`, which must have at least two pages.
pub async fn extract_two_pages(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: PathBuf,
    slot: Slot,
    options: RenderOptions,
) -> Result<(RasterPage, RasterPage), DossierError> {
    blocking(move || {
        let found = rasterizer.page_count(&pdf).map_err(|e| e.for_slot(slot))?;
        if found < 2 {
            return Err(DossierError::InsufficientPages {
                slot,
                required: 2,
                found,
            });
        }
        let pages = rasterizer
            .render_pages(&pdf, &[0, 1], options)
            .map_err(|e| e.for_slot(slot))?;
        check_dimensions(slot, &pages)?;
        let mut pages = pages.into_iter();
        match (pages.next(), pages.next()) {
            (Some(first), Some(second)) => {
                info!("Rendered 2 of {} pages of '{}'", found, slot);
                Ok((first, second))
            }
            _ => Err(DossierError::Conversion {
                slot,
                detail: "rasterizer returned fewer pages than requested".into(),
            }),
        }
    })
    .await
}

/// Every page of `pdf`, in document order.
pub async fn extract_all_pages(
    rasterizer: Arc<dyn PageRasterizer>,
    pdf: PathBuf,
    slot: Slot,
    options: RenderOptions,
) -> Result<Vec<RasterPage>, DossierError> {
    blocking(move || {
        let total = rasterizer.page_count(&pdf).map_err(|e| e.for_slot(slot))?;
        if total == 0 {
            return Err(DossierError::Conversion {
                slot,
                detail: "the PDF has no pages".into(),
            });
        }
        let indices: Vec<usize> = (0..total).collect();
        let pages = rasterizer
            .render_pages(&pdf, &indices, options)
            .map_err(|e| e.for_slot(slot))?;
        if pages.len() != total {
            return Err(DossierError::Conversion {
                slot,
                detail: format!("rasterizer returned {} of {} pages", pages.len(), total),
            });
        }
        check_dimensions(slot, &pages)?;
        info!("Rendered {} page(s) of '{}'", total, slot);
        Ok(pages)
    })
    .await
}

#[cfg(test)]
pub(crate) mod testing {
    //! A rasterizer that needs no pdfium: the "PDF" is a text file holding
    //! the page count.

    use super::*;
    use crate::docx::picture::png_fixture;

    #[derive(Debug, Default)]
    pub struct FakeRasterizer;

    impl PageRasterizer for FakeRasterizer {
        fn name(&self) -> &str {
            "fake"
        }

        fn page_count(&self, pdf: &Path) -> Result<usize, StageError> {
            let text = std::fs::read_to_string(pdf).map_err(|e| StageError::failed(e.to_string()))?;
            text.trim_start_matches("%PDF")
                .trim()
                .parse()
                .map_err(|_| StageError::failed("corrupt PDF"))
        }

        fn render_pages(
            &self,
            _pdf: &Path,
            indices: &[usize],
            options: RenderOptions,
        ) -> Result<Vec<RasterPage>, StageError> {
            // Page index goes into the width so callers can check the order.
            Ok(indices
                .iter()
                .map(|&i| {
                    let width = 10 + i as u32;
                    let height = options.dpi / 10;
                    RasterPage {
                        png: png_fixture(width, height),
                        width,
                        height,
                    }
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeRasterizer;
    use super::*;

    const OPTS: RenderOptions = RenderOptions {
        dpi: 200,
        max_pixels: 4000,
    };

    fn pdf_with_pages(dir: &Path, n: usize) -> PathBuf {
        let path = dir.join(format!("doc{n}.pdf"));
        std::fs::write(&path, format!("%PDF {n}")).unwrap();
        path
    }

    #[tokio::test]
    async fn two_pages_are_first_and_second() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = extract_two_pages(
            Arc::new(FakeRasterizer),
            pdf_with_pages(dir.path(), 5),
            Slot::BalanceSheet,
            OPTS,
        )
        .await
        .unwrap();
        assert_eq!((a.width, b.width), (10, 11));
        assert_eq!(a.height, 20);
    }

    #[tokio::test]
    async fn single_page_pdf_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_two_pages(
            Arc::new(FakeRasterizer),
            pdf_with_pages(dir.path(), 1),
            Slot::BalanceSheet,
            OPTS,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DossierError::InsufficientPages { slot: Slot::BalanceSheet, required: 2, found: 1 }
        ));
    }

    #[tokio::test]
    async fn all_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pages = extract_all_pages(
            Arc::new(FakeRasterizer),
            pdf_with_pages(dir.path(), 3),
            Slot::IncomeStatement,
            OPTS,
        )
        .await
        .unwrap();
        let widths: Vec<_> = pages.iter().map(|p| p.width).collect();
        assert_eq!(widths, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn empty_and_corrupt_pdfs_are_conversion_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_all_pages(
            Arc::new(FakeRasterizer),
            pdf_with_pages(dir.path(), 0),
            Slot::IncomeStatement,
            OPTS,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DossierError::Conversion { slot: Slot::IncomeStatement, .. }));

        let corrupt = dir.path().join("bad.pdf");
        std::fs::write(&corrupt, "garbage").unwrap();
        let err = extract_all_pages(Arc::new(FakeRasterizer), corrupt, Slot::IncomeStatement, OPTS)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corrupt PDF"), "got: {err}");
    }

    #[tokio::test]
    async fn pages_without_pixels_are_conversion_errors() {
        struct Blank;
        impl PageRasterizer for Blank {
            fn name(&self) -> &str {
                "blank"
            }
            fn page_count(&self, _pdf: &Path) -> Result<usize, StageError> {
                Ok(2)
            }
            fn render_pages(
                &self,
                _pdf: &Path,
                indices: &[usize],
                _options: RenderOptions,
            ) -> Result<Vec<RasterPage>, StageError> {
                Ok(indices
                    .iter()
                    .map(|&i| RasterPage {
                        png: Vec::new(),
                        width: if i == 0 { 10 } else { 0 },
                        height: 10,
                    })
                    .collect())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pdf = pdf_with_pages(dir.path(), 2);
        let err = extract_two_pages(Arc::new(Blank), pdf.clone(), Slot::BalanceSheet, OPTS)
            .await
            .unwrap_err();
        match err {
            DossierError::Conversion { slot, detail } => {
                assert_eq!(slot, Slot::BalanceSheet);
                assert!(detail.contains("empty page 2"), "{detail}");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = extract_all_pages(Arc::new(Blank), pdf, Slot::IncomeStatement, OPTS)
            .await
            .unwrap_err();
        assert!(matches!(err, DossierError::Conversion { slot: Slot::IncomeStatement, .. }));
    }

    #[test]
    fn raster_page_becomes_png_inline_image() {
        let page = RasterPage {
            png: crate::docx::picture::png_fixture(3, 4),
            width: 3,
            height: 4,
        };
        let img = page.into_inline_image();
        assert_eq!(img.format, ImageFormat::Png);
        assert_eq!(img.extent_for_width(300), (300, 400));
    }
}
