//! Auxiliary conversion: turn every auxiliary upload into a [`WordDocument`].
//!
//! | Source                          | Result                                 |
//! |---------------------------------|----------------------------------------|
//! | Markdown, text, HTML, ODT       | DOCX produced by a [`MarkupConverter`] |
//! | DOCX                            | loaded as-is                           |
//! | PDF                             | one image paragraph per page           |
//! | PNG, JPEG                       | one image paragraph                    |

use super::availability::{pandoc_availability, ToolAvailability, DEFAULT_DOWNLOAD_TIMEOUT};
use super::rasterize::{extract_all_pages, PageRasterizer, RenderOptions};
use super::StageError;
use crate::bundle::{SourceFormat, Slot};
use crate::docx::picture::InlineImage;
use crate::docx::WordDocument;
use crate::error::DossierError;
use crate::progress::ProgressCallback;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Converts a markup file into a DOCX file.
///
/// Calls are blocking; the pipeline runs them on tokio's blocking pool.
pub trait MarkupConverter: Send + Sync {
    fn name(&self) -> &str;

    /// Make the backend ready. Called once per run, before the first
    /// conversion, only when some input needs this converter.
    fn prepare(&self, progress: Option<&ProgressCallback>) -> Result<(), StageError> {
        let _ = progress;
        Ok(())
    }

    /// Write a DOCX rendition of `input` to `output`. When `reference_doc` is
    /// set, its styles are used for the result.
    fn convert(
        &self,
        input: &Path,
        format: SourceFormat,
        output: &Path,
        reference_doc: Option<&Path>,
    ) -> Result<(), StageError>;
}

/// Default converter: the `pandoc` executable.
///
/// Shares the process-wide [`pandoc_availability`] unless built with
/// [`with_availability`](Self::with_availability).
#[derive(Debug, Clone)]
pub struct PandocConverter {
    availability: Arc<ToolAvailability>,
    download_timeout: Duration,
}

impl Default for PandocConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl PandocConverter {
    pub fn new() -> Self {
        Self::with_availability(pandoc_availability())
    }

    pub fn with_availability(availability: Arc<ToolAvailability>) -> Self {
        Self {
            availability,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Bound on downloading pandoc when it has to be installed.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    pub fn availability(&self) -> &Arc<ToolAvailability> {
        &self.availability
    }

    fn reader(format: SourceFormat) -> Result<&'static str, StageError> {
        match format {
            // Plain text goes through the Markdown reader so blank lines still
            // separate paragraphs.
            SourceFormat::Markdown | SourceFormat::PlainText => Ok("markdown"),
            SourceFormat::Html => Ok("html"),
            SourceFormat::Odt => Ok("odt"),
            other => Err(StageError::failed(format!(
                "pandoc does not convert .{} files here",
                other.extension()
            ))),
        }
    }
}

impl MarkupConverter for PandocConverter {
    fn name(&self) -> &str {
        "pandoc"
    }

    fn prepare(&self, progress: Option<&ProgressCallback>) -> Result<(), StageError> {
        self.availability
            .ensure_with(progress, self.download_timeout)
            .map(|_| ())
    }

    fn convert(
        &self,
        input: &Path,
        format: SourceFormat,
        output: &Path,
        reference_doc: Option<&Path>,
    ) -> Result<(), StageError> {
        let pandoc = self.availability.ensure_with(None, self.download_timeout)?;
        let reader = Self::reader(format)?;

        let mut cmd = Command::new(&pandoc);
        cmd.arg(input).args(["-f", reader, "-t", "docx", "-o"]).arg(output);
        if let Some(reference) = reference_doc {
            cmd.arg(format!("--reference-doc={}", reference.display()));
        }
        debug!("pandoc command: {:?}", cmd);

        let out = cmd
            .output()
            .map_err(|e| StageError::failed(format!("failed to run {}: {e}", pandoc.display())))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(StageError::failed(format!(
                "pandoc exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        if !output.is_file() {
            return Err(StageError::failed("pandoc produced no output file"));
        }
        Ok(())
    }
}

/// Everything [`convert_auxiliary`] needs besides the input itself.
#[derive(Clone)]
pub struct ConvertContext {
    pub converter: Arc<dyn MarkupConverter>,
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub render: RenderOptions,
    /// Directory converted files are written to.
    pub scratch_dir: PathBuf,
    /// Style source passed to the converter.
    pub reference_doc: Option<PathBuf>,
    /// Display width of embedded page images.
    pub width_emu: u64,
}

impl std::fmt::Debug for ConvertContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertContext")
            .field("converter", &self.converter.name())
            .field("rasterizer", &self.rasterizer.name())
            .field("render", &self.render)
            .field("scratch_dir", &self.scratch_dir)
            .field("reference_doc", &self.reference_doc)
            .field("width_emu", &self.width_emu)
            .finish()
    }
}

/// `true` when `format` goes through the [`MarkupConverter`].
pub fn needs_converter(format: SourceFormat) -> bool {
    matches!(
        format,
        SourceFormat::Markdown | SourceFormat::PlainText | SourceFormat::Html | SourceFormat::Odt
    )
}

fn read_docx(slot: Slot, bytes: &[u8]) -> Result<WordDocument, DossierError> {
    WordDocument::from_bytes(bytes).map_err(|e| DossierError::Conversion {
        slot,
        detail: format!("not a usable DOCX: {e}"),
    })
}

async fn read_file(slot: Slot, path: &Path) -> Result<Vec<u8>, DossierError> {
    tokio::fs::read(path).await.map_err(|e| DossierError::Conversion {
        slot,
        detail: format!("cannot read '{}': {e}", path.display()),
    })
}

fn image_document(
    slot: Slot,
    images: impl IntoIterator<Item = InlineImage>,
    width_emu: u64,
) -> Result<WordDocument, DossierError> {
    let mut doc = WordDocument::blank();
    for image in images {
        let block = doc
            .image_paragraph(&image, width_emu)
            .map_err(|e| DossierError::Conversion {
                slot,
                detail: e.to_string(),
            })?;
        doc.push_block(block);
    }
    Ok(doc)
}

/// Convert the auxiliary input at `path` into a DOCX document.
pub async fn convert_auxiliary(
    slot: Slot,
    path: &Path,
    format: SourceFormat,
    ctx: &ConvertContext,
) -> Result<WordDocument, DossierError> {
    let doc = match format {
        f if needs_converter(f) => {
            let output = ctx.scratch_dir.join(format!("{}.converted.docx", slot.as_str()));
            let converter = Arc::clone(&ctx.converter);
            let input = path.to_path_buf();
            let out = output.clone();
            let reference = ctx.reference_doc.clone();
            tokio::task::spawn_blocking(move || {
                converter.convert(&input, f, &out, reference.as_deref())
            })
            .await
            .map_err(|e| DossierError::Generation(format!("Conversion task panicked: {e}")))?
            .map_err(|e| e.for_slot(slot))?;
            read_docx(slot, &read_file(slot, &output).await?)?
        }
        SourceFormat::Docx => read_docx(slot, &read_file(slot, path).await?)?,
        SourceFormat::Pdf => {
            let pages = extract_all_pages(
                Arc::clone(&ctx.rasterizer),
                path.to_path_buf(),
                slot,
                ctx.render,
            )
            .await?;
            image_document(
                slot,
                pages.into_iter().map(|p| p.into_inline_image()),
                ctx.width_emu,
            )?
        }
        _ => {
            let image = InlineImage::from_bytes(read_file(slot, path).await?).map_err(|e| {
                DossierError::Conversion {
                    slot,
                    detail: e.to_string(),
                }
            })?;
            image_document(slot, [image], ctx.width_emu)?
        }
    };
    info!(
        "Converted '{}' ({}) into {} block(s)",
        slot,
        format.extension(),
        doc.blocks().len()
    );
    Ok(doc)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeConverter;
    use super::*;
    use crate::docx::picture::{inches_to_emu, png_fixture};
    use crate::docx::testing::{docx_with_body, p};
    use crate::pipeline::rasterize::testing::FakeRasterizer;

    fn ctx(dir: &Path) -> ConvertContext {
        ConvertContext {
            converter: Arc::new(FakeConverter),
            rasterizer: Arc::new(FakeRasterizer),
            render: RenderOptions {
                dpi: 200,
                max_pixels: 4000,
            },
            scratch_dir: dir.to_path_buf(),
            reference_doc: None,
            width_emu: inches_to_emu(6.0),
        }
    }

    #[tokio::test]
    async fn markdown_goes_through_converter() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("explanatory_notes.md");
        std::fs::write(&input, "# Note 1\n\nBody text\n").unwrap();

        let doc = convert_auxiliary(Slot::ExplanatoryNotes, &input, SourceFormat::Markdown, &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(doc.text(), "Note 1\nBody text");
        assert!(dir.path().join("explanatory_notes.converted.docx").is_file());
    }

    #[tokio::test]
    async fn converter_failure_names_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("liability_letter.txt");
        std::fs::write(&input, "FAIL").unwrap();
        let err = convert_auxiliary(Slot::LiabilityLetter, &input, SourceFormat::PlainText, &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, DossierError::Conversion { slot: Slot::LiabilityLetter, .. }));
    }

    #[tokio::test]
    async fn docx_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("liability_letter.docx");
        std::fs::write(&input, docx_with_body(&format!("{}{}", p("Dear"), p("Regards")))).unwrap();
        let doc = convert_auxiliary(Slot::LiabilityLetter, &input, SourceFormat::Docx, &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(doc.text(), "Dear\nRegards");

        std::fs::write(&input, b"PK\x03\x04 broken").unwrap();
        let err = convert_auxiliary(Slot::LiabilityLetter, &input, SourceFormat::Docx, &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.slot(), Some(Slot::LiabilityLetter));
    }

    #[tokio::test]
    async fn pdf_becomes_one_image_paragraph_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("income_statement.pdf");
        std::fs::write(&input, "%PDF 3").unwrap();
        let doc = convert_auxiliary(Slot::IncomeStatement, &input, SourceFormat::Pdf, &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(doc.blocks().len(), 3);
        assert!(doc.blocks().iter().all(|b| b.xml().contains("<w:drawing>")));
        let media = doc
            .package()
            .part_names()
            .filter(|n| n.starts_with("word/media/"))
            .count();
        assert_eq!(media, 3);
    }

    #[tokio::test]
    async fn image_becomes_single_paragraph() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("income_statement.png");
        std::fs::write(&input, png_fixture(40, 20)).unwrap();
        let doc = convert_auxiliary(Slot::IncomeStatement, &input, SourceFormat::Png, &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(doc.blocks().len(), 1);
        assert!(doc.blocks()[0].xml().contains(r#"cx="5486400" cy="2743200""#));
    }

    #[test]
    fn pandoc_readers() {
        assert_eq!(PandocConverter::reader(SourceFormat::PlainText).unwrap(), "markdown");
        assert_eq!(PandocConverter::reader(SourceFormat::Odt).unwrap(), "odt");
        assert!(PandocConverter::reader(SourceFormat::Pdf).is_err());
        assert!(needs_converter(SourceFormat::Html));
        assert!(!needs_converter(SourceFormat::Docx));
    }

    #[test]
    fn pandoc_uses_injected_availability_and_timeout() {
        use crate::pipeline::availability::ToolBootstrap;
        use std::sync::Mutex;

        struct Unreachable(Arc<Mutex<Vec<Duration>>>);
        impl ToolBootstrap for Unreachable {
            fn tool(&self) -> &str {
                "pandoc"
            }
            fn hint(&self) -> &str {
                "PANDOC_PATH"
            }
            fn locate(&self) -> Option<PathBuf> {
                None
            }
            fn install(&self, timeout: Duration) -> Result<PathBuf, String> {
                self.0.lock().unwrap().push(timeout);
                Err("offline".into())
            }
        }

        let seen: Arc<Mutex<Vec<Duration>>> = Arc::default();
        let availability = Arc::new(ToolAvailability::new(Unreachable(Arc::clone(&seen))));
        let converter = PandocConverter::with_availability(Arc::clone(&availability))
            .with_download_timeout(Duration::from_secs(45));

        let err = converter.prepare(None).unwrap_err();
        assert!(matches!(err, StageError::Unavailable { ref detail, .. } if detail == "offline"));
        let dir = tempfile::tempdir().unwrap();
        let convert = converter.convert(
            &dir.path().join("in.md"),
            SourceFormat::Markdown,
            &dir.path().join("out.docx"),
            None,
        );
        assert!(matches!(convert, Err(StageError::Unavailable { .. })));
        assert_eq!(*seen.lock().unwrap(), vec![Duration::from_secs(45)]);
        assert!(Arc::ptr_eq(converter.availability(), &availability));
    }
}
