//! The input bundle: uploaded artifacts keyed by logical slot.
//!
//! A front end (web form, CLI, batch job) fills an [`InputBundle`] with the
//! raw bytes of each uploaded file. The pipeline never looks at paths the
//! caller owns; [`crate::pipeline::materialize`] copies what it needs into a
//! run-scoped scratch directory.

use crate::error::DossierError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Logical input slots, in canonical order.
///
/// The order matters: when several required slots are missing, the first one
/// in this order is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    /// Balance sheet as one PDF with (at least) two pages.
    BalanceSheet,
    /// First balance-sheet part (assets) as an image.
    BalanceSheetPart1,
    /// Second balance-sheet part (liabilities) as an image.
    BalanceSheetPart2,
    /// Income statement: PDF or image.
    IncomeStatement,
    /// Explanatory notes: Markdown, text, DOCX or PDF.
    ExplanatoryNotes,
    /// Liability letter: Markdown, text, DOCX or PDF.
    LiabilityLetter,
}

impl Slot {
    pub const ALL: [Slot; 6] = [
        Slot::BalanceSheet,
        Slot::BalanceSheetPart1,
        Slot::BalanceSheetPart2,
        Slot::IncomeStatement,
        Slot::ExplanatoryNotes,
        Slot::LiabilityLetter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::BalanceSheet => "balance_sheet",
            Slot::BalanceSheetPart1 => "balance_sheet_part1",
            Slot::BalanceSheetPart2 => "balance_sheet_part2",
            Slot::IncomeStatement => "income_statement",
            Slot::ExplanatoryNotes => "explanatory_notes",
            Slot::LiabilityLetter => "liability_letter",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content format of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Pdf,
    Png,
    Jpeg,
    Markdown,
    PlainText,
    Html,
    Odt,
    Docx,
}

impl SourceFormat {
    /// File extension used when the upload is written to scratch storage.
    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::Pdf => "pdf",
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpg",
            SourceFormat::Markdown => "md",
            SourceFormat::PlainText => "txt",
            SourceFormat::Html => "html",
            SourceFormat::Odt => "odt",
            SourceFormat::Docx => "docx",
        }
    }

    /// `true` for raster images that can be embedded directly.
    pub fn is_image(self) -> bool {
        matches!(self, SourceFormat::Png | SourceFormat::Jpeg)
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            "pdf" => SourceFormat::Pdf,
            "png" => SourceFormat::Png,
            "jpg" | "jpeg" => SourceFormat::Jpeg,
            "md" | "markdown" => SourceFormat::Markdown,
            "txt" | "text" => SourceFormat::PlainText,
            "html" | "htm" => SourceFormat::Html,
            "odt" => SourceFormat::Odt,
            "docx" => SourceFormat::Docx,
            _ => return None,
        })
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        Some(match essence {
            "application/pdf" => SourceFormat::Pdf,
            "image/png" => SourceFormat::Png,
            "image/jpeg" => SourceFormat::Jpeg,
            "text/markdown" | "text/x-markdown" => SourceFormat::Markdown,
            "text/plain" => SourceFormat::PlainText,
            "text/html" => SourceFormat::Html,
            "application/vnd.oasis.opendocument.text" => SourceFormat::Odt,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                SourceFormat::Docx
            }
            _ => return None,
        })
    }
}

/// One uploaded file.
#[derive(Clone)]
pub struct Upload {
    /// Raw content.
    pub bytes: Vec<u8>,
    /// Original file name, used for its extension.
    pub file_name: String,
    /// Declared MIME type, if the front end knows it.
    pub mime: Option<String>,
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Upload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: file_name.into(),
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// Detect the content format: magic bytes first, then the declared MIME
    /// type, then the file extension.
    pub fn format(&self) -> Option<SourceFormat> {
        let ext = self.extension();
        let b = &self.bytes;
        if b.starts_with(b"%PDF") {
            return Some(SourceFormat::Pdf);
        }
        if b.starts_with(b"\x89PNG") {
            return Some(SourceFormat::Png);
        }
        if b.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(SourceFormat::Jpeg);
        }
        if b.starts_with(b"PK\x03\x04") {
            // DOCX and ODT are both zip containers.
            return Some(match ext.as_deref() {
                Some("odt") => SourceFormat::Odt,
                _ => SourceFormat::Docx,
            });
        }
        self.mime
            .as_deref()
            .and_then(SourceFormat::from_mime)
            .or_else(|| ext.as_deref().and_then(SourceFormat::from_extension))
    }
}

/// Uploaded artifacts keyed by slot.
#[derive(Debug, Clone, Default)]
pub struct InputBundle {
    uploads: BTreeMap<Slot, Upload>,
}

impl InputBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, slot: Slot, upload: Upload) -> Self {
        self.insert(slot, upload);
        self
    }

    pub fn insert(&mut self, slot: Slot, upload: Upload) {
        self.uploads.insert(slot, upload);
    }

    pub fn remove(&mut self, slot: Slot) -> Option<Upload> {
        self.uploads.remove(&slot)
    }

    /// The upload for `slot`; empty uploads count as absent.
    pub fn get(&self, slot: Slot) -> Option<&Upload> {
        self.uploads.get(&slot).filter(|u| !u.is_empty())
    }

    /// Present (non-empty) slots in canonical order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.uploads
            .iter()
            .filter(|(_, u)| !u.is_empty())
            .map(|(s, _)| *s)
    }

    /// First slot of `required` (in canonical order) that is absent.
    pub fn first_missing(&self, required: &[Slot]) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .filter(|s| required.contains(s))
            .find(|s| self.get(*s).is_none())
    }
}

// ── Loading uploads from paths and URLs ─────────────────────────────────────

/// Check if the source string looks like a URL.
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Load an upload from a local path or an HTTP/HTTPS URL.
pub async fn load_upload(source: &str, timeout_secs: u64) -> Result<Upload, DossierError> {
    if is_url(source) {
        download_url(source, timeout_secs).await
    } else {
        read_local(Path::new(source)).await
    }
}

async fn read_local(path: &Path) -> Result<Upload, DossierError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            DossierError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            DossierError::io(&format!("Failed to read '{}'", path.display()), e)
        }
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!("Loaded {} ({} bytes)", path.display(), bytes.len());
    Ok(Upload::new(file_name, bytes))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Upload, DossierError> {
    info!("Downloading input from: {}", url);
    let failed = |reason: String| DossierError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            failed(format!("timed out after {timeout_secs}s"))
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let mime = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let file_name = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let mut upload = Upload::new(file_name, bytes.to_vec());
    upload.mime = mime;
    Ok(upload)
}

/// Last path segment of the URL when it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "download".to_string()
}

/// Path of the file `slot` is written to inside `dir`.
pub(crate) fn scratch_path(dir: &Path, slot: Slot, format: SourceFormat) -> PathBuf {
    dir.join(format!("{}.{}", slot.as_str(), format.extension()))
}
