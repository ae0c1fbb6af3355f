//! # tool-auto
//!
//! Locate, download and cache the two external tools the dossier pipeline
//! depends on:
//!
//! * [PDFium](https://pdfium.googlesource.com/pdfium/): shared library used
//!   by `pdfium-render` to rasterise PDF pages;
//! * [pandoc](https://pandoc.org/): executable used to convert Markdown and
//!   friends into DOCX.
//!
//! ## How it works
//!
//! [`locate_tool`] looks for an existing copy without touching the network:
//!
//! 1. the override variable (`PDFIUM_LIB_PATH` / `PANDOC_PATH`);
//! 2. for pandoc, every directory of `PATH`;
//! 3. the per-version cache directory (`~/.cache/dossier/<tool>-<VERSION>/`).
//!
//! [`install_tool`] downloads the platform archive from the tool's GitHub
//! releases, extracts the single file we need into the cache directory and
//! returns its path. [`ensure_tool`] chains both.
//!
//! ```rust,no_run
//! use tool_auto::{ensure_tool, bind_pdfium_from_path, Tool};
//!
//! let lib = ensure_tool(Tool::Pdfium, None).expect("PDFium unavailable");
//! let pdfium = bind_pdfium_from_path(&lib).expect("bind failed");
//! let pandoc = ensure_tool(Tool::Pandoc, None).expect("pandoc unavailable");
//! ```
//!
//! ## Environment variable overrides
//!
//! - `PDFIUM_LIB_PATH`: path to an existing pdfium library.
//! - `PANDOC_PATH`: path to an existing pandoc executable.
//! - `TOOL_AUTO_CACHE_DIR`: override the default cache directory.

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use pdfium_render::prelude::Pdfium;
use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// The pdfium-binaries release tag used for downloads.
pub const PDFIUM_VERSION: &str = "7690";

/// The pandoc release used for downloads.
pub const PANDOC_VERSION: &str = "3.6.4";

/// Download timeout used by [`install_tool`].
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

const PDFIUM_BASE_URL: &str = "https://github.com/bblanchon/pdfium-binaries/releases/download";
const PANDOC_BASE_URL: &str = "https://github.com/jgm/pandoc/releases/download";

// ── Tools ────────────────────────────────────────────────────────────────────

/// An external tool managed by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// The PDFium shared library.
    Pdfium,
    /// The pandoc document converter executable.
    Pandoc,
}

impl Tool {
    /// Short lowercase name, used for cache directories and messages.
    pub fn name(self) -> &'static str {
        match self {
            Tool::Pdfium => "pdfium",
            Tool::Pandoc => "pandoc",
        }
    }

    /// Environment variable pointing at an existing copy of the tool.
    pub fn override_var(self) -> &'static str {
        match self {
            Tool::Pdfium => "PDFIUM_LIB_PATH",
            Tool::Pandoc => "PANDOC_PATH",
        }
    }

    fn version(self) -> &'static str {
        match self {
            Tool::Pdfium => PDFIUM_VERSION,
            Tool::Pandoc => PANDOC_VERSION,
        }
    }

    fn slot(self) -> usize {
        match self {
            Tool::Pdfium => 0,
            Tool::Pandoc => 1,
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by tool-auto operations.
#[derive(Error, Debug)]
pub enum ToolAutoError {
    /// No release asset exists for the current OS/architecture combination.
    #[error("{tool} is not available for platform {os}/{arch}")]
    UnsupportedPlatform {
        tool: Tool,
        os: String,
        arch: String,
    },

    /// Could not create or navigate the local cache directory.
    #[error("Cache directory error: {0}")]
    CacheDir(#[source] std::io::Error),

    /// Network download failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// gzip/tar/zip extraction failed.
    #[error("Archive extraction failed: {0}")]
    Extract(String),

    /// `libloading` / `pdfium-render` could not load the library.
    #[error("Failed to bind PDFium from '{path}': {reason}")]
    Bind { path: PathBuf, reason: String },
}

// ── Internal: release asset metadata ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarGz,
    Zip,
}

#[derive(Debug)]
struct Asset {
    /// Full download URL.
    url: String,
    /// Archive member to extract, matched as a path suffix so that the
    /// versioned top-level directory does not matter.
    member_suffix: &'static str,
    /// Filename to write on disk.
    file_name: &'static str,
    archive: ArchiveKind,
}

fn detect_asset(tool: Tool) -> Result<Asset, ToolAutoError> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    let unsupported = || ToolAutoError::UnsupportedPlatform {
        tool,
        os: os.to_string(),
        arch: arch.to_string(),
    };

    match tool {
        Tool::Pdfium => {
            let (archive_name, member_suffix, file_name) = match (os, arch) {
                ("macos", "aarch64") => ("pdfium-mac-arm64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
                ("macos", "x86_64") => ("pdfium-mac-x64.tgz", "lib/libpdfium.dylib", "libpdfium.dylib"),
                ("linux", "x86_64") => ("pdfium-linux-x64.tgz", "lib/libpdfium.so", "libpdfium.so"),
                ("linux", "aarch64") => ("pdfium-linux-arm64.tgz", "lib/libpdfium.so", "libpdfium.so"),
                ("windows", "x86_64") => ("pdfium-win-x64.tgz", "bin/pdfium.dll", "pdfium.dll"),
                ("windows", "aarch64") => ("pdfium-win-arm64.tgz", "bin/pdfium.dll", "pdfium.dll"),
                _ => return Err(unsupported()),
            };
            Ok(Asset {
                url: format!("{PDFIUM_BASE_URL}/chromium%2F{PDFIUM_VERSION}/{archive_name}"),
                member_suffix,
                file_name,
                archive: ArchiveKind::TarGz,
            })
        }
        Tool::Pandoc => {
            let (platform, archive, member_suffix, file_name) = match (os, arch) {
                ("linux", "x86_64") => ("linux-amd64.tar.gz", ArchiveKind::TarGz, "bin/pandoc", "pandoc"),
                ("linux", "aarch64") => ("linux-arm64.tar.gz", ArchiveKind::TarGz, "bin/pandoc", "pandoc"),
                ("macos", "aarch64") => ("arm64-macOS.zip", ArchiveKind::Zip, "bin/pandoc", "pandoc"),
                ("macos", "x86_64") => ("x86_64-macOS.zip", ArchiveKind::Zip, "bin/pandoc", "pandoc"),
                ("windows", "x86_64") => ("windows-x86_64.zip", ArchiveKind::Zip, "pandoc.exe", "pandoc.exe"),
                _ => return Err(unsupported()),
            };
            Ok(Asset {
                url: format!(
                    "{PANDOC_BASE_URL}/{PANDOC_VERSION}/pandoc-{PANDOC_VERSION}-{platform}"
                ),
                member_suffix,
                file_name,
                archive,
            })
        }
    }
}

// ── Cache directory resolution ───────────────────────────────────────────────

/// Returns the per-version cache directory for `tool`.
///
/// Default locations:
/// - **macOS**: `~/Library/Caches/dossier/<tool>-{VERSION}/`
/// - **Linux**: `~/.cache/dossier/<tool>-{VERSION}/`
/// - **Windows**: `%LOCALAPPDATA%\dossier\<tool>-{VERSION}\`
///
/// Override by setting `TOOL_AUTO_CACHE_DIR`.
pub fn tool_cache_dir(tool: Tool) -> PathBuf {
    let leaf = format!("{}-{}", tool.name(), tool.version());
    if let Ok(override_dir) = std::env::var("TOOL_AUTO_CACHE_DIR") {
        return PathBuf::from(override_dir).join(leaf);
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("dossier").join(leaf)
}

// ── Thread-safe singleton path cache ─────────────────────────────────────────

static RESOLVED: [OnceLock<PathBuf>; 2] = [OnceLock::new(), OnceLock::new()];

// ── Public API ───────────────────────────────────────────────────────────────

/// Searches every directory of `PATH` for an executable called `name`
/// (`name.exe` on Windows).
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    std::env::split_paths(&paths)
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Returns the path of an existing copy of `tool`, or `None`.
///
/// Never touches the network.
pub fn locate_tool(tool: Tool) -> Option<PathBuf> {
    if let Some(path) = RESOLVED[tool.slot()].get() {
        return Some(path.clone());
    }
    if let Ok(p) = std::env::var(tool.override_var()) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Some(pb);
        }
    }
    if tool == Tool::Pandoc {
        if let Some(p) = find_on_path("pandoc") {
            return Some(p);
        }
    }
    let asset = detect_asset(tool).ok()?;
    let cached = tool_cache_dir(tool).join(asset.file_name);
    cached.exists().then_some(cached)
}

/// Downloads `tool` into its cache directory and returns the extracted path.
///
/// `on_progress` receives `(bytes_downloaded, total_size_option)` during
/// the download. Pass `None` to suppress progress callbacks. The download
/// gives up after [`DEFAULT_DOWNLOAD_TIMEOUT`].
pub fn install_tool(
    tool: Tool,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, ToolAutoError> {
    install_tool_with_timeout(tool, DEFAULT_DOWNLOAD_TIMEOUT, on_progress)
}

/// [`install_tool`] with an explicit download timeout.
pub fn install_tool_with_timeout(
    tool: Tool,
    timeout: Duration,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, ToolAutoError> {
    let asset = detect_asset(tool)?;
    let cache_dir = tool_cache_dir(tool);
    let dest = cache_dir.join(asset.file_name);

    std::fs::create_dir_all(&cache_dir).map_err(ToolAutoError::CacheDir)?;

    let archive_bytes = download_bytes(&asset.url, timeout, on_progress)?;

    // Extract next to the destination, then rename: another process may be
    // loading the same cached file.
    let partial = cache_dir.join(format!("{}.partial", asset.file_name));
    match asset.archive {
        ArchiveKind::TarGz => extract_from_tgz(&archive_bytes, asset.member_suffix, &partial)?,
        ArchiveKind::Zip => extract_from_zip(&archive_bytes, asset.member_suffix, &partial)?,
    }
    make_executable(&partial)?;
    std::fs::rename(&partial, &dest)
        .map_err(|e| ToolAutoError::Extract(format!("Rename failed: {e}")))?;

    let _ = RESOLVED[tool.slot()].set(dest.clone());
    Ok(dest)
}

/// Returns a usable path for `tool`, downloading it first if necessary.
///
/// Safe to call from multiple threads; once a path is known it is reused for
/// the rest of the process lifetime.
pub fn ensure_tool(
    tool: Tool,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<PathBuf, ToolAutoError> {
    if let Some(path) = locate_tool(tool) {
        let _ = RESOLVED[tool.slot()].set(path.clone());
        return Ok(path);
    }
    install_tool(tool, on_progress)
}

/// Binds to PDFium, downloading it first if necessary.
pub fn bind_pdfium(
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Pdfium, ToolAutoError> {
    let lib_path = ensure_tool(Tool::Pdfium, on_progress)?;
    bind_pdfium_from_path(&lib_path)
}

/// Binds to a PDFium library at an explicit `path`.
pub fn bind_pdfium_from_path(path: &Path) -> Result<Pdfium, ToolAutoError> {
    Pdfium::bind_to_library(path)
        .map(Pdfium::new)
        .map_err(|e| ToolAutoError::Bind {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// ── Internal helpers ─────────────────────────────────────────────────────────

/// Streams a URL into a `Vec<u8>`, calling `on_progress` every 64 KiB.
fn download_bytes(
    url: &str,
    timeout: Duration,
    on_progress: Option<&dyn Fn(u64, Option<u64>)>,
) -> Result<Vec<u8>, ToolAutoError> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(concat!("tool-auto/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| ToolAutoError::Download(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .map_err(|e| ToolAutoError::Download(format!("GET {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(ToolAutoError::Download(format!(
            "HTTP {} for {url}",
            response.status()
        )));
    }

    let total = response.content_length();
    let capacity = total.unwrap_or(35 * 1024 * 1024) as usize;
    let mut buf = Vec::with_capacity(capacity);

    let mut stream = response;
    let mut chunk = vec![0u8; 64 * 1024];
    let mut downloaded: u64 = 0;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                downloaded += n as u64;
                if let Some(cb) = on_progress {
                    cb(downloaded, total);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ToolAutoError::Download(format!("Read error: {e}")));
            }
        }
    }

    Ok(buf)
}

fn member_matches(entry_path: &str, suffix: &str) -> bool {
    let normalized = entry_path.replace('\\', "/");
    normalized == suffix || normalized.ends_with(&format!("/{suffix}"))
}

/// Extracts the first member ending in `member_suffix` from a gzipped tar.
fn extract_from_tgz(
    archive_bytes: &[u8],
    member_suffix: &str,
    dest_path: &Path,
) -> Result<(), ToolAutoError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let gz = GzDecoder::new(archive_bytes);
    let mut archive = Archive::new(gz);

    for entry in archive
        .entries()
        .map_err(|e| ToolAutoError::Extract(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ToolAutoError::Extract(e.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|e| ToolAutoError::Extract(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        if member_matches(&entry_path, member_suffix) {
            entry
                .unpack(dest_path)
                .map_err(|e| ToolAutoError::Extract(format!("Unpack failed: {e}")))?;
            return Ok(());
        }
    }

    Err(ToolAutoError::Extract(format!(
        "'{member_suffix}' not found in archive"
    )))
}

/// Extracts the first member ending in `member_suffix` from a zip archive.
fn extract_from_zip(
    archive_bytes: &[u8],
    member_suffix: &str,
    dest_path: &Path,
) -> Result<(), ToolAutoError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| ToolAutoError::Extract(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ToolAutoError::Extract(e.to_string()))?;
        if entry.is_dir() || !member_matches(entry.name(), member_suffix) {
            continue;
        }
        let mut out = File::create(dest_path)
            .map_err(|e| ToolAutoError::Extract(format!("Create failed: {e}")))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| ToolAutoError::Extract(format!("Unpack failed: {e}")))?;
        return Ok(());
    }

    Err(ToolAutoError::Extract(format!(
        "'{member_suffix}' not found in archive"
    )))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ToolAutoError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)
        .map_err(|e| ToolAutoError::Extract(e.to_string()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms).map_err(|e| ToolAutoError::Extract(e.to_string()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ToolAutoError> {
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
