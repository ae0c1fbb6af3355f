//! Input materialization: check the bundle, then copy uploads into a
//! run-scoped scratch directory.
//!
//! pdfium and pandoc both want file-system paths. Each run gets its own
//! `TempDir`, so concurrent runs never collide on file names, and the
//! directory is removed when [`Scratch`] is dropped, on every exit path.

use crate::bundle::{scratch_path, InputBundle, SourceFormat, Slot};
use crate::config::BalanceSheetMode;
use crate::error::DossierError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Scratch directory owned by one run.
#[derive(Debug)]
pub struct Scratch {
    dir: Option<TempDir>,
}

impl Scratch {
    /// Create `dossier-<run_id>-XXXX` under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>, run_id: &str) -> Result<Self, DossierError> {
        let prefix = format!("dossier-{run_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| {
                    DossierError::io(&format!("Cannot create scratch root '{}'", root.display()), e)
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| DossierError::io("Cannot create scratch directory", e))?;
        debug!("Scratch directory: {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .unwrap_or_else(|| Path::new(""))
    }

    /// Remove the directory now. Failures are logged, never returned.
    pub fn close(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("Removed scratch directory {}", path.display()),
                Err(e) => warn!("Failed to remove scratch directory {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.remove();
    }
}

/// One upload written to scratch storage.
#[derive(Debug, Clone)]
pub struct MaterializedInput {
    pub slot: Slot,
    pub path: PathBuf,
    pub format: SourceFormat,
}

/// Every required upload, by slot.
#[derive(Debug, Default)]
pub struct Materialized {
    inputs: BTreeMap<Slot, MaterializedInput>,
}

impl Materialized {
    pub fn get(&self, slot: Slot) -> Result<&MaterializedInput, DossierError> {
        self.inputs
            .get(&slot)
            .ok_or(DossierError::MissingInput { slot })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterializedInput> {
        self.inputs.values()
    }
}

/// Slots a run needs, in canonical order.
pub fn required_slots(mode: BalanceSheetMode) -> Vec<Slot> {
    let balance = match mode {
        BalanceSheetMode::TwoPagePdf => vec![Slot::BalanceSheet],
        BalanceSheetMode::SplitImages => vec![Slot::BalanceSheetPart1, Slot::BalanceSheetPart2],
    };
    balance
        .into_iter()
        .chain([Slot::IncomeStatement, Slot::ExplanatoryNotes, Slot::LiabilityLetter])
        .collect()
}

fn check_format(slot: Slot, format: SourceFormat) -> Result<(), DossierError> {
    let expected = match slot {
        Slot::BalanceSheet if format != SourceFormat::Pdf => "a PDF",
        Slot::BalanceSheetPart1 | Slot::BalanceSheetPart2 if !format.is_image() => {
            "a PNG or JPEG image"
        }
        _ => return Ok(()),
    };
    Err(DossierError::Conversion {
        slot,
        detail: format!("expected {expected}, got a .{} file", format.extension()),
    })
}

/// Check that every slot in `required` is present, then write each of them
/// to `scratch`. Nothing is written when a slot is missing.
pub async fn materialize(
    bundle: &InputBundle,
    required: &[Slot],
    scratch: &Scratch,
) -> Result<Materialized, DossierError> {
    if let Some(slot) = bundle.first_missing(required) {
        return Err(DossierError::MissingInput { slot });
    }

    let mut planned = Vec::with_capacity(required.len());
    for &slot in required {
        let upload = bundle.get(slot).ok_or(DossierError::MissingInput { slot })?;
        let format = upload.format().ok_or_else(|| DossierError::Conversion {
            slot,
            detail: format!("unrecognised file type for '{}'", upload.file_name),
        })?;
        check_format(slot, format)?;
        planned.push((slot, upload, format));
    }

    for slot in bundle.slots().filter(|s| !required.contains(s)) {
        debug!("Ignoring '{}' upload: not used in this mode", slot);
    }

    let mut inputs = BTreeMap::new();
    for (slot, upload, format) in planned {
        let path = scratch_path(scratch.path(), slot, format);
        tokio::fs::write(&path, &upload.bytes)
            .await
            .map_err(|e| DossierError::io(&format!("Failed to write '{}'", path.display()), e))?;
        debug!("Materialized {} → {} ({} bytes)", slot, path.display(), upload.bytes.len());
        inputs.insert(slot, MaterializedInput { slot, path, format });
    }
    Ok(Materialized { inputs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Upload;

    fn full_bundle() -> InputBundle {
        InputBundle::new()
            .with(Slot::BalanceSheet, Upload::new("b.pdf", b"%PDF-1.7".to_vec()))
            .with(Slot::IncomeStatement, Upload::new("i.pdf", b"%PDF-1.7".to_vec()))
            .with(Slot::ExplanatoryNotes, Upload::new("n.md", b"# Notes".to_vec()))
            .with(Slot::LiabilityLetter, Upload::new("l.txt", b"Dear".to_vec()))
    }

    #[test]
    fn required_slots_follow_mode() {
        assert_eq!(required_slots(BalanceSheetMode::TwoPagePdf)[0], Slot::BalanceSheet);
        let split = required_slots(BalanceSheetMode::SplitImages);
        assert_eq!(&split[..2], &[Slot::BalanceSheetPart1, Slot::BalanceSheetPart2]);
        assert_eq!(split.len(), 5);
    }

    #[tokio::test]
    async fn writes_each_slot_under_its_name() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(Some(root.path()), "t1").unwrap();
        let required = required_slots(BalanceSheetMode::TwoPagePdf);
        let m = materialize(&full_bundle(), &required, &scratch).await.unwrap();

        let notes = m.get(Slot::ExplanatoryNotes).unwrap();
        assert_eq!(notes.format, SourceFormat::Markdown);
        assert!(notes.path.ends_with("explanatory_notes.md"));
        assert_eq!(std::fs::read(&notes.path).unwrap(), b"# Notes");
        assert_eq!(m.iter().count(), 4);
    }

    #[tokio::test]
    async fn missing_slot_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(Some(root.path()), "t2").unwrap();
        let mut bundle = full_bundle();
        bundle.remove(Slot::LiabilityLetter);
        bundle.insert(Slot::ExplanatoryNotes, Upload::new("n.md", Vec::new()));

        let err = materialize(&bundle, &required_slots(BalanceSheetMode::TwoPagePdf), &scratch)
            .await
            .unwrap_err();
        assert!(matches!(err, DossierError::MissingInput { slot: Slot::ExplanatoryNotes }));
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn wrong_balance_sheet_format_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(Some(root.path()), "t3").unwrap();
        let mut bundle = full_bundle();
        bundle.insert(Slot::BalanceSheet, Upload::new("b.md", b"# not a pdf".to_vec()));
        let err = materialize(&bundle, &required_slots(BalanceSheetMode::TwoPagePdf), &scratch)
            .await
            .unwrap_err();
        assert_eq!(err.slot(), Some(Slot::BalanceSheet));
    }

    #[test]
    fn scratch_is_removed_on_drop_and_close() {
        let root = tempfile::tempdir().unwrap();
        let a = Scratch::create(Some(root.path()), "drop").unwrap();
        let a_path = a.path().to_path_buf();
        std::fs::write(a_path.join("x"), b"1").unwrap();
        assert!(a_path.file_name().unwrap().to_string_lossy().starts_with("dossier-drop-"));
        drop(a);
        assert!(!a_path.exists());

        let b = Scratch::create(Some(root.path()), "close").unwrap();
        let b_path = b.path().to_path_buf();
        b.close();
        assert!(!b_path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
