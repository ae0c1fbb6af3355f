//! Progress-callback trait for stage-level generation events.
//!
//! Inject an [`Arc<dyn GenerationProgressCallback>`] via
//! [`crate::config::DossierConfigBuilder::progress_callback`] to follow a run
//! as it moves through the pipeline stages.
//!
//! # Example
//!
//! ```rust
//! use dossier::{DossierConfig, GenerationProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     finished: AtomicUsize,
//! }
//!
//! impl GenerationProgressCallback for CountingCallback {
//!     fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
//!         self.finished.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} done in {elapsed_ms} ms");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { finished: AtomicUsize::new(0) });
//!
//! let config = DossierConfig::builder()
//!     .progress_callback(counter as Arc<dyn GenerationProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Materialize,
    Rasterize,
    Convert,
    Render,
    Splice,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Materialize,
        Stage::Rasterize,
        Stage::Convert,
        Stage::Render,
        Stage::Splice,
        Stage::Finalize,
    ];

    /// Short human-readable description.
    pub fn label(self) -> &'static str {
        match self {
            Stage::Materialize => "Preparing inputs",
            Stage::Rasterize => "Rendering balance sheet",
            Stage::Convert => "Converting documents",
            Stage::Render => "Filling template",
            Stage::Splice => "Inserting documents",
            Stage::Finalize => "Writing dossier",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Called by the pipeline as it enters and leaves each stage.
///
/// Implementations must be `Send + Sync`. All methods have default no-op
/// implementations so callers only override what they care about.
pub trait GenerationProgressCallback: Send + Sync {
    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    ///
    /// # Arguments
    /// * `stage`: the stage that finished
    /// * `elapsed_ms`: wall-clock time spent in it
    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called before a missing external tool is fetched. This can take a
    /// while on the first run.
    fn on_remediation_start(&self, tool: &str) {
        let _ = tool;
    }

    /// Called once the dossier bytes are ready.
    fn on_generation_complete(&self, total_bytes: usize) {
        let _ = total_bytes;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl GenerationProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::DossierConfig`].
pub type ProgressCallback = Arc<dyn GenerationProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallback {
        events: Mutex<Vec<String>>,
    }

    impl GenerationProgressCallback for RecordingCallback {
        fn on_stage_start(&self, stage: Stage) {
            self.events.lock().unwrap().push(format!("start {stage:?}"));
        }

        fn on_stage_complete(&self, stage: Stage, _elapsed_ms: u64) {
            self.events.lock().unwrap().push(format!("done {stage:?}"));
        }

        fn on_generation_complete(&self, total_bytes: usize) {
            self.events.lock().unwrap().push(format!("bytes {total_bytes}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_stage_start(Stage::Render);
        cb.on_stage_complete(Stage::Render, 12);
        cb.on_remediation_start("pandoc");
        cb.on_generation_complete(1024);
    }

    #[test]
    fn recording_callback_sees_overridden_events_only() {
        let cb = RecordingCallback::default();
        cb.on_stage_start(Stage::Splice);
        cb.on_remediation_start("pandoc");
        cb.on_stage_complete(Stage::Splice, 3);
        cb.on_generation_complete(7);
        assert_eq!(
            *cb.events.lock().unwrap(),
            vec!["start Splice", "done Splice", "bytes 7"]
        );
    }

    #[test]
    fn stages_are_ordered_and_labelled() {
        assert_eq!(Stage::ALL.first(), Some(&Stage::Materialize));
        assert_eq!(Stage::ALL.last(), Some(&Stage::Finalize));
        assert!(Stage::ALL.iter().all(|s| !s.label().is_empty()));
        assert_eq!(Stage::Convert.to_string(), "Converting documents");
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_stage_start(Stage::Materialize);
    }
}
