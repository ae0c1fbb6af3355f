//! One-time availability check for external tools.
//!
//! The first caller that needs a tool runs "locate, else install" exactly
//! once; concurrent callers block on that attempt, and every later call
//! reuses the recorded outcome, failures included, so a broken network does
//! not trigger a download per request. [`ToolAvailability::reset`] forgets
//! the outcome, e.g. after an operator installed the tool by hand.
//!
//! The process-wide instances are shared through [`Arc`]; backends built
//! with `with_availability` can use their own.

use super::StageError;
use crate::progress::ProgressCallback;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tool_auto::Tool;
use tracing::{info, warn};

pub use tool_auto::DEFAULT_DOWNLOAD_TIMEOUT;

/// How to find or install one tool.
pub trait ToolBootstrap: Send + Sync {
    /// Tool name used in messages.
    fn tool(&self) -> &str;

    /// Environment variable that points at an existing copy.
    fn hint(&self) -> &str;

    /// An existing copy, without network access.
    fn locate(&self) -> Option<PathBuf>;

    /// Fetch and install the tool, returning its path. The download must
    /// give up after `timeout`.
    fn install(&self, timeout: Duration) -> Result<PathBuf, String>;
}

/// Bootstrap backed by the `tool-auto` crate.
#[derive(Debug, Clone, Copy)]
pub struct ToolAutoBootstrap(pub Tool);

impl ToolBootstrap for ToolAutoBootstrap {
    fn tool(&self) -> &str {
        self.0.name()
    }

    fn hint(&self) -> &str {
        self.0.override_var()
    }

    fn locate(&self) -> Option<PathBuf> {
        tool_auto::locate_tool(self.0)
    }

    fn install(&self, timeout: Duration) -> Result<PathBuf, String> {
        tool_auto::install_tool_with_timeout(self.0, timeout, None).map_err(|e| e.to_string())
    }
}

/// Memoized outcome of making a tool available.
pub struct ToolAvailability {
    bootstrap: Box<dyn ToolBootstrap>,
    outcome: Mutex<Option<Result<PathBuf, String>>>,
}

impl std::fmt::Debug for ToolAvailability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = self.outcome.try_lock().ok().map(|g| (*g).clone());
        f.debug_struct("ToolAvailability")
            .field("tool", &self.bootstrap.tool())
            .field("outcome", &outcome)
            .finish()
    }
}

impl ToolAvailability {
    pub fn new(bootstrap: impl ToolBootstrap + 'static) -> Self {
        Self {
            bootstrap: Box::new(bootstrap),
            outcome: Mutex::new(None),
        }
    }

    pub fn tool(&self) -> &str {
        self.bootstrap.tool()
    }

    // Poisoning means a bootstrap panicked before anything was stored.
    fn memo(&self) -> MutexGuard<'_, Option<Result<PathBuf, String>>> {
        self.outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Path of the tool, locating or installing it on first use.
    pub fn ensure(&self) -> Result<PathBuf, StageError> {
        self.ensure_with(None, DEFAULT_DOWNLOAD_TIMEOUT)
    }

    /// Like [`ensure`](Self::ensure), reporting an install attempt to
    /// `progress` before it starts and bounding the download by `timeout`.
    pub fn ensure_with(
        &self,
        progress: Option<&ProgressCallback>,
        timeout: Duration,
    ) -> Result<PathBuf, StageError> {
        let mut memo = self.memo();
        let outcome = memo.get_or_insert_with(|| {
            let tool = self.bootstrap.tool();
            if let Some(path) = self.bootstrap.locate() {
                info!("Using {} at {}", tool, path.display());
                return Ok(path);
            }
            info!(
                "{} not found; installing it once for this process (timeout {}s)",
                tool,
                timeout.as_secs()
            );
            if let Some(cb) = progress {
                cb.on_remediation_start(tool);
            }
            let result = self.bootstrap.install(timeout);
            match &result {
                Ok(path) => info!("Installed {} at {}", tool, path.display()),
                Err(e) => warn!("Installing {} failed: {}", tool, e),
            }
            result
        });
        outcome.clone().map_err(|detail| StageError::Unavailable {
            tool: self.bootstrap.tool().to_string(),
            hint: self.bootstrap.hint().to_string(),
            detail,
        })
    }

    /// `true` once an outcome (success or failure) has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.memo().is_some()
    }

    /// Forget the recorded outcome; the next call retries.
    pub fn reset(&self) {
        if self.memo().take().is_some() {
            info!("Forgot the recorded {} outcome", self.bootstrap.tool());
        }
    }
}

/// Process-wide availability of pandoc.
pub fn pandoc_availability() -> Arc<ToolAvailability> {
    static PANDOC: OnceLock<Arc<ToolAvailability>> = OnceLock::new();
    Arc::clone(PANDOC.get_or_init(|| Arc::new(ToolAvailability::new(ToolAutoBootstrap(Tool::Pandoc)))))
}

/// Process-wide availability of the pdfium library.
pub fn pdfium_availability() -> Arc<ToolAvailability> {
    static PDFIUM: OnceLock<Arc<ToolAvailability>> = OnceLock::new();
    Arc::clone(PDFIUM.get_or_init(|| Arc::new(ToolAvailability::new(ToolAutoBootstrap(Tool::Pdfium)))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::GenerationProgressCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBootstrap {
        found: Option<PathBuf>,
        install_ok: bool,
        installs: Arc<AtomicUsize>,
        timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    impl ToolBootstrap for FakeBootstrap {
        fn tool(&self) -> &str {
            "fake"
        }
        fn hint(&self) -> &str {
            "FAKE_PATH"
        }
        fn locate(&self) -> Option<PathBuf> {
            self.found.clone()
        }
        fn install(&self, timeout: Duration) -> Result<PathBuf, String> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            self.timeouts.lock().unwrap().push(timeout);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if self.install_ok {
                Ok(PathBuf::from("/opt/fake"))
            } else {
                Err("network unreachable".into())
            }
        }
    }

    fn fake(found: Option<&str>, install_ok: bool) -> (ToolAvailability, Arc<AtomicUsize>) {
        let installs = Arc::new(AtomicUsize::new(0));
        let availability = ToolAvailability::new(FakeBootstrap {
            found: found.map(PathBuf::from),
            install_ok,
            installs: Arc::clone(&installs),
            timeouts: Arc::default(),
        });
        (availability, installs)
    }

    #[test]
    fn located_tool_is_not_installed() {
        let (a, installs) = fake(Some("/usr/bin/fake"), true);
        assert_eq!(a.ensure().unwrap(), PathBuf::from("/usr/bin/fake"));
        assert_eq!(installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_callers_share_one_install() {
        let (a, installs) = fake(None, true);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert_eq!(a.ensure().unwrap(), PathBuf::from("/opt/fake")));
            }
        });
        assert_eq!(installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_is_cached_until_reset() {
        let (a, installs) = fake(None, false);
        for _ in 0..3 {
            match a.ensure() {
                Err(StageError::Unavailable { tool, hint, detail }) => {
                    assert_eq!(tool, "fake");
                    assert_eq!(hint, "FAKE_PATH");
                    assert_eq!(detail, "network unreachable");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert!(a.is_resolved());

        a.reset();
        assert!(!a.is_resolved());
        assert!(a.ensure().is_err());
        assert_eq!(installs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remediation_is_reported() {
        struct Counting(AtomicUsize);
        impl GenerationProgressCallback for Counting {
            fn on_remediation_start(&self, tool: &str) {
                assert_eq!(tool, "fake");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let cb: ProgressCallback = counting.clone();
        let (a, _) = fake(None, true);
        a.ensure_with(Some(&cb), DEFAULT_DOWNLOAD_TIMEOUT).unwrap();
        a.ensure_with(Some(&cb), DEFAULT_DOWNLOAD_TIMEOUT).unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_receives_the_timeout() {
        let timeouts: Arc<Mutex<Vec<Duration>>> = Arc::default();
        let a = ToolAvailability::new(FakeBootstrap {
            found: None,
            install_ok: true,
            installs: Arc::default(),
            timeouts: Arc::clone(&timeouts),
        });
        a.ensure_with(None, Duration::from_secs(7)).unwrap();
        assert_eq!(*timeouts.lock().unwrap(), vec![Duration::from_secs(7)]);

        a.ensure().unwrap();
        assert_eq!(timeouts.lock().unwrap().len(), 1, "outcome is reused");
    }

    #[test]
    fn shared_instance_can_be_reset() {
        let (a, installs) = fake(None, false);
        let shared = Arc::new(a);
        let other = Arc::clone(&shared);
        assert!(shared.ensure().is_err());
        other.reset();
        assert!(!shared.is_resolved());
        assert!(shared.ensure().is_err());
        assert_eq!(installs.load(Ordering::SeqCst), 2);
    }
}
