//! Device-under-test hooks used by the switching loop.
//!
//! UI navigation lives outside this crate. The switcher only needs to ask
//! whether the expected media source is playing or a call is shown, and to
//! capture evidence when a check fails.

use crate::error::AppResult;
use log::info;
use std::path::{Path, PathBuf};

/// Device under test as seen by the switching loop.
pub trait Target: Send + Sync {
    /// Directory for screenshots and reports of the current run.
    fn results_dir(&self) -> &Path;

    /// `true` when the media player shows `name` as the playing source.
    fn is_playing_source(&self, name: &str) -> bool;

    /// `true` when the call screen is displayed.
    fn is_active_call(&self) -> bool;

    /// Saves a screenshot to `path`.
    fn take_screenshot(&self, path: &Path) -> AppResult<()>;
}

/// Target without a UI: every check passes and screenshots are only logged.
#[derive(Debug, Clone)]
pub struct HeadlessTarget {
    results_dir: PathBuf,
}

impl HeadlessTarget {
    /// Target writing its evidence under `results_dir`.
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }
}

impl Target for HeadlessTarget {
    fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    fn is_playing_source(&self, _name: &str) -> bool {
        true
    }

    fn is_active_call(&self) -> bool {
        true
    }

    fn take_screenshot(&self, path: &Path) -> AppResult<()> {
        info!("Headless target, screenshot '{}' skipped", path.display());
        Ok(())
    }
}
