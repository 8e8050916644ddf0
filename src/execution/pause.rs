//! File-based pause signal.
//!
//! The presence of the signal file means "paused", its absence means "run".
//! The engine polls it once per scheduling tick, so a change is observed
//! within one tick.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between pause-signal polls.
pub const PAUSE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PauseSignal {
    path: Option<PathBuf>,
}

impl PauseSignal {
    /// A signal backed by the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A signal that is never asserted.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_asserted(&self) -> bool {
        self.path.as_deref().is_some_and(Path::exists)
    }
}

impl From<Option<PathBuf>> for PauseSignal {
    fn from(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}
