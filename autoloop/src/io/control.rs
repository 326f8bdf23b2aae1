//! Pause/stop signalling for a running loop.
//!
//! Requests arrive either in-process (atomic flags, used by tests and
//! embedders) or from another process through marker files under `.autoloop/`
//! (`autoloop pause`, `autoloop stop`). The loop polls both.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::io::init::LoopPaths;

#[derive(Debug, Default)]
struct Inner {
    pause: AtomicBool,
    stop: AtomicBool,
    pause_marker: Option<PathBuf>,
    stop_marker: Option<PathBuf>,
}

/// Cloneable handle shared between the loop runner and the agent invoker.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    inner: Arc<Inner>,
}

impl LoopControl {
    /// Flags only; no marker files are consulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags plus the `PAUSE`/`STOP` marker files of `paths`.
    pub fn with_markers(paths: &LoopPaths) -> Self {
        Self {
            inner: Arc::new(Inner {
                pause_marker: Some(paths.pause_marker_path.clone()),
                stop_marker: Some(paths.stop_marker_path.clone()),
                ..Inner::default()
            }),
        }
    }

    pub fn request_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    /// Withdraw an in-process pause request. Marker files are left alone.
    pub fn request_resume(&self) {
        self.inner.pause.store(false, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool {
        self.inner.pause.load(Ordering::SeqCst) || marker_present(self.inner.pause_marker.as_deref())
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst) || marker_present(self.inner.stop_marker.as_deref())
    }

    /// True when an in-flight agent should be killed.
    pub fn should_interrupt(&self) -> bool {
        self.is_stop_requested() || self.is_pause_requested()
    }
}

fn marker_present(path: Option<&Path>) -> bool {
    path.is_some_and(Path::exists)
}

/// Create a marker file (idempotent).
pub fn set_marker(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, "").with_context(|| format!("write marker {}", path.display()))
}

/// Remove a marker file; a missing marker is not an error.
pub fn clear_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove marker {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_shared_between_clones() {
        let control = LoopControl::new();
        let clone = control.clone();
        clone.request_pause();
        assert!(control.is_pause_requested());
        assert!(control.should_interrupt());
        clone.request_resume();
        assert!(!control.should_interrupt());
        clone.request_stop();
        assert!(control.is_stop_requested());
    }

    #[test]
    fn marker_files_drive_requests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = LoopPaths::new(temp.path());
        let control = LoopControl::with_markers(&paths);
        assert!(!control.should_interrupt());

        set_marker(&paths.pause_marker_path).expect("pause");
        assert!(control.is_pause_requested());
        clear_marker(&paths.pause_marker_path).expect("unpause");
        clear_marker(&paths.pause_marker_path).expect("unpause twice");
        assert!(!control.is_pause_requested());

        set_marker(&paths.stop_marker_path).expect("stop");
        assert!(control.is_stop_requested());
    }
}
