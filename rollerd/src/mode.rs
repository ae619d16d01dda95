//! Desired operating mode.
//!
//! The mode is an operator-controlled file in the working directory
//! containing `running`, `dry-run`, or `stopped`. Changes are picked up
//! via a filesystem watcher, with a coarse poll as fallback; a missing
//! file means `running`, and unreadable content keeps the previous mode.

use notify::{RecursiveMode, Watcher};
use roller_common::Mode;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll cadence used when (and alongside) the watcher.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Source of the desired operating mode, read by the controller each tick.
pub struct ModeSource {
    current: Arc<RwLock<Mode>>,
    path: Option<PathBuf>,
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl ModeSource {
    /// Fixed mode, settable in-process. Used by tests and embedders that
    /// drive the mode themselves.
    pub fn fixed(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            current: Arc::new(RwLock::new(mode)),
            path: None,
            _watcher: Mutex::new(None),
        })
    }

    /// File-backed mode source watching `path` for changes.
    pub fn file(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let current = Arc::new(RwLock::new(read_mode_file(&path, Mode::Running)));

        let source = Arc::new(Self {
            current: Arc::clone(&current),
            path: Some(path.clone()),
            _watcher: Mutex::new(None),
        });

        // Watch the parent directory so editor renames are seen too.
        let watch_target = path.parent().map(Path::to_path_buf);
        let watcher_current = Arc::clone(&current);
        let watcher_path = path.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(_) => apply_mode_file(&watcher_path, &watcher_current),
                Err(err) => warn!("mode watcher error: {err}"),
            }
        });
        match (watcher, watch_target) {
            (Ok(mut w), Some(dir)) => match w.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    *source._watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(w);
                }
                Err(err) => warn!("mode watcher unavailable, polling only: {err}"),
            },
            (Err(err), _) => warn!("mode watcher unavailable, polling only: {err}"),
            _ => {}
        }

        // Coarse poll fallback covers missed watcher events.
        let poll_current = current;
        let poll_path = path;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                apply_mode_file(&poll_path, &poll_current);
            }
        });

        source
    }

    /// Current desired mode.
    pub fn get(&self) -> Mode {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Override the mode in-process. For file-backed sources the file
    /// remains authoritative at the next change or poll.
    pub fn set(&self, mode: Mode) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if *current != mode {
            info!(from = %*current, to = %mode, "operating mode changed");
        }
        *current = mode;
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn apply_mode_file(path: &Path, current: &Arc<RwLock<Mode>>) {
    let previous = *current.read().unwrap_or_else(|e| e.into_inner());
    let next = read_mode_file(path, previous);
    if next != previous {
        info!(from = %previous, to = %next, "operating mode changed");
        *current.write().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

fn read_mode_file(path: &Path, fallback: Mode) -> Mode {
    match std::fs::read_to_string(path) {
        Ok(raw) => match raw.trim().parse::<Mode>() {
            Ok(mode) => mode,
            Err(_) => {
                warn!(
                    file = %path.display(),
                    content = raw.trim(),
                    "unrecognized mode; keeping {fallback}"
                );
                fallback
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(file = %path.display(), "no mode file; defaulting to running");
            Mode::Running
        }
        Err(err) => {
            warn!(file = %path.display(), "failed to read mode file: {err}");
            fallback
        }
    }
}
