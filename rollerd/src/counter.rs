//! Persistent decrementing counters.
//!
//! Each counter is a list of decay deadlines on disk: the current value is
//! the number of deadlines still in the future. Increments append a
//! deadline and schedule a one-shot task to remove it when it expires, so
//! values decay on their own and survive process restarts.

use chrono::{DateTime, Utc};
use roller_common::{Result, RollerError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A time-decaying counter persisted to a single file.
///
/// All mutations are serialized through a per-counter mutex; `get()` reads
/// a cached size and is O(1).
#[derive(Clone)]
pub struct PersistentCounter {
    inner: Arc<CounterInner>,
}

struct CounterInner {
    path: PathBuf,
    window: Duration,
    deadlines: Mutex<Vec<DateTime<Utc>>>,
    size: AtomicUsize,
}

impl PersistentCounter {
    /// Open the counter at `path`, re-reading any persisted deadlines.
    ///
    /// Already-expired deadlines are dropped immediately; a decay task is
    /// rescheduled for every deadline still in the future.
    pub async fn load_or_create(path: impl Into<PathBuf>, window: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut deadlines = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => parse_deadlines(&raw, &path)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let now = Utc::now();
        let before = deadlines.len();
        deadlines.retain(|d| *d > now);
        let expired = before - deadlines.len();

        let counter = Self {
            inner: Arc::new(CounterInner {
                path,
                window,
                size: AtomicUsize::new(deadlines.len()),
                deadlines: Mutex::new(deadlines),
            }),
        };

        if expired > 0 {
            debug!(
                counter = %counter.inner.path.display(),
                expired,
                "dropped expired deadlines at startup"
            );
            let state = counter.inner.deadlines.lock().await;
            counter.persist(&state).await?;
        }

        {
            let state = counter.inner.deadlines.lock().await;
            for deadline in state.iter() {
                counter.schedule_decay(*deadline);
            }
        }

        Ok(counter)
    }

    /// Increment the counter. The new deadline is persisted before the
    /// decay task is scheduled; persistence failures propagate.
    pub async fn inc(&self) -> Result<()> {
        let window = chrono::Duration::from_std(self.inner.window)
            .map_err(|e| RollerError::fatal(format!("counter window out of range: {e}")))?;
        let deadline = Utc::now() + window;

        let mut state = self.inner.deadlines.lock().await;
        state.push(deadline);
        self.persist(&state).await?;
        self.inner.size.store(state.len(), Ordering::SeqCst);
        drop(state);

        self.schedule_decay(deadline);
        Ok(())
    }

    /// Number of deadlines still in the future.
    pub fn get(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// Truncate the counter to zero.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.inner.deadlines.lock().await;
        state.clear();
        self.persist(&state).await?;
        self.inner.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn schedule_decay(&self, deadline: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let wait = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            decay(&inner, deadline).await;
        });
    }

    async fn persist(&self, deadlines: &[DateTime<Utc>]) -> Result<()> {
        write_deadlines(&self.inner.path, deadlines).await
    }
}

/// Remove one specific deadline. Idempotent: a `reset()` or an earlier
/// decay may already have cleared it.
async fn decay(inner: &CounterInner, deadline: DateTime<Utc>) {
    let mut state = inner.deadlines.lock().await;
    let Some(pos) = state.iter().position(|d| *d == deadline) else {
        debug!(
            counter = %inner.path.display(),
            "decay deadline already cleared"
        );
        return;
    };
    state.remove(pos);
    if let Err(err) = write_deadlines(&inner.path, &state).await {
        warn!(
            counter = %inner.path.display(),
            "failed to persist counter decay: {err}"
        );
    }
    inner.size.store(state.len(), Ordering::SeqCst);
}

/// On-disk format: first line the number of deadlines, then one RFC 3339
/// UTC deadline per line.
fn parse_deadlines(raw: &str, path: &Path) -> Result<Vec<DateTime<Utc>>> {
    let mut lines = raw.lines();
    let Some(count_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let declared: usize = count_line.trim().parse().map_err(|_| {
        RollerError::validation(format!(
            "counter file {} has malformed length prefix {count_line:?}",
            path.display()
        ))
    })?;

    let mut deadlines = Vec::with_capacity(declared);
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = DateTime::parse_from_rfc3339(line).map_err(|e| {
            RollerError::validation(format!(
                "counter file {} has malformed deadline {line:?}: {e}",
                path.display()
            ))
        })?;
        deadlines.push(parsed.with_timezone(&Utc));
    }

    if deadlines.len() != declared {
        warn!(
            counter = %path.display(),
            declared,
            actual = deadlines.len(),
            "counter length prefix disagrees with contents; using contents"
        );
    }
    Ok(deadlines)
}

async fn write_deadlines(path: &Path, deadlines: &[DateTime<Utc>]) -> Result<()> {
    let mut contents = format!("{}\n", deadlines.len());
    for deadline in deadlines {
        contents.push_str(&deadline.to_rfc3339());
        contents.push('\n');
    }

    // Write-temp-then-rename so a crash never leaves a torn file.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
