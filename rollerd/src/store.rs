//! Roll record storage.
//!
//! A bounded view of recent rolls, one JSON file per roll under
//! `recent_rolls/`, with an in-memory index. Writers race through a
//! compare-and-swap on the record's `db_modified` token; losers get
//! `ConcurrentUpdate` and must re-read.

use chrono::Utc;
use roller_common::{Result, RollRecord, RollerError, truncate_to_micros};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RECENT_ROLLS_DIR: &str = "recent_rolls";

/// Store of recent roll records keyed by roll id.
#[derive(Clone)]
pub struct RollRecordStore {
    inner: Arc<Mutex<StoreState>>,
    dir: PathBuf,
    capacity: usize,
}

struct StoreState {
    records: HashMap<String, RollRecord>,
}

impl RollRecordStore {
    /// Open the store under `workdir/recent_rolls`, loading any persisted
    /// records and pruning the view down to `capacity`.
    pub async fn load_or_create(workdir: &Path, capacity: usize) -> Result<Self> {
        let dir = workdir.join(RECENT_ROLLS_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let mut records = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => {
                    records.insert(record.roll_id.clone(), record);
                }
                Err(err) => {
                    warn!(file = %path.display(), "skipping unreadable roll record: {err}");
                }
            }
        }
        debug!(count = records.len(), dir = %dir.display(), "loaded roll records");

        let store = Self {
            inner: Arc::new(Mutex::new(StoreState { records })),
            dir,
            capacity,
        };
        {
            let mut state = store.inner.lock().await;
            store.evict_over_capacity(&mut state).await;
        }
        Ok(store)
    }

    /// Fetch one record by roll id.
    pub async fn get(&self, roll_id: &str) -> Result<RollRecord> {
        self.inner
            .lock()
            .await
            .records
            .get(roll_id)
            .cloned()
            .ok_or_else(|| RollerError::not_found("roll", roll_id))
    }

    /// Insert or update a record, guarded by compare-and-swap on
    /// `db_modified`.
    ///
    /// Returns the stored record carrying the fresh CAS token.
    pub async fn put_if_fresh(&self, record: RollRecord) -> Result<RollRecord> {
        record.validate()?;

        let mut state = self.inner.lock().await;
        let existing = state.records.get(&record.roll_id);

        match existing {
            Some(stored) => {
                if stored.db_modified != record.db_modified {
                    return Err(RollerError::concurrent_update("roll", &record.roll_id));
                }
                // Terminal statuses are append-only.
                if stored.is_terminal() && record.status != stored.status {
                    return Err(RollerError::validation(format!(
                        "roll {} is already terminal ({}); refusing status change to {}",
                        record.roll_id, stored.status, record.status
                    )));
                }
            }
            None => {
                if record.db_modified.is_some() {
                    return Err(RollerError::validation(format!(
                        "new roll {} must not carry a db_modified timestamp",
                        record.roll_id
                    )));
                }
            }
        }

        let mut token = truncate_to_micros(Utc::now());
        if let Some(prev) = existing.and_then(|r| r.db_modified) {
            if token <= prev {
                token = prev + chrono::Duration::microseconds(1);
            }
        }

        let mut stored = record;
        stored.db_modified = Some(token);
        write_record(&self.record_path(&stored.roll_id), &stored).await?;
        state.records.insert(stored.roll_id.clone(), stored.clone());
        self.evict_over_capacity(&mut state).await;
        Ok(stored)
    }

    /// Recent records, newest first.
    pub async fn get_recent(&self, limit: usize) -> Vec<RollRecord> {
        let state = self.inner.lock().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| b.created.cmp(&a.created));
        records.truncate(limit);
        records
    }

    /// Records that have not reached a terminal status.
    pub async fn get_incomplete(&self) -> Vec<RollRecord> {
        let state = self.inner.lock().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created.cmp(&a.created));
        records
    }

    fn record_path(&self, roll_id: &str) -> PathBuf {
        self.dir.join(format!("{roll_id}.json"))
    }

    async fn evict_over_capacity(&self, state: &mut StoreState) {
        while state.records.len() > self.capacity {
            let Some(oldest) = state
                .records
                .values()
                .min_by_key(|r| r.created)
                .map(|r| r.roll_id.clone())
            else {
                break;
            };
            state.records.remove(&oldest);
            let path = self.record_path(&oldest);
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(file = %path.display(), "failed to prune old roll record: {err}");
            }
            debug!(roll = %oldest, "evicted roll record beyond capacity");
        }
    }
}

async fn read_record(path: &Path) -> Result<RollRecord> {
    let raw = tokio::fs::read_to_string(path).await?;
    let record: RollRecord = serde_json::from_str(&raw)?;
    record.validate()?;
    Ok(record)
}

async fn write_record(path: &Path, record: &RollRecord) -> Result<()> {
    let raw = serde_json::to_string_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
