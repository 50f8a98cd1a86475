//! Persisted per-folder log of resolution attempts, used to stop retrying
//! a folder that keeps failing.
//!
//! Backends:
//!   - **JSON** (default): one file holding every folder's log, rewritten
//!     atomically via temp+rename on each change.
//!   - **RocksDB** (behind `full` feature): one key per folder.
//!   - **Memory**: for tests and the demo.
//!
//! Each folder's value is a versioned blob `{version: 1, records: [...]}`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tlfcr_core::{CrError, CrResult, Revision};

use crate::folder::ConflictInput;

const BLOB_VERSION: u32 = 1;

/// One resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Unix milliseconds when the attempt started
    pub time: u64,
    pub merged: Revision,
    pub unmerged: Revision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_string: Option<String>,
}

impl AttemptRecord {
    fn started(input: ConflictInput) -> Self {
        AttemptRecord {
            time: now_millis(),
            merged: input.merged,
            unmerged: input.unmerged,
            error_time: None,
            error_string: None,
            panic_string: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error_time.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptBlob {
    version: u32,
    records: Vec<AttemptRecord>,
}

impl AttemptBlob {
    fn new(records: Vec<AttemptRecord>) -> Self {
        AttemptBlob {
            version: BLOB_VERSION,
            records,
        }
    }

    fn into_records(self) -> CrResult<Vec<AttemptRecord>> {
        if self.version != BLOB_VERSION {
            return Err(CrError::Storage(format!(
                "unsupported attempt log version {}",
                self.version
            )));
        }
        Ok(self.records)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Backends ─────────────────────────────────────────────────────────────────

/// Where attempt records are kept, keyed by folder id.
pub trait AttemptBackend: Send + Sync {
    fn load(&self, folder: &str) -> CrResult<Vec<AttemptRecord>>;
    /// Replace the folder's records; an empty list removes the folder.
    fn store(&self, folder: &str, records: &[AttemptRecord]) -> CrResult<()>;
}

/// In-memory backend.
#[derive(Default)]
pub struct MemoryAttempts {
    folders: Mutex<HashMap<String, Vec<AttemptRecord>>>,
}

impl AttemptBackend for MemoryAttempts {
    fn load(&self, folder: &str) -> CrResult<Vec<AttemptRecord>> {
        let folders = self
            .folders
            .lock()
            .map_err(|_| CrError::inconsistent("attempt log lock poisoned"))?;
        Ok(folders.get(folder).cloned().unwrap_or_default())
    }

    fn store(&self, folder: &str, records: &[AttemptRecord]) -> CrResult<()> {
        let mut folders = self
            .folders
            .lock()
            .map_err(|_| CrError::inconsistent("attempt log lock poisoned"))?;
        if records.is_empty() {
            folders.remove(folder);
        } else {
            folders.insert(folder.to_string(), records.to_vec());
        }
        Ok(())
    }
}

/// JSON file backend: folder id -> blob, rewritten whole on each store.
pub struct JsonAttempts {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonAttempts {
    pub fn open(path: &Path) -> CrResult<Self> {
        let backend = JsonAttempts {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        };
        // Surface a corrupt file at open rather than mid-resolution.
        backend.read_all()?;
        Ok(backend)
    }

    fn read_all(&self) -> CrResult<HashMap<String, AttemptBlob>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_all(&self, blobs: &HashMap<String, AttemptBlob>) -> CrResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(blobs)?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl AttemptBackend for JsonAttempts {
    fn load(&self, folder: &str) -> CrResult<Vec<AttemptRecord>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CrError::inconsistent("attempt log lock poisoned"))?;
        match self.read_all()?.remove(folder) {
            Some(blob) => blob.into_records(),
            None => Ok(Vec::new()),
        }
    }

    fn store(&self, folder: &str, records: &[AttemptRecord]) -> CrResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CrError::inconsistent("attempt log lock poisoned"))?;
        let mut blobs = self.read_all()?;
        if records.is_empty() {
            if blobs.remove(folder).is_none() {
                return Ok(());
            }
        } else {
            blobs.insert(folder.to_string(), AttemptBlob::new(records.to_vec()));
        }
        self.write_all(&blobs)
    }
}

#[cfg(feature = "full")]
mod rocksdb_backend {
    use super::*;

    /// RocksDB backend: one key per folder, written through on every store.
    pub struct RocksDbAttempts {
        db: rocksdb::DB,
    }

    impl RocksDbAttempts {
        pub fn open(path: &Path) -> CrResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);
            let db = rocksdb::DB::open(&opts, path).map_err(|e| {
                CrError::Storage(format!("opening RocksDB {}: {e}", path.display()))
            })?;
            Ok(RocksDbAttempts { db })
        }
    }

    impl AttemptBackend for RocksDbAttempts {
        fn load(&self, folder: &str) -> CrResult<Vec<AttemptRecord>> {
            let value = self
                .db
                .get(folder.as_bytes())
                .map_err(|e| CrError::Storage(format!("RocksDB get failed for {folder}: {e}")))?;
            match value {
                Some(bytes) => serde_json::from_slice::<AttemptBlob>(&bytes)?.into_records(),
                None => Ok(Vec::new()),
            }
        }

        fn store(&self, folder: &str, records: &[AttemptRecord]) -> CrResult<()> {
            let result = if records.is_empty() {
                self.db.delete(folder.as_bytes())
            } else {
                let json = serde_json::to_vec(&AttemptBlob::new(records.to_vec()))?;
                self.db.put(folder.as_bytes(), json)
            };
            result.map_err(|e| CrError::Storage(format!("RocksDB write failed for {folder}: {e}")))
        }
    }
}

#[cfg(feature = "full")]
pub use rocksdb_backend::RocksDbAttempts;

// ── Log ──────────────────────────────────────────────────────────────────────

/// How a record write changed the folder's stuck state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckChange {
    Unchanged,
    BecameStuck,
    BecameUnstuck,
}

/// Attempt bookkeeping plus the stuck rule: a folder with at least
/// `max_attempts` failed records is stuck and is not resolved again until
/// a success or an operator clears it.
pub struct AttemptLog {
    backend: Box<dyn AttemptBackend>,
    max_attempts: usize,
}

impl AttemptLog {
    pub fn new(backend: Box<dyn AttemptBackend>, max_attempts: usize) -> Self {
        AttemptLog {
            backend,
            max_attempts,
        }
    }

    pub fn in_memory(max_attempts: usize) -> Self {
        Self::new(Box::<MemoryAttempts>::default(), max_attempts)
    }

    /// Open the backend for `path`: `*.json` uses the JSON file, anything
    /// else RocksDB when compiled with `full`.
    pub fn open(path: &Path, max_attempts: usize) -> CrResult<Self> {
        let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);

        #[cfg(feature = "full")]
        if !is_json {
            return Ok(Self::new(Box::new(RocksDbAttempts::open(path)?), max_attempts));
        }

        #[cfg(not(feature = "full"))]
        if !is_json {
            tracing::warn!(
                path = %path.display(),
                "RocksDB not compiled in (missing 'full' feature), falling back to JSON attempt log"
            );
        }

        Ok(Self::new(Box::new(JsonAttempts::open(path)?), max_attempts))
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn records(&self, folder: &str) -> CrResult<Vec<AttemptRecord>> {
        self.backend.load(folder)
    }

    pub fn failures(&self, folder: &str) -> CrResult<usize> {
        Ok(self.records(folder)?.iter().filter(|r| r.is_failed()).count())
    }

    pub fn is_stuck(&self, folder: &str) -> CrResult<bool> {
        Ok(self.failures(folder)? >= self.max_attempts)
    }

    /// Record the start of an attempt. A record left unfinished by an
    /// earlier attempt counts as a failure. Refuses with
    /// [`CrError::TooManyAttempts`] once the folder is stuck.
    pub fn begin(&self, folder: &str, input: ConflictInput) -> CrResult<()> {
        let mut records = self.records(folder)?;
        let now = now_millis();
        for record in records.iter_mut().filter(|r| !r.is_failed()) {
            record.error_time = Some(now);
            record.error_string = Some("attempt did not complete".into());
        }
        let failures = records.iter().filter(|r| r.is_failed()).count();
        if failures >= self.max_attempts {
            self.backend.store(folder, &records)?;
            return Err(CrError::TooManyAttempts {
                folder: folder.to_string(),
            });
        }
        records.push(AttemptRecord::started(input));
        self.backend.store(folder, &records)
    }

    /// Mark the running attempt failed.
    pub fn record_failure(
        &self,
        folder: &str,
        error: &str,
        panic: Option<String>,
    ) -> CrResult<StuckChange> {
        let mut records = self.records(folder)?;
        let was_stuck = records.iter().filter(|r| r.is_failed()).count() >= self.max_attempts;
        let now = now_millis();
        match records.iter_mut().rev().find(|r| !r.is_failed()) {
            Some(record) => {
                record.error_time = Some(now);
                record.error_string = Some(error.to_string());
                record.panic_string = panic;
            }
            None => records.push(AttemptRecord {
                error_time: Some(now),
                error_string: Some(error.to_string()),
                panic_string: panic,
                ..AttemptRecord::started(ConflictInput::default())
            }),
        }
        self.backend.store(folder, &records)?;
        let stuck = records.iter().filter(|r| r.is_failed()).count() >= self.max_attempts;
        Ok(match (was_stuck, stuck) {
            (false, true) => StuckChange::BecameStuck,
            _ => StuckChange::Unchanged,
        })
    }

    /// Drop the running attempt's record without counting it.
    pub fn record_canceled(&self, folder: &str) -> CrResult<()> {
        let mut records = self.records(folder)?;
        if let Some(idx) = records.iter().rposition(|r| !r.is_failed()) {
            records.remove(idx);
            self.backend.store(folder, &records)?;
        }
        Ok(())
    }

    /// A success wipes the log.
    pub fn record_success(&self, folder: &str) -> CrResult<StuckChange> {
        self.clear(folder)
    }

    /// Wipe the folder's log.
    pub fn clear(&self, folder: &str) -> CrResult<StuckChange> {
        let was_stuck = self.is_stuck(folder)?;
        self.backend.store(folder, &[])?;
        Ok(if was_stuck {
            StuckChange::BecameUnstuck
        } else {
            StuckChange::Unchanged
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(u: u64, m: u64) -> ConflictInput {
        ConflictInput::new(Revision(u), Revision(m))
    }

    #[test]
    fn test_begin_then_success_clears() {
        let log = AttemptLog::in_memory(3);
        log.begin("f", input(2, 5)).unwrap();
        let records = log.records("f").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].merged, Revision(5));
        assert!(!records[0].is_failed());
        assert_eq!(log.record_success("f").unwrap(), StuckChange::Unchanged);
        assert!(log.records("f").unwrap().is_empty());
    }

    #[test]
    fn test_failures_make_folder_stuck() {
        let log = AttemptLog::in_memory(2);
        log.begin("f", input(2, 5)).unwrap();
        assert_eq!(log.record_failure("f", "boom", None).unwrap(), StuckChange::Unchanged);
        log.begin("f", input(2, 6)).unwrap();
        assert_eq!(
            log.record_failure("f", "boom", Some("panicked".into())).unwrap(),
            StuckChange::BecameStuck
        );
        assert!(log.is_stuck("f").unwrap());
        assert!(matches!(
            log.begin("f", input(2, 7)),
            Err(CrError::TooManyAttempts { .. })
        ));
        assert_eq!(log.records("f").unwrap().len(), 2);
        assert_eq!(
            log.records("f").unwrap()[1].panic_string.as_deref(),
            Some("panicked")
        );
        assert_eq!(log.clear("f").unwrap(), StuckChange::BecameUnstuck);
        assert!(!log.is_stuck("f").unwrap());
    }

    #[test]
    fn test_cancel_removes_running_record() {
        let log = AttemptLog::in_memory(2);
        log.begin("f", input(2, 5)).unwrap();
        log.record_failure("f", "boom", None).unwrap();
        log.begin("f", input(2, 6)).unwrap();
        log.record_canceled("f").unwrap();
        let records = log.records("f").unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_failed());
    }

    #[test]
    fn test_unfinished_record_counts_as_failure() {
        let log = AttemptLog::in_memory(5);
        log.begin("f", input(2, 5)).unwrap();
        // No outcome recorded, as after a crash.
        log.begin("f", input(2, 6)).unwrap();
        assert_eq!(log.failures("f").unwrap(), 1);
        assert_eq!(
            log.records("f").unwrap()[0].error_string.as_deref(),
            Some("attempt did not complete")
        );
    }

    #[test]
    fn test_json_backend_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.json");
        {
            let log = AttemptLog::open(&path, 3).unwrap();
            log.begin("folder-a", input(4, 9)).unwrap();
            log.record_failure("folder-a", "storage error: gone", None).unwrap();
            log.begin("folder-b", input(1, 2)).unwrap();
        }
        let log = AttemptLog::open(&path, 3).unwrap();
        let a = log.records("folder-a").unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].unmerged, Revision(4));
        assert_eq!(a[0].error_string.as_deref(), Some("storage error: gone"));
        assert_eq!(log.records("folder-b").unwrap().len(), 1);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["folder-a"]["version"], 1);

        log.clear("folder-a").unwrap();
        let log = AttemptLog::open(&path, 3).unwrap();
        assert!(log.records("folder-a").unwrap().is_empty());
        assert!(!dir.path().join("attempts.tmp").exists());
    }

    #[test]
    fn test_json_backend_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attempts.json");
        std::fs::write(&path, r#"{"f": {"version": 7, "records": []}}"#).unwrap();
        let log = AttemptLog::open(&path, 3).unwrap();
        assert!(matches!(log.records("f"), Err(CrError::Storage(_))));
    }
}
