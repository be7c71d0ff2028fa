//! ledger.rs: persisted set of identity keys that were actually delivered.
//!
//! The ledger only grows. A key is added after a successful delivery and never
//! removed automatically, so persisting partial progress is always safe.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::errors::LedgerError;

pub const DEFAULT_LEDGER_PATH: &str = "state/sent_articles.json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryLedger {
    keys: BTreeSet<String>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Exact match; callers pass canonical keys.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Returns false if the key was already present.
    pub fn add(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

/// Where the ledger lives between runs.
pub trait LedgerStore: Send + Sync {
    /// Absent state is an empty ledger, never an error.
    fn load(&self) -> Result<DeliveryLedger, LedgerError>;

    /// Must not leave previously persisted entries corrupted if interrupted.
    fn persist(&self, ledger: &DeliveryLedger) -> Result<(), LedgerError>;
}

/// Flat JSON array of keys. Written to a temp file in the same directory and
/// renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for JsonFileStore {
    fn load(&self) -> Result<DeliveryLedger, LedgerError> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DeliveryLedger::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if s.trim().is_empty() {
            return Ok(DeliveryLedger::new());
        }
        let keys: Vec<String> = serde_json::from_str(&s).map_err(|source| LedgerError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(DeliveryLedger::from_keys(keys))
    }

    fn persist(&self, ledger: &DeliveryLedger) -> Result<(), LedgerError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        let keys: Vec<&str> = ledger.iter().collect();
        let json = serde_json::to_vec_pretty(&keys).map_err(|source| LedgerError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let write_tmp = || -> io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
            Ok(())
        };
        write_tmp().map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

/// In-process store for tests and previews. Can be told to fail persists.
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<DeliveryLedger>,
    persists: AtomicUsize,
    fail_persist: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            saved: Mutex::new(DeliveryLedger::from_keys(keys)),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> DeliveryLedger {
        self.saved.lock().expect("ledger mutex poisoned").clone()
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }
}

impl LedgerStore for MemoryStore {
    fn load(&self) -> Result<DeliveryLedger, LedgerError> {
        Ok(self.snapshot())
    }

    fn persist(&self, ledger: &DeliveryLedger) -> Result<(), LedgerError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(LedgerError::Io {
                path: PathBuf::from("<memory>"),
                source: io::Error::new(io::ErrorKind::Other, "persist disabled"),
            });
        }
        *self.saved.lock().expect("ledger mutex poisoned") = ledger.clone();
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn persist_then_load_round_trips_and_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state/sent.json"));
        let ledger = DeliveryLedger::from_keys(["https://a/1", "39123456", "ключ"]);
        store.persist(&ledger).unwrap();
        assert_eq!(store.load().unwrap(), ledger);
        assert!(!dir.path().join("state/sent.json.tmp").exists());
    }

    #[test]
    fn reads_legacy_list_with_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sent_articles.json");
        fs::write(&p, r#"["1", "2", "1"]"#).unwrap();
        let ledger = JsonFileStore::new(&p).load().unwrap();
        assert_eq!(ledger.len(), 2);
        assert!(ledger.contains("1") && ledger.contains("2"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sent.json");
        fs::write(&p, "{not json").unwrap();
        let err = JsonFileStore::new(&p).load().unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }

    #[test]
    fn stale_tmp_file_does_not_affect_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sent.json");
        let store = JsonFileStore::new(&p);
        store.persist(&DeliveryLedger::from_keys(["a"])).unwrap();
        // a crash mid-write leaves only the temp file behind
        fs::write(p.with_extension("json.tmp"), "[\"a\", \"b").unwrap();
        assert_eq!(store.load().unwrap(), DeliveryLedger::from_keys(["a"]));
    }

    #[test]
    fn add_reports_novelty() {
        let mut l = DeliveryLedger::new();
        assert!(l.add("k"));
        assert!(!l.add("k"));
        assert!(l.contains("k"));
        assert!(!l.contains("K"));
    }
}
