use crate::crash::{CrashInfo, MinimizationState};
use crate::patterns::{CrashSeverity, VulnCategory};
use crate::reproducer::Reproducer;
use bincode::{
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from persisting or reloading crash artifacts.
#[derive(Error, Debug)]
pub enum CrashStoreError {
    /// No crash with this fingerprint is in the store's index.
    #[error("Crash {0} not found in crash store")]
    CrashNotFound(String),

    #[error("Crash store I/O error: {0}")]
    Io(String),

    #[error("Crash store serialization error: {0}")]
    Serialization(String),

    #[error("Crash store deserialization error: {0}")]
    Deserialization(String),
}

impl From<std::io::Error> for CrashStoreError {
    fn from(err: std::io::Error) -> Self {
        CrashStoreError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CrashStoreError {
    fn from(err: serde_json::Error) -> Self {
        CrashStoreError::Deserialization(format!("JSON operation error: {err}"))
    }
}
impl From<EncodeError> for CrashStoreError {
    fn from(err: EncodeError) -> Self {
        CrashStoreError::Serialization(format!("Bincode encoding error: {err}"))
    }
}
impl From<DecodeError> for CrashStoreError {
    fn from(err: DecodeError) -> Self {
        CrashStoreError::Deserialization(format!("Bincode decoding error: {err}"))
    }
}

/// Index metadata for one stored crash, kept in `crash_index.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashIndexEntry {
    pub fingerprint: String,
    pub campaign_id: String,
    pub title: String,
    pub category: VulnCategory,
    pub severity: CrashSeverity,
    pub occurrences: u64,
    pub minimization: MinimizationState,
    pub has_minimized: bool,
    pub first_seen: DateTime<Utc>,
}

impl From<&CrashInfo> for CrashIndexEntry {
    fn from(crash: &CrashInfo) -> Self {
        Self {
            fingerprint: crash.fingerprint().to_string(),
            campaign_id: crash.campaign_id.clone(),
            title: crash.title.clone(),
            category: crash.category,
            severity: crash.severity,
            occurrences: crash.occurrences,
            minimization: crash.minimization,
            has_minimized: crash.minimized_reproducer.is_some(),
            first_seen: crash.first_seen,
        }
    }
}

/// A directory of crash artifacts.
///
/// Layout, per fingerprint `<fp>`:
/// * `<fp>.json`: the full crash record, including the raw log.
/// * `<fp>.repro`: the original reproducer, bincode-encoded.
/// * `<fp>.min.repro`: the minimized reproducer, when there is one.
///
/// Saving the same fingerprint again overwrites its artifacts, so the store
/// always reflects the latest occurrence count and minimization state.
pub struct CrashStore {
    dir: PathBuf,
    index_file_path: PathBuf,
    index: HashMap<String, CrashIndexEntry>,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl CrashStore {
    const INDEX_FILENAME: &'static str = "crash_index.json";
    const REPORT_EXTENSION: &'static str = "json";
    const REPRO_EXTENSION: &'static str = "repro";
    const MIN_REPRO_EXTENSION: &'static str = "min.repro";

    /// Opens the store at `dir`, creating the directory and reloading any index found there.
    pub fn new(dir: PathBuf) -> Result<Self, CrashStoreError> {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                CrashStoreError::Io(format!("Failed to create crash directory at {dir:?}: {e}"))
            })?;
        } else if !dir.is_dir() {
            return Err(CrashStoreError::Io(format!(
                "Crash store path {dir:?} exists but is not a directory"
            )));
        }

        let index_file_path = dir.join(Self::INDEX_FILENAME);
        let mut store = Self {
            dir,
            index_file_path,
            index: HashMap::new(),
            bincode_config: bincode::config::standard()
                .with_little_endian()
                .with_fixed_int_encoding(),
        };
        store.load_index_from_disk()?;
        if !store.index_file_path.exists() {
            store.save_index_to_disk()?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.index.contains_key(fingerprint)
    }

    /// Index entries, most severe first, then oldest first.
    pub fn entries(&self) -> Vec<&CrashIndexEntry> {
        let mut entries: Vec<&CrashIndexEntry> = self.index.values().collect();
        entries.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(a.first_seen.cmp(&b.first_seen))
                .then(a.fingerprint.cmp(&b.fingerprint))
        });
        entries
    }

    /// Writes (or rewrites) every artifact of `crash` and updates the index.
    pub fn save(&mut self, crash: &CrashInfo) -> Result<(), CrashStoreError> {
        let fingerprint = crash.fingerprint();
        let report_path = self.artifact_path(fingerprint, Self::REPORT_EXTENSION);
        let writer = BufWriter::new(File::create(&report_path)?);
        serde_json::to_writer_pretty(writer, crash).map_err(|e| {
            CrashStoreError::Serialization(format!(
                "Failed to serialize crash report {report_path:?}: {e}"
            ))
        })?;

        self.write_reproducer(
            &self.artifact_path(fingerprint, Self::REPRO_EXTENSION),
            &crash.reproducer,
        )?;
        let min_path = self.artifact_path(fingerprint, Self::MIN_REPRO_EXTENSION);
        match &crash.minimized_reproducer {
            Some(minimized) => self.write_reproducer(&min_path, minimized)?,
            None if min_path.exists() => fs::remove_file(&min_path)?,
            None => {}
        }

        self.index
            .insert(fingerprint.to_string(), CrashIndexEntry::from(crash));
        self.save_index_to_disk()?;
        tracing::debug!(fingerprint, dir = ?self.dir, "Crash artifacts saved");
        Ok(())
    }

    /// Reloads the full crash record.
    pub fn load(&self, fingerprint: &str) -> Result<CrashInfo, CrashStoreError> {
        if !self.contains(fingerprint) {
            return Err(CrashStoreError::CrashNotFound(fingerprint.to_string()));
        }
        let report_path = self.artifact_path(fingerprint, Self::REPORT_EXTENSION);
        let reader = BufReader::new(File::open(&report_path).map_err(|e| {
            CrashStoreError::Io(format!("Failed to open crash report {report_path:?}: {e}"))
        })?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Loads the stored original or minimized reproducer.
    pub fn load_reproducer(
        &self,
        fingerprint: &str,
        minimized: bool,
    ) -> Result<Reproducer, CrashStoreError> {
        let Some(entry) = self.index.get(fingerprint) else {
            return Err(CrashStoreError::CrashNotFound(fingerprint.to_string()));
        };
        if minimized && !entry.has_minimized {
            return Err(CrashStoreError::CrashNotFound(format!(
                "{fingerprint} (no minimized reproducer)"
            )));
        }
        let extension = if minimized {
            Self::MIN_REPRO_EXTENSION
        } else {
            Self::REPRO_EXTENSION
        };
        let path = self.artifact_path(fingerprint, extension);
        let content = fs::read(&path)
            .map_err(|e| CrashStoreError::Io(format!("Failed to read reproducer {path:?}: {e}")))?;
        if content.is_empty() {
            return Err(CrashStoreError::Deserialization(format!(
                "Reproducer file {path:?} is empty, cannot deserialize."
            )));
        }
        let (reproducer, _length): (Reproducer, usize) =
            bincode::decode_from_slice(&content, self.bincode_config)?;
        Ok(reproducer)
    }

    fn artifact_path(&self, fingerprint: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.{extension}"))
    }

    fn write_reproducer(
        &self,
        path: &Path,
        reproducer: &Reproducer,
    ) -> Result<(), CrashStoreError> {
        let encoded = bincode::encode_to_vec(reproducer, self.bincode_config)?;
        fs::write(path, encoded)
            .map_err(|e| CrashStoreError::Io(format!("Failed to write reproducer {path:?}: {e}")))
    }

    fn save_index_to_disk(&self) -> Result<(), CrashStoreError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CrashStoreError::Io(format!(
                "Failed to create or truncate index file {:?}: {}",
                self.index_file_path, e
            ))
        })?;
        let mut entries: Vec<&CrashIndexEntry> = self.index.values().collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        serde_json::to_writer_pretty(BufWriter::new(file), &entries).map_err(|e| {
            CrashStoreError::Serialization(format!(
                "Failed to serialize crash index to JSON for {:?}: {}",
                self.index_file_path, e
            ))
        })
    }

    fn load_index_from_disk(&mut self) -> Result<(), CrashStoreError> {
        self.index.clear();
        if !self.index_file_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_file_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let entries: Vec<CrashIndexEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| {
                CrashStoreError::Deserialization(format!(
                    "Failed to parse JSON from index file {:?}: {}. The file might be corrupted.",
                    self.index_file_path, e
                ))
            })?;
        self.index = entries
            .into_iter()
            .map(|entry| (entry.fingerprint.clone(), entry))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_crash(title: &str, category: VulnCategory) -> CrashInfo {
        CrashInfo::new(
            "campaign-1",
            category,
            title,
            Reproducer::from(vec!["r0 = open(f)", "write(r0, 0x10)", "close(r0)"]),
            vec!["vuln_func+0x10/0x40".to_string(), "do_syscall_64+0x30/0x80".to_string()],
            Some("vuln_func".to_string()),
            format!("{title}\nCall Trace:\n vuln_func+0x10/0x40\n"),
        )
    }

    #[test]
    fn new_store_creates_directory_and_empty_index() -> Result<(), CrashStoreError> {
        let dir = tempdir()?;
        let path = dir.path().join("crashes");
        let store = CrashStore::new(path.clone())?;
        assert!(store.is_empty());
        assert!(path.join("crash_index.json").is_file());
        assert_eq!(store.dir(), path.as_path());
        Ok(())
    }

    #[test]
    fn saved_crashes_survive_reopening() -> Result<(), CrashStoreError> {
        let dir = tempdir()?;
        let mut crash = sample_crash(
            "BUG: KASAN: use-after-free in vuln_func+0x10/0x40",
            VulnCategory::UseAfterFree,
        );
        crash.minimized_reproducer = Some(Reproducer::from(vec!["r0 = open(f)", "close(r0)"]));
        crash.minimization = MinimizationState::Minimized;
        {
            let mut store = CrashStore::new(dir.path().to_path_buf())?;
            store.save(&crash)?;
            assert_eq!(store.len(), 1);
        }

        let store = CrashStore::new(dir.path().to_path_buf())?;
        assert!(store.contains(crash.fingerprint()));
        assert_eq!(store.load(crash.fingerprint())?, crash);
        assert_eq!(
            store.load_reproducer(crash.fingerprint(), false)?,
            crash.reproducer
        );
        assert_eq!(
            store.load_reproducer(crash.fingerprint(), true)?.ops(),
            &["r0 = open(f)", "close(r0)"]
        );
        let entry = store.entries()[0];
        assert!(entry.has_minimized);
        assert_eq!(entry.severity, CrashSeverity::Critical);
        Ok(())
    }

    #[test]
    fn resaving_updates_index_and_drops_stale_minimized_file() -> Result<(), CrashStoreError> {
        let dir = tempdir()?;
        let mut store = CrashStore::new(dir.path().to_path_buf())?;
        let mut crash = sample_crash("WARNING: CPU: 0 PID: 1 at vuln_func", VulnCategory::Warning);
        crash.minimized_reproducer = Some(Reproducer::from(vec!["close(r0)"]));
        store.save(&crash)?;

        crash.occurrences = 4;
        crash.minimized_reproducer = None;
        crash.minimization = MinimizationState::Unstable;
        store.save(&crash)?;

        assert_eq!(store.len(), 1);
        let entry = store.entries()[0];
        assert_eq!(entry.occurrences, 4);
        assert_eq!(entry.minimization, MinimizationState::Unstable);
        assert!(matches!(
            store.load_reproducer(crash.fingerprint(), true),
            Err(CrashStoreError::CrashNotFound(_))
        ));
        assert!(!dir
            .path()
            .join(format!("{}.min.repro", crash.fingerprint()))
            .exists());
        Ok(())
    }

    #[test]
    fn entries_are_ordered_by_severity() -> Result<(), CrashStoreError> {
        let dir = tempdir()?;
        let mut store = CrashStore::new(dir.path().to_path_buf())?;
        store.save(&sample_crash("WARNING: odd state in vuln_func", VulnCategory::Warning))?;
        store.save(&sample_crash(
            "BUG: KASAN: double-free in vuln_func+0x10/0x40",
            VulnCategory::DoubleFree,
        ))?;
        let severities: Vec<CrashSeverity> = store.entries().iter().map(|e| e.severity).collect();
        assert_eq!(severities, vec![CrashSeverity::Critical, CrashSeverity::Low]);
        Ok(())
    }

    #[test]
    fn unknown_fingerprints_and_corrupt_index_are_errors() -> Result<(), CrashStoreError> {
        let dir = tempdir()?;
        let store = CrashStore::new(dir.path().to_path_buf())?;
        assert!(matches!(
            store.load("deadbeef"),
            Err(CrashStoreError::CrashNotFound(_))
        ));
        assert!(matches!(
            store.load_reproducer("deadbeef", false),
            Err(CrashStoreError::CrashNotFound(_))
        ));

        fs::write(dir.path().join("crash_index.json"), b"{ not json")?;
        assert!(matches!(
            CrashStore::new(dir.path().to_path_buf()),
            Err(CrashStoreError::Deserialization(_))
        ));
        Ok(())
    }
}
