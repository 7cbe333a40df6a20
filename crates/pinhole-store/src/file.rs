//! JSON file backed rule store
//!
//! Keeps every anchor in a single JSON document that is re-read on each call,
//! so separate processes (e.g. successive CLI invocations) see one rule list
//! with the same ticket semantics as [`crate::MemoryRuleStore`].
//!
//! Every call holds an exclusive `flock` on a sibling `.lock` file for its
//! whole load/check/save cycle. Writes go to a fresh temp file in the same
//! directory which is then renamed over the rule file.

use crate::anchor::AnchorRules;
use crate::{
    AnchorHandle, ChangeTicket, CommitOutcome, Enumeration, RulePosition, RuleStore, StoreError,
};
use pinhole_proto::{RuleSpec, RuleView};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    anchors: BTreeMap<String, AnchorRules>,
}

/// Exclusive lock on a rule file, released on drop
struct FileLock {
    _file: File,
}

/// Rule store persisted to a JSON file
pub struct FileRuleStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current rules of an anchor, empty if the anchor does not exist
    pub fn rules(&self, anchor: &str) -> Result<Vec<RuleView>, StoreError> {
        let _lock = self.lock()?;
        let file = self.load()?;
        Ok(file
            .anchors
            .get(anchor)
            .map(|rules| rules.rules().to_vec())
            .unwrap_or_default())
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock(&self) -> Result<FileLock, StoreError> {
        let dir = self.dir();
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create directory {:?}: {}", dir, e)))?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| {
                StoreError::Io(format!("Failed to open lock file {:?}: {}", self.lock_path, e))
            })?;

        flock_exclusive(&file).map_err(|e| {
            StoreError::Io(format!("Failed to lock {:?}: {}", self.lock_path, e))
        })?;
        Ok(FileLock { _file: file })
    }

    fn load(&self) -> Result<RuleFile, StoreError> {
        if !self.path.exists() {
            return Ok(RuleFile::default());
        }

        let json = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to read {:?}: {}", self.path, e)))?;

        serde_json::from_str(&json)
            .map_err(|e| StoreError::Serialization(format!("Failed to parse {:?}: {}", self.path, e)))
    }

    /// Replace the rule file; the caller holds the lock
    fn save(&self, file: &RuleFile) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(file)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let dir = self.dir();
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create temp file in {:?}: {}", dir, e)))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::Io(format!("Failed to write {:?}: {}", tmp.path(), e)))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to replace {:?}: {}", self.path, e.error)))?;
        Ok(())
    }

    fn read<T>(
        &self,
        anchor: &str,
        f: impl FnOnce(&AnchorRules) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let file = self.load()?;
        let rules = file
            .anchors
            .get(anchor)
            .ok_or_else(|| StoreError::UnknownAnchor(anchor.to_string()))?;
        f(rules)
    }

    fn update(
        &self,
        anchor: &str,
        f: impl FnOnce(&mut AnchorRules) -> Result<CommitOutcome, StoreError>,
    ) -> Result<CommitOutcome, StoreError> {
        let _lock = self.lock()?;
        let mut file = self.load()?;
        let rules = file
            .anchors
            .get_mut(anchor)
            .ok_or_else(|| StoreError::UnknownAnchor(anchor.to_string()))?;

        let outcome = f(rules)?;
        if outcome == CommitOutcome::Committed {
            self.save(&file)?;
        }
        Ok(outcome)
    }
}

/// Block until an exclusive flock on `file` is held
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file` for the whole call.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

impl RuleStore for FileRuleStore {
    fn open(&self, anchor: &str) -> Result<AnchorHandle, StoreError> {
        let _lock = self.lock()?;
        let mut file = self.load()?;
        if !file.anchors.contains_key(anchor) {
            debug!("Creating anchor {} in {:?}", anchor, self.path);
            file.anchors.insert(anchor.to_string(), AnchorRules::default());
            self.save(&file)?;
        }
        Ok(AnchorHandle::new(anchor))
    }

    fn begin_enumeration(&self, anchor: &AnchorHandle) -> Result<Enumeration, StoreError> {
        self.read(anchor.name(), |rules| Ok(rules.enumerate(anchor.name())))
    }

    fn get_rule(&self, position: &RulePosition) -> Result<RuleView, StoreError> {
        self.read(position.anchor(), |rules| rules.get(position))
    }

    fn request_change_ticket(&self, anchor: &AnchorHandle) -> Result<ChangeTicket, StoreError> {
        self.read(anchor.name(), |rules| Ok(rules.change_ticket(anchor.name())))
    }

    fn commit_add(
        &self,
        ticket: &ChangeTicket,
        rule: RuleSpec,
    ) -> Result<CommitOutcome, StoreError> {
        self.update(ticket.anchor(), |rules| Ok(rules.append(ticket, rule)))
    }

    fn commit_remove(
        &self,
        ticket: &ChangeTicket,
        position: &RulePosition,
    ) -> Result<CommitOutcome, StoreError> {
        self.update(ticket.anchor(), |rules| rules.remove(ticket, position))
    }
}
