use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::atomic_io::{remove_if_present, write_state_atomic};
use super::snapshot::ResumeSnapshot;

const STAGE_FILE_NAME: &str = "stage.json";
const RESUME_FILE_NAME: &str = "resume.json";

/// The one value that must survive a full reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedStage {
    #[default]
    NotRun,
    Running,
    ToReload,
    LoadError,
    Finished,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Reload-surviving storage: the stage slot plus the resume blob.
pub trait PersistentStore {
    fn stage(&self) -> PersistedStage;

    fn set_stage(&mut self, stage: PersistedStage) -> Result<(), StoreError>;

    fn save_resume(&mut self, snapshot: &ResumeSnapshot) -> Result<(), StoreError>;

    /// Returns the saved snapshot and clears it.
    fn take_resume(&mut self) -> Result<Option<ResumeSnapshot>, StoreError>;
}

#[derive(Debug, Default)]
struct MemorySlot {
    stage: PersistedStage,
    resume_json: Option<String>,
}

/// Store kept in process memory. Clones share the slot, so a clone held by
/// the host outlives a simulated reload.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Rc<RefCell<MemorySlot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_resume(&self) -> bool {
        self.slot.borrow().resume_json.is_some()
    }
}

impl PersistentStore for MemoryStore {
    fn stage(&self) -> PersistedStage {
        self.slot.borrow().stage
    }

    fn set_stage(&mut self, stage: PersistedStage) -> Result<(), StoreError> {
        self.slot.borrow_mut().stage = stage;
        Ok(())
    }

    fn save_resume(&mut self, snapshot: &ResumeSnapshot) -> Result<(), StoreError> {
        let json = encode_json("resume snapshot", snapshot)?;
        self.slot.borrow_mut().resume_json = Some(json);
        Ok(())
    }

    fn take_resume(&mut self) -> Result<Option<ResumeSnapshot>, StoreError> {
        let taken = self.slot.borrow_mut().resume_json.take();
        taken
            .map(|json| decode_json("resume snapshot", &json))
            .transpose()
    }
}

/// Store backed by `stage.json` and `resume.json` in one directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    stage: PersistedStage,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let stage_path = dir.join(STAGE_FILE_NAME);
        let stage = match read_optional(&stage_path)? {
            None => PersistedStage::NotRun,
            Some(raw) => match serde_json::from_str::<PersistedStage>(&raw) {
                Ok(stage) => stage,
                Err(error) => {
                    warn!(
                        path = %stage_path.display(),
                        error = %error,
                        "unreadable stage file; treating as not run"
                    );
                    PersistedStage::NotRun
                }
            },
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            stage,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stage_path(&self) -> PathBuf {
        self.dir.join(STAGE_FILE_NAME)
    }

    fn resume_path(&self) -> PathBuf {
        self.dir.join(RESUME_FILE_NAME)
    }
}

impl PersistentStore for FileStore {
    fn stage(&self) -> PersistedStage {
        self.stage
    }

    fn set_stage(&mut self, stage: PersistedStage) -> Result<(), StoreError> {
        let path = self.stage_path();
        let json = encode_json("stage", &stage)?;
        write_state_atomic(&path, &json).map_err(|source| StoreError::Write { path, source })?;
        self.stage = stage;
        Ok(())
    }

    fn save_resume(&mut self, snapshot: &ResumeSnapshot) -> Result<(), StoreError> {
        let path = self.resume_path();
        let json = encode_json("resume snapshot", snapshot)?;
        write_state_atomic(&path, &json).map_err(|source| StoreError::Write { path, source })
    }

    fn take_resume(&mut self) -> Result<Option<ResumeSnapshot>, StoreError> {
        let path = self.resume_path();
        let Some(raw) = read_optional(&path)? else {
            return Ok(None);
        };
        remove_if_present(&path).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;
        decode_json("resume snapshot", &raw).map(Some)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn encode_json<T: Serialize>(what: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode { what, source })
}

fn decode_json<T: for<'de> Deserialize<'de>>(
    what: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode { what, source })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::events::RunResults;
    use crate::persist::snapshot::{BlockSnapshot, RESUME_FORMAT_VERSION};
    use crate::tree::TestTree;

    fn sample_snapshot() -> ResumeSnapshot {
        let tree = TestTree::new(1);
        ResumeSnapshot {
            format_version: RESUME_FORMAT_VERSION,
            fingerprint: "abc".to_string(),
            root: BlockSnapshot::capture(&tree, tree.root()),
            test_path: "suite > t".to_string(),
            test_position: vec![0, 0],
            part_index: 1,
            results: RunResults {
                passed: 2,
                ..RunResults::default()
            },
            is_rerun: false,
            run_start_tick: Some(5),
        }
    }

    #[test]
    fn file_store_survives_reopen_and_consumes_resume_once() {
        let temp = TempDir::new().expect("tempdir");
        let mut store = FileStore::open(temp.path()).expect("open");
        assert_eq!(store.stage(), PersistedStage::NotRun);

        store.set_stage(PersistedStage::ToReload).expect("set stage");
        store.save_resume(&sample_snapshot()).expect("save");

        let mut reopened = FileStore::open(temp.path()).expect("reopen");
        assert_eq!(reopened.stage(), PersistedStage::ToReload);
        let resumed = reopened.take_resume().expect("take").expect("present");
        assert_eq!(resumed, sample_snapshot());
        assert!(reopened.take_resume().expect("take again").is_none());
    }

    #[test]
    fn unreadable_stage_file_reads_as_not_run() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(STAGE_FILE_NAME), "not json").expect("write");
        let store = FileStore::open(temp.path()).expect("open");
        assert_eq!(store.stage(), PersistedStage::NotRun);
    }

    #[test]
    fn corrupt_resume_blob_is_decode_error() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(RESUME_FILE_NAME), "{").expect("write");
        let mut store = FileStore::open(temp.path()).expect("open");
        assert!(matches!(
            store.take_resume(),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn memory_store_clones_share_slot() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.set_stage(PersistedStage::Running).expect("set");
        store.save_resume(&sample_snapshot()).expect("save");
        assert_eq!(observer.stage(), PersistedStage::Running);
        assert!(observer.has_resume());
    }
}
