use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const STAGING_SUFFIX: &str = ".staging";

/// A staging file beside its target. Dropped without [`commit`](Self::commit)
/// it is deleted, so an interrupted write leaves the target untouched.
struct StagedFile {
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    fn create(target: &Path) -> io::Result<(Self, File)> {
        if let Some(parent) = target.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let staging = staging_path(target);
        let file = File::create(&staging)?;
        let staged = Self {
            staging,
            target: target.to_path_buf(),
            committed: false,
        };
        Ok((staged, file))
    }

    /// `rename` replaces an existing target in one step on every platform
    /// std supports.
    fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.staging);
        }
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(STAGING_SUFFIX);
    target.with_file_name(name)
}

/// Writes `text` through a synced staging file. A host killed mid-reload
/// leaves either the previous state or the new one on disk.
pub(crate) fn write_state_atomic(path: &Path, text: &str) -> io::Result<()> {
    let (staged, mut file) = StagedFile::create(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    drop(file);
    staged.commit()
}

/// `Ok(false)` when there was nothing to remove.
pub(crate) fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn overwrites_and_leaves_no_staging_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("nested").join("stage.json");

        write_state_atomic(&path, "\"running\"").expect("first write");
        write_state_atomic(&path, "\"finished\"").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "\"finished\"");
        assert_eq!(
            staging_path(&path),
            temp.path().join("nested").join("stage.json.staging")
        );
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn failed_commit_removes_the_staging_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("resume.json");
        fs::create_dir(&path).expect("directory in the way");
        fs::write(path.join("keep"), "x").expect("fill directory");

        write_state_atomic(&path, "{}").expect_err("cannot replace a directory");

        assert!(!staging_path(&path).exists());
        assert!(path.join("keep").exists());
    }

    #[test]
    fn remove_reports_whether_file_existed() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("resume.json");
        assert!(!remove_if_present(&path).expect("remove missing"));
        fs::write(&path, "{}").expect("write");
        assert!(remove_if_present(&path).expect("remove present"));
    }
}
