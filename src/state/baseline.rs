use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StateError;
use crate::output::FileContents;
use crate::utils::read_optional;

/// What the generator produced on the previous successful run, one file per
/// output path.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: Utf8PathBuf,
}

impl BaselineStore {
    pub fn new(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// The baseline of `path`, `None` if the file was not generated before.
    pub fn read(&self, path: &Utf8Path) -> Result<Option<FileContents>, StateError> {
        let full = self.dir.join(path);
        let bytes = read_optional(&full).map_err(|e| StateError::Io(full, e))?;
        Ok(bytes.map(FileContents::from_bytes))
    }

    /// Swaps the whole store for `files`.
    ///
    /// The new set is written next to the old one and renamed into place, so
    /// an interrupted run leaves the previous baselines intact.
    pub fn replace(&self, files: &BTreeMap<Utf8PathBuf, FileContents>) -> Result<(), StateError> {
        let name = self.dir.file_name().unwrap_or("baseline");
        let staging = self.dir.with_file_name(format!("{name}.next"));
        let retired = self.dir.with_file_name(format!("{name}.old"));

        let err_at = |path: &Utf8Path| {
            let path = path.to_path_buf();
            move |e: io::Error| StateError::Io(path, e)
        };

        remove_dir_if_exists(&staging).map_err(err_at(&staging))?;
        remove_dir_if_exists(&retired).map_err(err_at(&retired))?;
        fs::create_dir_all(&staging).map_err(err_at(&staging))?;

        for (path, contents) in files {
            let target = staging.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(err_at(parent))?;
            }
            fs::write(&target, contents).map_err(err_at(&target))?;
        }

        if self.dir.exists() {
            fs::rename(&self.dir, &retired).map_err(err_at(&self.dir))?;
        }
        fs::rename(&staging, &self.dir).map_err(err_at(&self.dir))?;
        remove_dir_if_exists(&retired).map_err(err_at(&retired))?;

        tracing::debug!(dir = %self.dir, files = files.len(), "Replaced baselines");
        Ok(())
    }
}

fn remove_dir_if_exists(dir: &Utf8Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
