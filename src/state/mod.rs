//! State persisted between sync runs.
//!
//! Everything lives in the output directory: the file id map and the
//! baselines under the state directory, template metadata in sidecars next
//! to the files they describe.

mod baseline;
mod file_ids;
mod metadata;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StateError;
use crate::utils::{atomic_write, read_optional};

pub use crate::output::TemplateInfo;
pub use crate::state::baseline::BaselineStore;
pub use crate::state::file_ids::FileIdMap;
pub use crate::state::metadata::{SIDECAR_NAME, TemplateMetadataStore};

pub const FILE_ID_MAP_NAME: &str = "file-id-map.json";

/// Entry point to the state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: Utf8PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn file_id_map_path(&self) -> Utf8PathBuf {
        self.dir.join(FILE_ID_MAP_NAME)
    }

    /// The id map written by the last successful run, empty on first run.
    pub fn previous_file_id_map(&self) -> Result<FileIdMap, StateError> {
        let path = self.file_id_map_path();
        match read_optional(&path).map_err(|e| StateError::Io(path.clone(), e))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StateError::Json(path, e)),
            None => Ok(FileIdMap::new()),
        }
    }

    pub fn write_file_id_map(&self, map: &FileIdMap) -> Result<(), StateError> {
        let path = self.file_id_map_path();
        let text = map.to_json().map_err(|e| StateError::Json(path.clone(), e))?;
        atomic_write(&path, text.as_bytes()).map_err(|e| StateError::Io(path, e))
    }

    pub fn baselines(&self) -> BaselineStore {
        BaselineStore::new(self.dir.join("baseline"))
    }
}
