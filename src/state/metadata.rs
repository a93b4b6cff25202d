use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::StateError;
use crate::output::TemplateInfo;
use crate::utils::{atomic_write, read_optional};

/// Name of the per-directory metadata file.
pub const SIDECAR_NAME: &str = ".templates-info.json";

#[derive(Debug, Default)]
struct Sidecar {
    entries: BTreeMap<String, TemplateInfo>,
    dirty: bool,
}

/// Template metadata of output files, kept in one sidecar per directory.
///
/// Sidecars are loaded on first use and written back by [`flush`]. A file
/// has an entry exactly as long as the file exists.
///
/// [`flush`]: TemplateMetadataStore::flush
#[derive(Debug)]
pub struct TemplateMetadataStore {
    root: Utf8PathBuf,
    sidecars: BTreeMap<Utf8PathBuf, Sidecar>,
}

fn split(path: &Utf8Path) -> (Utf8PathBuf, String) {
    let dir = path.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
    let name = path.file_name().unwrap_or(path.as_str()).to_string();
    (dir, name)
}

impl TemplateMetadataStore {
    /// A store for files under `root`.
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            sidecars: BTreeMap::new(),
        }
    }

    fn sidecar_path(&self, dir: &Utf8Path) -> Utf8PathBuf {
        self.root.join(dir).join(SIDECAR_NAME)
    }

    fn load(&mut self, dir: &Utf8Path) -> Result<&mut Sidecar, StateError> {
        if !self.sidecars.contains_key(dir) {
            let path = self.sidecar_path(dir);
            let bytes = read_optional(&path).map_err(|e| StateError::Io(path.clone(), e))?;
            let entries = match bytes {
                Some(bytes) => {
                    serde_json::from_slice(&bytes).map_err(|e| StateError::Json(path.clone(), e))?
                }
                None => BTreeMap::new(),
            };
            self.sidecars.insert(
                dir.to_path_buf(),
                Sidecar {
                    entries,
                    dirty: false,
                },
            );
        }

        Ok(self.sidecars.entry(dir.to_path_buf()).or_default())
    }

    /// Metadata of the file at `path`, relative to the root.
    pub fn read_for_file(&mut self, path: &Utf8Path) -> Result<Option<TemplateInfo>, StateError> {
        let (dir, name) = split(path);
        Ok(self.load(&dir)?.entries.get(&name).cloned())
    }

    pub fn record(&mut self, path: &Utf8Path, info: TemplateInfo) -> Result<(), StateError> {
        let (dir, name) = split(path);
        let sidecar = self.load(&dir)?;
        if sidecar.entries.get(&name) != Some(&info) {
            sidecar.entries.insert(name, info);
            sidecar.dirty = true;
        }
        Ok(())
    }

    pub fn forget(&mut self, path: &Utf8Path) -> Result<(), StateError> {
        let (dir, name) = split(path);
        let sidecar = self.load(&dir)?;
        if sidecar.entries.remove(&name).is_some() {
            sidecar.dirty = true;
        }
        Ok(())
    }

    /// Writes every changed sidecar. Sidecars left empty are deleted; their
    /// directories are left for the caller to prune.
    pub fn flush(&mut self) -> Result<(), StateError> {
        let root = self.root.clone();

        for (dir, sidecar) in &mut self.sidecars {
            if !sidecar.dirty {
                continue;
            }

            let path = root.join(dir).join(SIDECAR_NAME);
            if sidecar.entries.is_empty() {
                match fs::remove_file(&path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => {
                        return Err(StateError::Io(path, e));
                    }
                    _ => {}
                }
            } else {
                let mut text = serde_json::to_string_pretty(&sidecar.entries)
                    .map_err(|e| StateError::Json(path.clone(), e))?;
                text.push('\n');
                atomic_write(&path, text.as_bytes()).map_err(|e| StateError::Io(path.clone(), e))?;
            }

            tracing::debug!(%path, entries = sidecar.entries.len(), "Wrote template metadata");
            sidecar.dirty = false;
        }

        Ok(())
    }
}
