//! Recording and replaying intentional deviations from generated output.
//!
//! A snapshot is a directory holding `manifest.json` and one unified diff
//! per modified file under `diffs/`. Applying a snapshot to a fresh
//! generator output reproduces the working tree it was captured from.

mod patch;

use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SnapshotError;
use crate::output::{FileContents, GeneratorOutput};
use crate::utils::{atomic_write, read_optional};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const DIFF_DIR: &str = "diffs";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedFile {
    pub path: Utf8PathBuf,
    /// Name of the diff inside the diff directory.
    pub diff_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFiles {
    #[serde(default)]
    pub modified: Vec<ModifiedFile>,
    #[serde(default)]
    pub deleted: Vec<Utf8PathBuf>,
}

/// Index of a snapshot directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    #[serde(default)]
    pub files: SnapshotFiles,
}

fn io_at(path: &Utf8Path) -> impl FnOnce(io::Error) -> SnapshotError + '_ {
    move |e| SnapshotError::Io(path.to_path_buf(), e)
}

impl SnapshotManifest {
    /// Reads `{dir}/manifest.json`. A directory without a manifest holds an
    /// empty snapshot.
    pub fn load(dir: impl AsRef<Utf8Path>) -> Result<Self, SnapshotError> {
        let path = dir.as_ref().join(MANIFEST_NAME);
        match read_optional(&path).map_err(io_at(&path))? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Manifest(path, e))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, dir: impl AsRef<Utf8Path>) -> Result<(), SnapshotError> {
        let path = dir.as_ref().join(MANIFEST_NAME);
        let mut text =
            serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Manifest(path.clone(), e))?;
        text.push('\n');
        atomic_write(&path, text.as_bytes()).map_err(io_at(&path))
    }

    /// Records how the files under `working_dir` deviate from `output`, and
    /// saves the result as a snapshot in `dir`.
    ///
    /// Generated files missing from the working tree are recorded as deleted.
    /// Files that exist only in the working tree are not part of a snapshot.
    pub fn capture(
        output: &GeneratorOutput,
        working_dir: impl AsRef<Utf8Path>,
        dir: impl AsRef<Utf8Path>,
    ) -> Result<Self, SnapshotError> {
        let working_dir = working_dir.as_ref();
        let dir = dir.as_ref();
        let diff_dir = dir.join(DIFF_DIR);

        match fs::remove_dir_all(&diff_dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(SnapshotError::Io(diff_dir, e));
            }
            _ => {}
        }

        let mut manifest = Self::default();

        for (path, file) in output.iter() {
            let full = working_dir.join(path);
            let Some(bytes) = read_optional(&full).map_err(io_at(&full))? else {
                manifest.files.deleted.push(path.clone());
                continue;
            };

            if bytes == file.contents.as_ref() {
                continue;
            }

            let current = FileContents::from_bytes(bytes);
            let (Some(generated), Some(edited)) = (file.contents.as_text(), current.as_text())
            else {
                return Err(SnapshotError::BinaryFile(path.clone()));
            };

            let diff_file = save_snapshot_diff_file(&diff_dir, path, generated, edited)?;
            manifest.files.modified.push(ModifiedFile {
                path: path.clone(),
                diff_file,
            });
        }

        manifest.save(dir)?;

        tracing::info!(
            modified = manifest.files.modified.len(),
            deleted = manifest.files.deleted.len(),
            %dir,
            "Captured snapshot"
        );

        Ok(manifest)
    }
}

/// File name of the diff stored for `path`.
///
/// Separators become `__`; the hash suffix keeps names unique when two paths
/// flatten to the same string.
pub fn diff_file_name(path: &Utf8Path) -> String {
    let slug = path.as_str().replace(['/', '\\'], "__");
    let hash = Hash32::hash(path.as_str()).to_hex();
    format!("{slug}-{}.diff", &hash[..8])
}

/// Writes the unified diff from `generated` to `working` into `diff_dir` and
/// returns its file name.
pub fn save_snapshot_diff_file(
    diff_dir: impl AsRef<Utf8Path>,
    path: &Utf8Path,
    generated: &str,
    working: &str,
) -> Result<String, SnapshotError> {
    let name = diff_file_name(path);
    let target = diff_dir.as_ref().join(&name);

    let diff = similar::TextDiff::from_lines(generated, working)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();

    atomic_write(&target, diff.as_bytes()).map_err(io_at(&target))?;
    tracing::debug!(%path, diff = %name, "Saved snapshot diff");

    Ok(name)
}

/// Replays a snapshot on top of freshly generated output.
///
/// Deleted files are dropped from `output`; every recorded diff must apply
/// cleanly to the file it was captured from.
pub fn apply_snapshot_to_generator_output(
    output: &mut GeneratorOutput,
    manifest: &SnapshotManifest,
    diff_dir: impl AsRef<Utf8Path>,
) -> Result<(), SnapshotError> {
    let diff_dir = diff_dir.as_ref();

    for path in &manifest.files.deleted {
        if output.remove(path).is_none() {
            tracing::debug!(%path, "Snapshot deletes a file that is no longer generated");
        }
    }

    for ModifiedFile { path, diff_file } in &manifest.files.modified {
        let file = output
            .get(path)
            .ok_or_else(|| SnapshotError::MissingFile(path.clone()))?;
        let text = file
            .contents
            .as_text()
            .ok_or_else(|| SnapshotError::BinaryFile(path.clone()))?;

        let diff_path = diff_dir.join(diff_file);
        let diff = fs::read_to_string(&diff_path).map_err(io_at(&diff_path))?;

        let hunks = patch::parse(&diff).map_err(|reason| SnapshotError::MalformedDiff {
            diff_file: diff_file.clone(),
            reason,
        })?;

        let patched = patch::apply(text, &hunks).map_err(|reason| SnapshotError::PatchFailed {
            path: path.clone(),
            diff_file: diff_file.clone(),
            reason,
        })?;

        output.replace_contents(path, FileContents::Text(patched));
    }

    tracing::debug!(
        modified = manifest.files.modified.len(),
        deleted = manifest.files.deleted.len(),
        "Applied snapshot"
    );

    Ok(())
}
