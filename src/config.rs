//! Options of a sync run.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Environment variable overriding [`SyncOptions::concurrency`].
pub const CONCURRENCY_ENV: &str = "KUMIKI_CONCURRENCY";

/// How generated output is reconciled with the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Directory the output tree is written into.
    pub output_dir: Utf8PathBuf,
    /// Directory holding the file id map and baselines, relative to
    /// `output_dir`.
    pub state_dir: Utf8PathBuf,
    /// Upper bound on tasks or file writes running at the same time.
    pub concurrency: usize,
    /// Write generated content verbatim, discarding edits in the working tree.
    pub overwrite: bool,
    /// Record which template produced each file in sidecar metadata.
    pub template_metadata: bool,
    /// Recorded deviations to apply on top of the regenerated output.
    pub snapshot_dir: Option<Utf8PathBuf>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            output_dir: Utf8PathBuf::from("."),
            state_dir: Utf8PathBuf::from(".kumiki"),
            concurrency: default_concurrency(),
            overwrite: false,
            template_metadata: true,
            snapshot_dir: None,
        }
    }
}

impl SyncOptions {
    pub fn new(output_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Reads options from a JSON file, then applies environment overrides.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, StateError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| StateError::Io(path.to_owned(), e))?;
        let options: Self =
            serde_json::from_str(&text).map_err(|e| StateError::Json(path.to_owned(), e))?;
        Ok(options.with_env())
    }

    /// Applies `KUMIKI_CONCURRENCY` if it is set to a positive number.
    pub fn with_env(self) -> Self {
        match std::env::var(CONCURRENCY_ENV) {
            Ok(value) => self.with_concurrency_override(&value),
            Err(_) => self,
        }
    }

    fn with_concurrency_override(mut self, value: &str) -> Self {
        match value.trim().parse::<usize>() {
            Ok(n) if n > 0 => self.concurrency = n,
            _ => tracing::warn!(value, "Ignoring invalid {CONCURRENCY_ENV}"),
        }
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn snapshot_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.snapshot_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn template_metadata(mut self, enabled: bool) -> Self {
        self.template_metadata = enabled;
        self
    }

    /// Absolute-or-relative location of the persisted state.
    pub fn state_path(&self) -> Utf8PathBuf {
        self.output_dir.join(&self.state_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options: SyncOptions = serde_json::from_str(r#"{ "outputDir": "out" }"#).unwrap();

        assert_eq!(options.output_dir, Utf8PathBuf::from("out"));
        assert_eq!(options.state_dir, Utf8PathBuf::from(".kumiki"));
        assert!(options.concurrency >= 1);
        assert!(!options.overwrite);
        assert!(options.template_metadata);
        assert_eq!(options.state_path(), Utf8PathBuf::from("out/.kumiki"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kumiki.json")).unwrap();
        fs::write(
            &path,
            r#"{ "outputDir": "gen", "overwrite": true, "snapshotDir": "snap", "concurrency": 3 }"#,
        )
        .unwrap();

        let options = SyncOptions::load(&path).unwrap();
        assert_eq!(options.output_dir, Utf8PathBuf::from("gen"));
        assert!(options.overwrite);
        assert_eq!(options.snapshot_dir, Some(Utf8PathBuf::from("snap")));
    }

    #[test]
    fn test_load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kumiki.json")).unwrap();
        fs::write(&path, "{ nope").unwrap();

        assert!(matches!(SyncOptions::load(&path), Err(StateError::Json(..))));
    }

    #[test]
    fn test_concurrency_override() {
        let options = SyncOptions::default().with_concurrency_override("7");
        assert_eq!(options.concurrency, 7);

        let options = SyncOptions::default().concurrency(2).with_concurrency_override("zero");
        assert_eq!(options.concurrency, 2);

        let options = SyncOptions::default().concurrency(2).with_concurrency_override("0");
        assert_eq!(options.concurrency, 2);
    }
}
