//! Reconciling generated output with the target directory.
//!
//! A run reads the previous run's state, plans an [`Action`] for every file
//! (three-way merging where both sides changed), applies the plan in
//! parallel and then persists the new state. Edits made by hand survive
//! regeneration; anything that cannot be merged is left for the user with
//! conflict markers or a `.generated` sibling.

mod apply;
mod diff3;
mod format;
mod json;
mod merge;
mod plan;

use std::time::Instant;

use camino::Utf8PathBuf;

use crate::bundle::GeneratorBundle;
use crate::config::SyncOptions;
use crate::engine::{Executor, Phase};
use crate::error::SyncError;
use crate::output::GeneratorOutput;
use crate::snapshot::{DIFF_DIR, SnapshotManifest, apply_snapshot_to_generator_output};
use crate::state::{StateStore, TemplateMetadataStore};

pub use crate::sync::apply::SIDECAR_SUFFIX;
pub use crate::sync::diff3::{diff3_merge, two_way_merge};
pub use crate::sync::format::{CommandFormatter, Formatter, NoopFormatter};
pub use crate::sync::json::json_merge;
pub use crate::sync::merge::{
    DEFAULT_ALGORITHMS, MergeAlgorithm, MergeContext, MergeResult, MergeSettings, Resolution,
    composite_merge, merge_file,
};
pub use crate::sync::plan::{Action, WritePlan};

/// What a sync run did, file by file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files whose contents were written.
    pub written: Vec<Utf8PathBuf>,
    /// Files that followed their id to a new path, as `(from, to)`.
    pub moved: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    pub unchanged: Vec<Utf8PathBuf>,
    pub deleted: Vec<Utf8PathBuf>,
    /// Files with conflict markers or a `.generated` sibling.
    pub conflicts: Vec<Utf8PathBuf>,
    /// Files no longer generated but kept because they were edited.
    pub pending_deletions: Vec<Utf8PathBuf>,
}

impl SyncReport {
    /// Whether anything needs manual attention.
    pub fn has_unresolved(&self) -> bool {
        !self.conflicts.is_empty() || !self.pending_deletions.is_empty()
    }
}

/// Writes a [`GeneratorOutput`] into the output directory of [`SyncOptions`].
pub struct OutputWriter<'a> {
    options: &'a SyncOptions,
    formatter: &'a dyn Formatter,
    algorithms: &'a [MergeAlgorithm],
}

impl<'a> OutputWriter<'a> {
    pub fn new(options: &'a SyncOptions, formatter: &'a dyn Formatter) -> Self {
        Self {
            options,
            formatter,
            algorithms: DEFAULT_ALGORITHMS,
        }
    }

    /// Replaces the merge strategies, tried in order.
    pub fn algorithms(mut self, algorithms: &'a [MergeAlgorithm]) -> Self {
        self.algorithms = algorithms;
        self
    }

    fn state(&self) -> StateStore {
        StateStore::new(self.options.state_path())
    }

    /// Decides every file operation without touching the disk.
    pub fn plan(&self, output: &GeneratorOutput) -> Result<WritePlan, SyncError> {
        let state = self.state();
        let previous = state.previous_file_id_map()?;
        let baselines = state.baselines();

        plan::Planner {
            root: &self.options.output_dir,
            previous: &previous,
            baselines: &baselines,
            formatter: self.formatter,
            algorithms: self.algorithms,
            overwrite: self.options.overwrite,
        }
        .plan(output)
    }

    /// Plans and applies the write, then persists the new state.
    ///
    /// Metadata of the files that were written is saved even when other
    /// files failed; the id map and baselines only move forward once every
    /// file went through.
    pub fn write(&self, output: &GeneratorOutput) -> Result<SyncReport, SyncError> {
        let s = Instant::now();
        let root = &self.options.output_dir;

        let WritePlan {
            actions,
            file_ids,
            baselines,
        } = self.plan(output)?;

        tracing::info!(files = output.len(), actions = actions.len(), "Planned write");

        let vacated = apply::vacated_dirs(&actions);
        let results = apply::run_actions(root, &actions, self.options.concurrency)?;

        let mut report = SyncReport::default();
        let mut metadata = self
            .options
            .template_metadata
            .then(|| TemplateMetadataStore::new(root));

        let failed = apply::settle(root, actions, results, metadata.as_mut(), &mut report)?;

        if let Some(store) = metadata.as_mut() {
            store.flush()?;
        }
        apply::prune(root, &vacated);

        if let Some(err) = failed {
            return Err(err.into());
        }

        let state = self.state();
        state.write_file_id_map(&file_ids)?;
        state.baselines().replace(&baselines)?;

        tracing::info!(
            written = report.written.len(),
            moved = report.moved.len(),
            deleted = report.deleted.len(),
            conflicts = report.conflicts.len(),
            "Finished sync {}",
            crate::utils::as_overhead(s)
        );

        Ok(report)
    }
}

/// Runs `bundle` and reconciles its output with `options.output_dir`.
///
/// When `options.snapshot_dir` is set, the recorded snapshot is applied to
/// the generated output before it is written.
pub fn sync(
    bundle: &GeneratorBundle,
    phases: impl IntoIterator<Item = Phase>,
    options: &SyncOptions,
    formatter: &dyn Formatter,
) -> Result<SyncReport, SyncError> {
    let mut output = Executor::new(phases)
        .concurrency(options.concurrency)
        .run(bundle)?;

    if let Some(dir) = &options.snapshot_dir {
        let manifest = SnapshotManifest::load(dir)?;
        apply_snapshot_to_generator_output(&mut output, &manifest, &dir.join(DIFF_DIR))?;
    }

    OutputWriter::new(options, formatter).write(&output)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino::Utf8Path;

    use super::*;
    use crate::output::{FileData, TemplateInfo};
    use crate::state::SIDECAR_NAME;

    fn options() -> (tempfile::TempDir, SyncOptions) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, SyncOptions::new(root).concurrency(2))
    }

    fn write(options: &SyncOptions, files: &[(&str, &str)]) -> SyncReport {
        let mut output = GeneratorOutput::new();
        for (path, text) in files {
            output
                .add(
                    path,
                    FileData::text(*text).template(TemplateInfo::new("app", "file")),
                )
                .unwrap();
        }
        OutputWriter::new(options, &NoopFormatter).write(&output).unwrap()
    }

    fn read(options: &SyncOptions, path: &str) -> String {
        fs::read_to_string(options.output_dir.join(path)).unwrap()
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let (_guard, options) = options();
        let files = [("src/a.ts", "a\n"), ("b.ts", "b\n")];

        let first = write(&options, &files);
        assert_eq!(first.written.len(), 2);

        let second = write(&options, &files);
        assert!(second.written.is_empty());
        assert_eq!(second.unchanged.len(), 2);
        assert!(!second.has_unresolved());
    }

    #[test]
    fn test_edits_survive_unchanged_generator() {
        let (_guard, options) = options();
        write(&options, &[("a.ts", "one\n")]);
        fs::write(options.output_dir.join("a.ts"), "one\nmine\n").unwrap();

        let report = write(&options, &[("a.ts", "one\n")]);
        assert_eq!(report.unchanged, vec![Utf8PathBuf::from("a.ts")]);
        assert_eq!(read(&options, "a.ts"), "one\nmine\n");
    }

    #[test]
    fn test_metadata_follows_files() {
        let (_guard, options) = options();
        write(&options, &[("dir/a.ts", "a\n")]);

        let sidecar = options.output_dir.join("dir").join(SIDECAR_NAME);
        assert!(sidecar.exists());

        let report = write(&options, &[]);
        assert_eq!(report.deleted, vec![Utf8PathBuf::from("dir/a.ts")]);
        assert!(!sidecar.exists());
        assert!(!options.output_dir.join("dir").exists());
    }

    #[test]
    fn test_metadata_can_be_disabled() {
        let (_guard, options) = options();
        let options = options.template_metadata(false);
        write(&options, &[("a.ts", "a\n")]);

        assert!(!options.output_dir.join(SIDECAR_NAME).exists());
    }

    #[test]
    fn test_binary_conflict_writes_generated_sibling() {
        let (_guard, options) = options();
        let root = options.output_dir.clone();

        let mut output = GeneratorOutput::new();
        output.add("logo.png", FileData::binary(vec![0, 1])).unwrap();
        OutputWriter::new(&options, &NoopFormatter).write(&output).unwrap();

        fs::write(root.join("logo.png"), [0, 9]).unwrap();

        let mut output = GeneratorOutput::new();
        output.add("logo.png", FileData::binary(vec![0, 2])).unwrap();
        let report = OutputWriter::new(&options, &NoopFormatter).write(&output).unwrap();

        assert_eq!(report.conflicts, vec![Utf8PathBuf::from("logo.png")]);
        assert!(report.has_unresolved());
        assert_eq!(fs::read(root.join("logo.png")).unwrap(), vec![0, 9]);
        assert_eq!(fs::read(root.join("logo.png.generated")).unwrap(), vec![0, 2]);

        // Taking the generated bytes resolves the conflict.
        fs::write(root.join("logo.png"), [0u8, 2]).unwrap();
        let report = OutputWriter::new(&options, &NoopFormatter).write(&output).unwrap();

        assert!(!report.has_unresolved());
        assert!(!root.join("logo.png.generated").exists());
    }

    fn files<'a>(paths: &'a [String], text: &'a str) -> Vec<(&'a str, &'a str)> {
        paths.iter().map(|path| (path.as_str(), text)).collect()
    }

    #[test]
    fn test_files_switching_within_directories() {
        for _ in 0..25 {
            let (_guard, options) = options();
            let options = options.concurrency(8);
            let dirs: Vec<String> = (0..8).map(|i| format!("d{i}")).collect();

            let old: Vec<String> = dirs.iter().map(|d| format!("{d}/old.txt")).collect();
            let new: Vec<String> = dirs.iter().map(|d| format!("{d}/new.txt")).collect();

            write(&options, &files(&old, "old\n"));
            let report = write(&options, &files(&new, "new\n"));

            assert_eq!(report.written.len(), 8);
            assert_eq!(report.deleted.len(), 8);
            for dir in &dirs {
                assert!(options.output_dir.join(dir).join("new.txt").exists());
                assert!(!options.output_dir.join(dir).join("old.txt").exists());
            }
        }
    }

    #[test]
    fn test_failed_write_keeps_previous_state() {
        let (_guard, options) = options();
        write(&options, &[("a.ts", "a\n")]);

        let state = StateStore::new(options.state_path());
        let before = state.previous_file_id_map().unwrap();

        // A plain file where a directory should be.
        fs::write(options.output_dir.join("blocker"), "").unwrap();
        let mut output = GeneratorOutput::new();
        output.add("a.ts", FileData::text("a\n")).unwrap();
        output.add("blocker/b.ts", FileData::text("b\n")).unwrap();

        let err = OutputWriter::new(&options, &NoopFormatter)
            .write(&output)
            .unwrap_err();
        assert!(matches!(err, SyncError::Write(ref e) if e.failures.len() == 1));
        assert_eq!(state.previous_file_id_map().unwrap(), before);
        assert!(
            state
                .baselines()
                .read(Utf8Path::new("blocker/b.ts"))
                .unwrap()
                .is_none()
        );
    }
}
