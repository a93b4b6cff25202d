//! Carrying out a [`WritePlan`](crate::sync::plan::WritePlan) on disk.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::{StateError, SyncError, WriteError};
use crate::state::TemplateMetadataStore;
use crate::sync::SyncReport;
use crate::sync::plan::Action;
use crate::utils::{atomic_write, prune_empty_dirs};

/// Suffix of the file holding generated bytes that could not be merged.
pub const SIDECAR_SUFFIX: &str = ".generated";

pub(crate) fn sidecar_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}{SIDECAR_SUFFIX}"))
}

type Failure = (Utf8PathBuf, io::Error);

fn remove(root: &Utf8Path, path: &Utf8Path) -> Result<(), Failure> {
    match fs::remove_file(root.join(path)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err((path.to_path_buf(), e)),
        _ => Ok(()),
    }
}

fn write(root: &Utf8Path, path: &Utf8Path, bytes: &[u8]) -> Result<(), Failure> {
    atomic_write(&root.join(path), bytes).map_err(|e| (path.to_path_buf(), e))
}

fn apply_action(root: &Utf8Path, action: &Action) -> Result<(), Failure> {
    match action {
        Action::Write { path, contents, .. } => write(root, path, contents.as_ref()),
        Action::Move {
            from,
            to,
            contents,
            sidecar,
            ..
        } => {
            write(root, to, contents.as_ref())?;
            if let Some(bytes) = sidecar {
                write(root, &sidecar_path(to), bytes)?;
            }
            remove(root, from)
        }
        Action::Skip {
            path,
            sidecar: Some(bytes),
            ..
        } => write(root, &sidecar_path(path), bytes),
        Action::Skip { sidecar: None, .. } | Action::RefuseDelete { .. } => Ok(()),
        Action::Delete { path } => remove(root, path),
    }
}

/// Directories that may be left empty once `actions` have run.
pub(crate) fn vacated_dirs(actions: &[Action]) -> BTreeSet<Utf8PathBuf> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::Move { from: path, .. } | Action::Delete { path } => path.parent(),
            _ => None,
        })
        .map(Utf8Path::to_path_buf)
        .collect()
}

/// Removes the empty directories among `dirs` and their ancestors.
///
/// Must not run while workers may still create files under `root`.
pub(crate) fn prune(root: &Utf8Path, dirs: &BTreeSet<Utf8PathBuf>) {
    // Children sort after their parents.
    for dir in dirs.iter().rev() {
        prune_empty_dirs(root, &root.join(dir));
    }
}

/// Runs every action on a pool of `concurrency` threads.
///
/// Actions never share a path, so they run in any order. Directories are
/// only created here, never removed; see [`prune`]. Results come back in the
/// order of `actions`.
pub(crate) fn run_actions(
    root: &Utf8Path,
    actions: &[Action],
    concurrency: usize,
) -> Result<Vec<Result<(), Failure>>, SyncError> {
    let s = Instant::now();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .thread_name(|i| format!("kumiki-write-{i}"))
        .build()?;

    let span = tracing::span!(Level::INFO, "write");
    span.pb_set_length(actions.len() as u64);
    if let Ok(style) = crate::utils::get_style_progress() {
        span.pb_set_style(&style);
    }
    span.pb_set_message("Writing files");
    let _enter = span.enter();

    let results = pool.install(|| {
        actions
            .par_iter()
            .map(|action| {
                let result = apply_action(root, action);
                span.pb_inc(1);
                result
            })
            .collect()
    });

    tracing::info!(actions = actions.len(), "Finished writing {}", crate::utils::as_overhead(s));
    Ok(results)
}

/// Updates metadata and the report for every action that went through, and
/// gathers the ones that did not.
///
/// A `.generated` sibling left over from an earlier conflict is removed once
/// its file settles without one.
pub(crate) fn settle(
    root: &Utf8Path,
    actions: Vec<Action>,
    results: Vec<Result<(), Failure>>,
    mut metadata: Option<&mut TemplateMetadataStore>,
    report: &mut SyncReport,
) -> Result<Option<WriteError>, StateError> {
    let mut failures = Vec::new();
    let planned: BTreeSet<Utf8PathBuf> = actions.iter().map(|a| a.path().to_path_buf()).collect();

    let clear_sidecar = |path: &Utf8Path, failures: &mut Vec<Failure>| {
        let sidecar = sidecar_path(path);
        // Generated files may themselves end in the suffix.
        if planned.contains(&sidecar) {
            return;
        }
        if let Err(failure) = remove(root, &sidecar) {
            failures.push(failure);
        }
    };

    for (action, result) in actions.into_iter().zip(results) {
        if let Err(failure) = result {
            tracing::error!(path = %failure.0, error = %failure.1, "Failed to write file");
            failures.push(failure);
            continue;
        }

        let conflict = action.is_conflict();
        if conflict {
            tracing::warn!(path = %action.path(), "File has conflicts to resolve by hand");
            report.conflicts.push(action.path().to_path_buf());
        }

        match action {
            Action::Write { path, info, .. } => {
                if let Some(store) = metadata.as_deref_mut() {
                    record(store, &path, info)?;
                }
                clear_sidecar(&path, &mut failures);
                report.written.push(path);
            }
            Action::Move {
                from,
                to,
                info,
                sidecar,
                ..
            } => {
                if let Some(store) = metadata.as_deref_mut() {
                    store.forget(&from)?;
                    record(store, &to, info)?;
                }
                clear_sidecar(&from, &mut failures);
                if sidecar.is_none() {
                    clear_sidecar(&to, &mut failures);
                }
                report.moved.push((from, to));
            }
            Action::Skip {
                path,
                info,
                sidecar,
            } => {
                if let Some(store) = metadata.as_deref_mut() {
                    record(store, &path, info)?;
                }
                if sidecar.is_none() {
                    clear_sidecar(&path, &mut failures);
                }
                if !conflict {
                    report.unchanged.push(path);
                }
            }
            Action::Delete { path } => {
                if let Some(store) = metadata.as_deref_mut() {
                    store.forget(&path)?;
                }
                clear_sidecar(&path, &mut failures);
                report.deleted.push(path);
            }
            Action::RefuseDelete { path } => {
                tracing::warn!(%path, "Refusing to delete edited file");
                report.pending_deletions.push(path);
            }
        }
    }

    Ok(match failures.is_empty() {
        true => None,
        false => Some(WriteError { failures }),
    })
}

fn record(
    store: &mut TemplateMetadataStore,
    path: &Utf8Path,
    info: Option<crate::output::TemplateInfo>,
) -> Result<(), StateError> {
    match info {
        Some(info) => store.record(path, info),
        None => store.forget(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{FileContents, TemplateInfo};

    fn root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_actions_touch_disk() {
        let (_guard, root) = root();
        fs::create_dir_all(root.join("old")).unwrap();
        fs::write(root.join("old/a.txt"), "a").unwrap();
        fs::write(root.join("gone.txt"), "g").unwrap();

        let actions = vec![
            Action::Write {
                path: "w.txt".into(),
                contents: FileContents::from("w"),
                info: None,
                conflict: false,
            },
            Action::Move {
                from: "old/a.txt".into(),
                to: "new/a.txt".into(),
                contents: FileContents::from("a"),
                info: None,
                conflict: false,
                sidecar: None,
            },
            Action::Skip {
                path: "logo.png".into(),
                info: None,
                sidecar: Some(vec![1, 2]),
            },
            Action::Delete {
                path: "gone.txt".into(),
            },
        ];

        let results = run_actions(&root, &actions, 2).unwrap();
        assert!(results.iter().all(Result::is_ok));
        assert!(root.join("old").exists());

        prune(&root, &vacated_dirs(&actions));

        assert_eq!(fs::read_to_string(root.join("w.txt")).unwrap(), "w");
        assert_eq!(fs::read_to_string(root.join("new/a.txt")).unwrap(), "a");
        assert!(!root.join("old").exists());
        assert_eq!(fs::read(root.join("logo.png.generated")).unwrap(), vec![1, 2]);
        assert!(!root.join("gone.txt").exists());
    }

    #[test]
    fn test_failures_are_collected() {
        let (_guard, root) = root();
        // A directory where a file should go makes the rename fail.
        fs::create_dir_all(root.join("blocked/inner")).unwrap();

        let actions = vec![
            Action::Write {
                path: "blocked".into(),
                contents: FileContents::from("x"),
                info: None,
                conflict: false,
            },
            Action::Write {
                path: "fine.txt".into(),
                contents: FileContents::from("y"),
                info: Some(TemplateInfo::new("app", "fine")),
                conflict: false,
            },
        ];

        let results = run_actions(&root, &actions, 1).unwrap();
        let mut metadata = TemplateMetadataStore::new(&root);
        let mut report = SyncReport::default();
        let err = settle(&root, actions, results, Some(&mut metadata), &mut report)
            .unwrap()
            .unwrap();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, Utf8PathBuf::from("blocked"));
        assert_eq!(report.written, vec![Utf8PathBuf::from("fine.txt")]);
        assert!(fs::read_to_string(root.join("fine.txt")).is_ok());
        assert!(metadata.read_for_file(Utf8Path::new("fine.txt")).unwrap().is_some());
    }

    #[test]
    fn test_stale_generated_sibling_is_cleared() {
        let (_guard, root) = root();
        fs::write(root.join("logo.png"), [0u8, 2]).unwrap();
        fs::write(root.join("logo.png.generated"), [0u8, 2]).unwrap();
        fs::write(root.join("data.bin.generated"), [0u8, 3]).unwrap();

        let actions = vec![
            Action::Skip {
                path: "logo.png".into(),
                info: None,
                sidecar: None,
            },
            Action::Write {
                path: "data.bin.generated".into(),
                contents: FileContents::from("kept"),
                info: None,
                conflict: false,
            },
            Action::Write {
                path: "data.bin".into(),
                contents: FileContents::from("x"),
                info: None,
                conflict: false,
            },
        ];

        let results = run_actions(&root, &actions, 2).unwrap();
        let mut report = SyncReport::default();
        let failed = settle(&root, actions, results, None, &mut report).unwrap();

        assert!(failed.is_none());
        assert!(!root.join("logo.png.generated").exists());
        assert_eq!(fs::read_to_string(root.join("data.bin.generated")).unwrap(), "kept");
    }

    #[test]
    fn test_deletes_do_not_race_writes_in_same_directory() {
        for _ in 0..50 {
            let (_guard, root) = root();
            let mut actions = Vec::new();
            for i in 0..8 {
                fs::create_dir_all(root.join(format!("d{i}"))).unwrap();
                fs::write(root.join(format!("d{i}/old.txt")), "old").unwrap();
                actions.push(Action::Delete {
                    path: format!("d{i}/old.txt").into(),
                });
                actions.push(Action::Write {
                    path: format!("d{i}/new.txt").into(),
                    contents: FileContents::from("new"),
                    info: None,
                    conflict: false,
                });
            }

            let results = run_actions(&root, &actions, 8).unwrap();
            assert!(results.iter().all(Result::is_ok));
            prune(&root, &vacated_dirs(&actions));

            for i in 0..8 {
                assert!(root.join(format!("d{i}/new.txt")).exists());
                assert!(!root.join(format!("d{i}/old.txt")).exists());
            }
        }
    }
}
