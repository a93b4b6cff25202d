//! Deciding what happens to every file before anything is touched.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{StateError, SyncError};
use crate::output::{FileContents, FileData, GeneratorOutput, TemplateInfo};
use crate::state::{BaselineStore, FileIdMap};
use crate::sync::format::Formatter;
use crate::sync::merge::{MergeAlgorithm, MergeSettings, Resolution, merge_file};
use crate::utils::read_optional;

/// A single file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `contents` to `path`.
    Write {
        path: Utf8PathBuf,
        contents: FileContents,
        info: Option<TemplateInfo>,
        conflict: bool,
    },
    /// Write `contents` to `to` and remove `from`.
    Move {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        contents: FileContents,
        info: Option<TemplateInfo>,
        conflict: bool,
        sidecar: Option<Vec<u8>>,
    },
    /// Leave the working file as it is, optionally putting the generated
    /// bytes next to it.
    Skip {
        path: Utf8PathBuf,
        info: Option<TemplateInfo>,
        sidecar: Option<Vec<u8>>,
    },
    Delete { path: Utf8PathBuf },
    /// The file is no longer generated, but it was edited.
    RefuseDelete { path: Utf8PathBuf },
}

impl Action {
    /// The path this action leaves the file at.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Action::Write { path, .. }
            | Action::Skip { path, .. }
            | Action::Delete { path }
            | Action::RefuseDelete { path } => path,
            Action::Move { to, .. } => to,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Action::Write { conflict, .. } => *conflict,
            Action::Move {
                conflict, sidecar, ..
            } => *conflict || sidecar.is_some(),
            Action::Skip { sidecar, .. } => sidecar.is_some(),
            Action::Delete { .. } | Action::RefuseDelete { .. } => false,
        }
    }
}

/// Every action of a sync run, plus the state to persist once they all
/// succeed.
#[derive(Debug, Default)]
pub struct WritePlan {
    pub actions: Vec<Action>,
    pub file_ids: FileIdMap,
    pub baselines: BTreeMap<Utf8PathBuf, FileContents>,
}

/// Everything needed to turn a generator output into a [`WritePlan`].
pub(crate) struct Planner<'a> {
    pub root: &'a Utf8Path,
    pub previous: &'a FileIdMap,
    pub baselines: &'a BaselineStore,
    pub formatter: &'a dyn Formatter,
    pub algorithms: &'a [MergeAlgorithm],
    pub overwrite: bool,
}

impl Planner<'_> {
    fn working(&self, path: &Utf8Path) -> Result<Option<FileContents>, StateError> {
        let full = self.root.join(path);
        let bytes = read_optional(&full).map_err(|e| StateError::Io(full, e))?;
        Ok(bytes.map(FileContents::from_bytes))
    }

    fn format(&self, path: &Utf8Path, file: &FileData) -> Result<FileContents, SyncError> {
        match &file.contents {
            FileContents::Text(text)
                if !file.write_options.skip_formatting && self.formatter.supports(path) =>
            {
                let text = self
                    .formatter
                    .format(text, path)
                    .map_err(|e| SyncError::Format(path.to_path_buf(), e))?;
                Ok(FileContents::Text(text))
            }
            contents => Ok(contents.clone()),
        }
    }

    /// Where this file lived in the previous run, if it moved since.
    fn renamed_from<'p>(
        &'p self,
        path: &Utf8Path,
        id: &str,
        file: &FileData,
        output: &GeneratorOutput,
        claimed: &BTreeSet<Utf8PathBuf>,
    ) -> Option<&'p Utf8Path> {
        std::iter::once(id)
            .chain(file.write_options.alternate_ids.iter().map(String::as_str))
            .filter_map(|candidate| self.previous.get(candidate))
            .find(|old| {
                *old != path && output.get(old).is_none() && !claimed.contains(*old)
            })
    }

    pub fn plan(&self, output: &GeneratorOutput) -> Result<WritePlan, SyncError> {
        let mut plan = WritePlan::default();
        // Old paths taken over by a renamed file.
        let mut claimed = BTreeSet::new();
        // Old paths left behind by a rename onto an existing file.
        let mut orphaned = Vec::new();

        for (path, file) in output.iter() {
            let id = file.id.clone().unwrap_or_else(|| path.to_string());
            let generated = self.format(path, file)?;
            let info = file.template_info.clone();

            let from = self
                .renamed_from(path, &id, file, output, &claimed)
                .map(Utf8Path::to_path_buf);

            // A moved file carries its working contents from the old path.
            let (baseline, working, from) = match from {
                Some(old) => {
                    claimed.insert(old.clone());
                    let baseline = self.baselines.read(&old)?;
                    match self.working(path)? {
                        Some(working) => {
                            orphaned.push(old);
                            (baseline, Some(working), None)
                        }
                        None => match self.working(&old)? {
                            Some(working) => (baseline, Some(working.clone()), Some((old, working))),
                            None => (baseline, None, None),
                        },
                    }
                }
                None => (self.baselines.read(path)?, self.working(path)?, None),
            };

            plan.file_ids.insert(id, path.clone());
            plan.baselines.insert(path.clone(), generated.clone());

            let resolution = match &working {
                Some(_) if file.write_options.never_overwrite => Resolution::Keep,
                Some(working) if self.overwrite => match working == &generated {
                    true => Resolution::Keep,
                    false => Resolution::Write {
                        contents: generated,
                        has_conflict: false,
                    },
                },
                working => {
                    let settings = MergeSettings {
                        algorithms: self.algorithms,
                        formatter: self.formatter,
                        skip_formatting: file.write_options.skip_formatting,
                    };
                    merge_file(path, &generated, baseline.as_ref(), working.as_ref(), &settings)
                        .map_err(|e| SyncError::Format(path.clone(), e))?
                }
            };

            tracing::debug!(
                %path,
                from = ?from.as_ref().map(|(old, _)| old),
                resolution = resolution_name(&resolution),
                "Planned file"
            );

            let action = match (from, resolution) {
                (None, Resolution::Keep) => Action::Skip {
                    path: path.clone(),
                    info,
                    sidecar: None,
                },
                (None, Resolution::Sidecar { contents }) => Action::Skip {
                    path: path.clone(),
                    info,
                    sidecar: Some(contents),
                },
                (None, Resolution::Write {
                    contents,
                    has_conflict,
                }) => Action::Write {
                    path: path.clone(),
                    contents,
                    info,
                    conflict: has_conflict,
                },
                (Some((from, kept)), resolution) => {
                    let (contents, conflict, sidecar) = match resolution {
                        Resolution::Write {
                            contents,
                            has_conflict,
                        } => (contents, has_conflict, None),
                        Resolution::Keep => (kept, false, None),
                        Resolution::Sidecar { contents } => (kept, false, Some(contents)),
                    };
                    Action::Move {
                        from,
                        to: path.clone(),
                        contents,
                        info,
                        conflict,
                        sidecar,
                    }
                }
            };

            plan.actions.push(action);
        }

        let mut candidates: Vec<(String, Utf8PathBuf)> = self
            .previous
            .iter()
            .filter(|(id, old)| {
                !plan.file_ids.contains_id(id) && !claimed.contains(*old) && output.get(old).is_none()
            })
            .map(|(id, old)| (id.to_string(), old.to_path_buf()))
            .collect();
        // Orphans lost their id to the renamed file and are tracked by path
        // until they are gone.
        candidates.extend(orphaned.into_iter().map(|old| (old.to_string(), old)));

        let mut seen = BTreeSet::new();
        for (id, old) in candidates {
            if !seen.insert(old.clone()) {
                continue;
            }

            let Some(working) = self.working(&old)? else {
                continue;
            };
            let baseline = self.baselines.read(&old)?;

            if self.overwrite || baseline.as_ref() == Some(&working) {
                tracing::debug!(path = %old, "Planned deletion");
                plan.actions.push(Action::Delete { path: old });
                continue;
            }

            tracing::warn!(path = %old, "File is no longer generated but was edited, keeping it");
            if !plan.file_ids.contains_id(&id) {
                plan.file_ids.insert(id, old.clone());
            }
            if let Some(baseline) = baseline {
                plan.baselines.insert(old.clone(), baseline);
            }
            plan.actions.push(Action::RefuseDelete { path: old });
        }

        Ok(plan)
    }
}

fn resolution_name(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Keep => "keep",
        Resolution::Write {
            has_conflict: true, ..
        } => "conflict",
        Resolution::Write { .. } => "write",
        Resolution::Sidecar { .. } => "sidecar",
    }
}
