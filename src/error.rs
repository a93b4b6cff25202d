use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors in how generators, tasks, providers or phases are wired together.
///
/// These are always detected before any file is touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Task '{task}' depends on provider '{provider}', but no task exports it in reach")]
    UnresolvedDependency { task: String, provider: String },

    #[error("Task '{task}' depends on provider '{provider}', which is exported by multiple tasks: {}", .candidates.join(", "))]
    AmbiguousDependency {
        task: String,
        provider: String,
        candidates: Vec<String>,
    },

    #[error("Task '{task}' expects provider '{provider}' of type {expected}, but '{producer}' exports {found}")]
    ProviderTypeMismatch {
        task: String,
        provider: String,
        producer: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Task '{task}' exports provider '{provider}' more than once")]
    DuplicateExport { task: String, provider: String },

    #[error("Task '{task}' depends on provider '{provider}' more than once")]
    DuplicateDependency { task: String, provider: String },

    #[error("Task '{task}' exports to scope '{scope}', but no enclosing generator opens it")]
    UnknownScope { task: String, scope: String },

    #[error("Generator '{generator}' declares task '{task}' more than once")]
    DuplicateTask { generator: String, task: String },

    #[error("Phase '{0}' is declared more than once")]
    DuplicatePhase(String),

    #[error("Phase '{phase}' referenced by '{referenced_by}' does not exist")]
    UnknownPhase { phase: String, referenced_by: String },

    #[error("Phases form a cycle: {}", Cycle(.0))]
    PhaseCycle(Vec<String>),

    #[error("Tasks form a cycle: {}", Cycle(.0))]
    TaskCycle(Vec<String>),

    #[error("Task '{task}' depends on '{dependency}', which runs in a later phase")]
    PhaseOrder { task: String, dependency: String },

    #[error("Task '{task}' cannot add tasks to phase '{phase}': its phase does not declare it")]
    UndeclaredDynamicPhase { task: String, phase: String },

    #[error("Task '{task}' cannot add tasks to phase '{phase}': the phase has already run")]
    PhaseAlreadyRan { task: String, phase: String },
}

/// Renders `[a, b, c]` as `a -> b -> c -> a`.
struct Cycle<'a>(&'a [String]);

impl fmt::Display for Cycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in self.0 {
            write!(f, "{name} -> ")?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

/// Errors raised while executing the task graph.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Task '{0}':\n{1}")]
    Task(String, anyhow::Error),

    #[error("Build step of task '{0}':\n{1}")]
    Build(String, anyhow::Error),

    #[error("Task '{task}' did not export declared provider '{provider}'")]
    MissingExport { task: String, provider: String },

    #[error("Task '{task}' exported provider '{provider}' it never declared")]
    UndeclaredExport { task: String, provider: String },

    #[error("Failed to set up the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors produced while a build step adds files to the output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutputError {
    #[error("File '{0}' was written more than once")]
    DuplicatePath(Utf8PathBuf),

    #[error("File id '{id}' is used by both '{first}' and '{second}'")]
    DuplicateId {
        id: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },

    #[error("Output path '{0}' must be relative and stay inside the output directory")]
    InvalidPath(Utf8PathBuf),
}

/// Errors from looking up provider values inside a running task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider '{0}' is not a declared dependency of this task")]
    NotDeclared(String),

    #[error("Provider '{0}' was not resolved")]
    Absent(String),

    #[error("Provider '{0}' is exported by no task")]
    NotFound(String),

    #[error("Provider '{provider}' is exported by multiple tasks: {}", .candidates.join(", "))]
    Ambiguous {
        provider: String,
        candidates: Vec<String>,
    },

    #[error("Provider '{provider}' holds a value of a different type than {expected}")]
    WrongType {
        provider: String,
        expected: &'static str,
    },
}

/// Every file that could not be written, deleted or moved during a sync.
///
/// Writes that succeeded before or alongside a failure stay on disk.
#[derive(Debug, Error)]
#[error("Failed to write {} file(s):{}", .failures.len(), Failures(.failures))]
pub struct WriteError {
    pub failures: Vec<(Utf8PathBuf, std::io::Error)>,
}

struct Failures<'a>(&'a [(Utf8PathBuf, std::io::Error)]);

impl fmt::Display for Failures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (path, err) in self.0 {
            write!(f, "\n  {path}: {err}")?;
        }
        Ok(())
    }
}

/// Errors around persisted sync state: the file id map, metadata sidecars
/// and the baseline store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Couldn't access '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse '{0}'.\n{1}")]
    Json(Utf8PathBuf, serde_json::Error),
}

/// Errors from recording or replaying a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Couldn't access '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse snapshot manifest '{0}'.\n{1}")]
    Manifest(Utf8PathBuf, serde_json::Error),

    #[error("Snapshot modifies '{0}', but the generator no longer produces it. Regenerate the snapshot.")]
    MissingFile(Utf8PathBuf),

    #[error("Snapshot modifies binary file '{0}', which cannot be patched")]
    BinaryFile(Utf8PathBuf),

    #[error("Diff '{diff_file}' is malformed: {reason}")]
    MalformedDiff { diff_file: String, reason: String },

    #[error(
        "Diff '{diff_file}' no longer applies to '{path}': {reason}. \
         The generated output changed shape; regenerate the diff for this file."
    )]
    PatchFailed {
        path: Utf8PathBuf,
        diff_file: String,
        reason: String,
    },
}

/// Umbrella error for a full generate-and-sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error while generating output.\n{0}")]
    Execute(#[from] ExecuteError),

    #[error("Error while formatting '{0}'.\n{1}")]
    Format(Utf8PathBuf, anyhow::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Failed to set up the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_lists_every_node() {
        let err = ConfigError::TaskCycle(vec!["a#x".into(), "b#y".into(), "c#z".into()]);
        assert_eq!(
            err.to_string(),
            "Tasks form a cycle: a#x -> b#y -> c#z -> a#x"
        );
    }

    #[test]
    fn test_write_error_lists_every_path() {
        let err = WriteError {
            failures: vec![
                ("a.txt".into(), std::io::Error::other("denied")),
                ("b/c.txt".into(), std::io::Error::other("full")),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 file(s)"));
        assert!(text.contains("a.txt: denied"));
        assert!(text.contains("b/c.txt: full"));
    }
}
