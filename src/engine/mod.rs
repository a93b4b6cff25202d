//! Phases, scheduling and the two-pass task executor.

mod cycle;
mod phase;
mod runner;
mod schedule;

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::bundle::GeneratorBundle;
use crate::core::{ArcStr, Dynamic};
use crate::error::{OutputError, ProviderError};
use crate::output::{FileData, GeneratorOutput};
use crate::provider::ProviderType;
use crate::tree::{GeneratorEntry, GeneratorTree, TaskEntry};

pub use crate::engine::phase::{Phase, sort_phases};
pub use crate::engine::runner::Executor;
pub use crate::engine::schedule::Schedule;

/// Deferred side of a task, run once every phase has finished pass 1.
pub type BuildStep = Box<dyn FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send>;

/// Resolved dependency values of one task, keyed by provider name.
/// `None` marks an optional dependency that resolved to nothing.
pub(crate) type Values = HashMap<ArcStr, Option<Dynamic>>;

fn read<'v, T: 'static>(values: &'v Values, name: &str) -> Result<Option<&'v T>, ProviderError> {
    match values.get(name) {
        None => Err(ProviderError::NotDeclared(name.to_string())),
        Some(None) => Ok(None),
        Some(Some(value)) => value
            .downcast_ref::<T>()
            .map(Some)
            .ok_or_else(|| ProviderError::WrongType {
                provider: name.to_string(),
                expected: type_name::<T>(),
            }),
    }
}

/// What a running task sees: its identity and its dependency values.
pub struct TaskContext<'a> {
    pub(crate) task: &'a TaskEntry,
    pub(crate) generator: &'a GeneratorEntry,
    pub(crate) values: Values,
}

impl TaskContext<'_> {
    /// Value of a required dependency.
    pub fn get<T>(&self, provider: &ProviderType<T>) -> Result<&T, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        read(&self.values, provider.name())?
            .ok_or_else(|| ProviderError::Absent(provider.name().to_string()))
    }

    /// Value of an optional dependency, `None` when nothing provides it.
    pub fn get_optional<T>(&self, provider: &ProviderType<T>) -> Result<Option<&T>, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        read(&self.values, provider.name())
    }

    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    pub fn generator_id(&self) -> &str {
        self.generator.id()
    }

    pub fn base_directory(&self) -> &Utf8Path {
        self.generator.base_directory()
    }
}

/// A bundle a task asks to instantiate, with its tasks placed in `phase`.
pub(crate) struct Spawn {
    pub(crate) phase: ArcStr,
    pub(crate) key: String,
    pub(crate) bundle: GeneratorBundle,
}

/// Result of a task's run callback.
///
/// ```rust
/// use kumiki::{FileData, ProviderType, TaskOutput};
///
/// let name: ProviderType<String> = ProviderType::new("name");
///
/// let output = TaskOutput::new()
///     .export(&name, "users".to_string())
///     .build(|ctx| {
///         ctx.add_file("users.ts", FileData::text("export {};\n"))?;
///         Ok(())
///     });
/// # let _ = output;
/// ```
#[derive(Default)]
pub struct TaskOutput {
    pub(crate) exports: Vec<(ArcStr, TypeId, Dynamic)>,
    pub(crate) build: Option<BuildStep>,
    pub(crate) spawned: Vec<Spawn>,
}

impl TaskOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provides the value of a declared export.
    pub fn export<T>(mut self, provider: &ProviderType<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.exports.push((
            Arc::from(provider.name()),
            TypeId::of::<T>(),
            Arc::new(value),
        ));
        self
    }

    /// Registers the step that writes files, run after every phase.
    pub fn build<F>(mut self, step: F) -> Self
    where
        F: FnOnce(&mut BuildContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.build = Some(Box::new(step));
        self
    }

    /// Adds `bundle` as a child of this task's generator under `key`, with
    /// its tasks running in `phase`.
    pub fn spawn(mut self, phase: &Phase, key: impl Into<String>, bundle: GeneratorBundle) -> Self {
        self.spawned.push(Spawn {
            phase: phase.name.clone(),
            key: key.into(),
            bundle,
        });
        self
    }
}

/// What a build step sees: dependencies, every exported value, and the
/// output accumulated so far.
pub struct BuildContext<'a> {
    pub(crate) tree: &'a GeneratorTree,
    pub(crate) task: &'a TaskEntry,
    pub(crate) values: Values,
    pub(crate) exported: &'a HashMap<usize, HashMap<ArcStr, Dynamic>>,
    pub(crate) output: &'a mut GeneratorOutput,
}

impl BuildContext<'_> {
    /// Value of a dependency of the owning task.
    pub fn get<T>(&self, provider: &ProviderType<T>) -> Result<&T, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        read(&self.values, provider.name())?
            .ok_or_else(|| ProviderError::Absent(provider.name().to_string()))
    }

    pub fn get_optional<T>(&self, provider: &ProviderType<T>) -> Result<Option<&T>, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        read(&self.values, provider.name())
    }

    /// The single value exported for `provider` anywhere in the project,
    /// regardless of visibility.
    pub fn lookup<T>(&self, provider: &ProviderType<T>) -> Result<&T, ProviderError>
    where
        T: Send + Sync + 'static,
    {
        let name = provider.name();
        let mut found: Vec<(usize, &Dynamic)> = self
            .exported
            .iter()
            .filter_map(|(&task, values)| values.get(name).map(|value| (task, value)))
            .collect();

        match found.len() {
            0 => Err(ProviderError::NotFound(name.to_string())),
            1 => {
                let (_, value) = found.remove(0);
                value
                    .downcast_ref::<T>()
                    .ok_or_else(|| ProviderError::WrongType {
                        provider: name.to_string(),
                        expected: type_name::<T>(),
                    })
            }
            _ => {
                let mut candidates: Vec<String> = found
                    .iter()
                    .map(|(task, _)| self.tree.tasks[*task].id().to_string())
                    .collect();
                candidates.sort();
                Err(ProviderError::Ambiguous {
                    provider: name.to_string(),
                    candidates,
                })
            }
        }
    }

    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    pub fn generator(&self) -> &GeneratorEntry {
        &self.tree.entries[self.task.entry]
    }

    /// Files added by build steps that ran before this one.
    pub fn output(&self) -> &GeneratorOutput {
        self.output
    }

    /// Adds a file at `path`, relative to the generator's base directory.
    pub fn add_file(&mut self, path: impl AsRef<Utf8Path>, file: FileData) -> Result<(), OutputError> {
        let path = self.generator().base_directory().join(path.as_ref());
        tracing::trace!(task = self.task.id(), %path, "Adding file");
        self.output.add(path, file)
    }
}
