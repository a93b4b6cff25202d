//! Declarative generator descriptions.
//!
//! A [`GeneratorBundle`] is an immutable tree: each bundle names the scopes it
//! opens, the tasks it contributes and its child bundles. Nothing runs until
//! the bundle is instantiated into a [`GeneratorTree`](crate::GeneratorTree).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::ArcStr;
use crate::engine::{Phase, TaskContext, TaskOutput};
use crate::provider::{Dependency, Export, Scope};

/// Run callback of a task. Receives resolved dependencies and returns the
/// exported values plus an optional deferred build step.
pub(crate) type RunFn = Arc<dyn Fn(&TaskContext<'_>) -> anyhow::Result<TaskOutput> + Send + Sync>;

/// Thunk producing a child bundle on demand.
pub(crate) type LazyFn = Arc<dyn Fn() -> GeneratorBundle + Send + Sync>;

/// A single task contributed by a generator.
#[derive(Clone)]
pub struct TaskDescriptor {
    pub(crate) name: ArcStr,
    pub(crate) phase: Option<ArcStr>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) exports: Vec<Export>,
    pub(crate) run: RunFn,
}

impl TaskDescriptor {
    /// The entry point for defining a task.
    ///
    /// ```rust
    /// use kumiki::{ProviderType, TaskDescriptor, TaskOutput};
    ///
    /// let port: ProviderType<u16> = ProviderType::new("port");
    ///
    /// let task = TaskDescriptor::define("port")
    ///     .exports(port.export())
    ///     .run(move |_| Ok(TaskOutput::new().export(&port, 8080)));
    /// # let _ = task;
    /// ```
    pub fn define(name: impl Into<Cow<'static, str>>) -> TaskDef {
        TaskDef {
            name: name.into(),
            phase: None,
            dependencies: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("dependencies", &self.dependencies)
            .field("exports", &self.exports)
            .finish_non_exhaustive()
    }
}

pub struct TaskDef {
    name: Cow<'static, str>,
    phase: Option<ArcStr>,
    dependencies: Vec<Dependency>,
    exports: Vec<Export>,
}

impl TaskDef {
    /// Runs this task in `phase` instead of the default phase.
    pub fn phase(mut self, phase: &Phase) -> Self {
        self.phase = Some(phase.name.clone());
        self
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn exports(mut self, export: Export) -> Self {
        self.exports.push(export);
        self
    }

    pub fn run<F>(self, callback: F) -> TaskDescriptor
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
    {
        TaskDescriptor {
            name: Arc::from(self.name.as_ref()),
            phase: self.phase,
            dependencies: self.dependencies,
            exports: self.exports,
            run: Arc::new(callback),
        }
    }
}

/// A child slot of a bundle.
#[derive(Clone)]
pub enum Child {
    One(GeneratorBundle),
    Many(Vec<GeneratorBundle>),
    Lazy(LazyFn),
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Child::One(bundle) => f.debug_tuple("One").field(bundle).finish(),
            Child::Many(bundles) => f.debug_tuple("Many").field(bundles).finish(),
            Child::Lazy(_) => write!(f, "Lazy(*)"),
        }
    }
}

/// Immutable description of a generator and its descendants.
#[derive(Clone, Debug)]
pub struct GeneratorBundle {
    pub(crate) name: ArcStr,
    pub(crate) base_directory: Utf8PathBuf,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) tasks: Vec<TaskDescriptor>,
    pub(crate) children: BTreeMap<String, Child>,
}

impl GeneratorBundle {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            base_directory: Utf8PathBuf::new(),
            scopes: Vec::new(),
            tasks: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory, relative to the parent's, that this generator's files go to.
    pub fn base_directory(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.base_directory = dir.as_ref().to_path_buf();
        self
    }

    /// Opens `scope` for this generator's subtree.
    pub fn scope(mut self, scope: &Scope) -> Self {
        self.scopes.push(scope.clone());
        self
    }

    pub fn task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn child(mut self, key: impl Into<String>, bundle: GeneratorBundle) -> Self {
        self.children.insert(key.into(), Child::One(bundle));
        self
    }

    pub fn children(
        mut self,
        key: impl Into<String>,
        bundles: impl IntoIterator<Item = GeneratorBundle>,
    ) -> Self {
        self.children
            .insert(key.into(), Child::Many(bundles.into_iter().collect()));
        self
    }

    /// A child produced by a thunk, evaluated when the tree is instantiated.
    pub fn lazy_child<F>(mut self, key: impl Into<String>, thunk: F) -> Self
    where
        F: Fn() -> GeneratorBundle + Send + Sync + 'static,
    {
        self.children.insert(key.into(), Child::Lazy(Arc::new(thunk)));
        self
    }
}
