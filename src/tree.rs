//! Instantiation of generator bundles and provider resolution.
//!
//! [`GeneratorTree::build`] expands a [`GeneratorBundle`] into concrete
//! [`GeneratorEntry`] nodes with stable, path-based ids, and then resolves
//! every task dependency to exactly one producing task by walking outward
//! from the consumer through the enclosing generators.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::bundle::{Child, GeneratorBundle, TaskDescriptor};
use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::provider::{Dependency, ProviderKey, Scope, Visibility};

/// One instantiated generator.
#[derive(Debug)]
pub struct GeneratorEntry {
    pub(crate) id: ArcStr,
    pub(crate) name: ArcStr,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) base_directory: Utf8PathBuf,
    pub(crate) tasks: Vec<usize>,
}

impl GeneratorEntry {
    /// Tree-path id, e.g. `app.models.user`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// Base directory, joined with every ancestor's.
    pub fn base_directory(&self) -> &Utf8Path {
        &self.base_directory
    }
}

/// A dependency together with the task chosen to satisfy it.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub(crate) dependency: Dependency,
    /// `None` only for optional dependencies with no producer in reach.
    pub(crate) producer: Option<usize>,
}

/// One task of an instantiated generator.
#[derive(Debug)]
pub struct TaskEntry {
    pub(crate) id: ArcStr,
    pub(crate) entry: usize,
    pub(crate) descriptor: TaskDescriptor,
    pub(crate) resolved: Vec<ResolvedDependency>,
}

impl TaskEntry {
    /// `{generator id}#{task name}`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Option<&str> {
        self.descriptor.phase()
    }

    /// Indices of the producing tasks, without duplicates.
    pub(crate) fn producers(&self) -> Vec<usize> {
        let mut producers: Vec<usize> = self.resolved.iter().filter_map(|r| r.producer).collect();
        producers.sort_unstable();
        producers.dedup();
        producers
    }
}

/// A task that exports some provider, and where it is visible from.
#[derive(Debug, Clone)]
struct Candidate {
    task: usize,
    /// Entry at which the export becomes visible, `None` for project-wide.
    level: Option<usize>,
    scope: Option<Scope>,
    key: ProviderKey,
}

/// The instantiated generator tree with resolved task dependencies.
#[derive(Debug, Default)]
pub struct GeneratorTree {
    pub(crate) entries: Vec<GeneratorEntry>,
    pub(crate) tasks: Vec<TaskEntry>,
    entry_ids: HashMap<ArcStr, usize>,
    task_ids: HashMap<ArcStr, usize>,
}

impl GeneratorTree {
    /// Instantiates `bundle` and resolves every dependency.
    pub fn build(bundle: &GeneratorBundle) -> Result<Self, ConfigError> {
        let mut tree = Self::default();
        let id = bundle.name.to_string();

        tree.instantiate(None, id, bundle)?;
        tree.resolve_tasks(0..tree.tasks.len())?;

        tracing::debug!(
            entries = tree.entries.len(),
            tasks = tree.tasks.len(),
            "Resolved generator tree"
        );

        Ok(tree)
    }

    /// Instantiates `bundle` as a new child of `parent` and resolves the
    /// dependencies of the tasks it adds. Returns the new task indices.
    pub(crate) fn attach(
        &mut self,
        parent: usize,
        key: &str,
        bundle: &GeneratorBundle,
    ) -> Result<Vec<usize>, ConfigError> {
        let base = format!("{}.{}", self.entries[parent].id, key);
        let mut id = base.clone();
        let mut n = 1;
        while self.entry_ids.contains_key(id.as_str()) {
            n += 1;
            id = format!("{base}-{n}");
        }

        let first = self.tasks.len();
        let index = self.instantiate(Some(parent), id, bundle)?;
        self.entries[parent].children.push(index);
        self.resolve_tasks(first..self.tasks.len())?;

        Ok((first..self.tasks.len()).collect())
    }

    pub fn entries(&self) -> impl Iterator<Item = &GeneratorEntry> {
        self.entries.iter()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskEntry> {
        self.tasks.iter()
    }

    pub fn entry(&self, id: &str) -> Option<&GeneratorEntry> {
        self.entry_ids.get(id).map(|&i| &self.entries[i])
    }

    pub fn task(&self, id: &str) -> Option<&TaskEntry> {
        self.task_ids.get(id).map(|&i| &self.tasks[i])
    }

    /// Ids of the tasks that `task` consumes providers from.
    pub fn dependent_task_ids(&self, task: &str) -> Option<Vec<&str>> {
        let task = self.task(task)?;
        Some(
            task.producers()
                .into_iter()
                .map(|i| self.tasks[i].id())
                .collect(),
        )
    }

    fn instantiate(
        &mut self,
        parent: Option<usize>,
        id: String,
        bundle: &GeneratorBundle,
    ) -> Result<usize, ConfigError> {
        let index = self.entries.len();
        let id: ArcStr = Arc::from(id);

        let base_directory = match parent {
            Some(parent) => self.entries[parent].base_directory.join(&bundle.base_directory),
            None => bundle.base_directory.clone(),
        };

        self.entries.push(GeneratorEntry {
            id: id.clone(),
            name: bundle.name.clone(),
            parent,
            children: Vec::new(),
            scopes: bundle.scopes.clone(),
            base_directory,
            tasks: Vec::new(),
        });
        self.entry_ids.insert(id.clone(), index);

        for descriptor in &bundle.tasks {
            let task_id: ArcStr = Arc::from(format!("{}#{}", id, descriptor.name));
            if self.task_ids.contains_key(&task_id) {
                return Err(ConfigError::DuplicateTask {
                    generator: id.to_string(),
                    task: descriptor.name.to_string(),
                });
            }

            for (i, export) in descriptor.exports.iter().enumerate() {
                if descriptor.exports[..i]
                    .iter()
                    .any(|other| other.provider.name == export.provider.name)
                {
                    return Err(ConfigError::DuplicateExport {
                        task: task_id.to_string(),
                        provider: export.provider.name.to_string(),
                    });
                }
            }

            // Values are handed to the task by provider name.
            for (i, dependency) in descriptor.dependencies.iter().enumerate() {
                if descriptor.dependencies[..i]
                    .iter()
                    .any(|other| other.provider.name == dependency.provider.name)
                {
                    return Err(ConfigError::DuplicateDependency {
                        task: task_id.to_string(),
                        provider: dependency.provider.name.to_string(),
                    });
                }
            }

            let task_index = self.tasks.len();
            self.tasks.push(TaskEntry {
                id: task_id.clone(),
                entry: index,
                descriptor: descriptor.clone(),
                resolved: Vec::new(),
            });
            self.task_ids.insert(task_id, task_index);
            self.entries[index].tasks.push(task_index);
        }

        for (key, child) in &bundle.children {
            match child {
                Child::One(child) => {
                    let child = self.instantiate(Some(index), format!("{id}.{key}"), child)?;
                    self.entries[index].children.push(child);
                }
                Child::Lazy(thunk) => {
                    let bundle = thunk();
                    let child = self.instantiate(Some(index), format!("{id}.{key}"), &bundle)?;
                    self.entries[index].children.push(child);
                }
                Child::Many(bundles) => {
                    let mut seen: HashMap<&str, usize> = HashMap::new();
                    for bundle in bundles {
                        let count = seen.entry(bundle.name()).or_default();
                        *count += 1;
                        let child_id = match *count {
                            1 => format!("{id}.{key}.{}", bundle.name),
                            n => format!("{id}.{key}.{}-{n}", bundle.name),
                        };
                        let child = self.instantiate(Some(index), child_id, bundle)?;
                        self.entries[index].children.push(child);
                    }
                }
            }
        }

        Ok(index)
    }

    /// The nearest ancestor-or-self of `entry` that opens `scope`.
    fn scope_owner(&self, entry: usize, scope: &Scope) -> Option<usize> {
        let mut current = Some(entry);
        while let Some(index) = current {
            if self.entries[index].scopes.contains(scope) {
                return Some(index);
            }
            current = self.entries[index].parent;
        }
        None
    }

    /// Groups every export by provider name, computing where it is visible.
    fn index_exports(&self) -> Result<HashMap<ArcStr, Vec<Candidate>>, ConfigError> {
        let mut index: HashMap<ArcStr, Vec<Candidate>> = HashMap::new();

        for (i, task) in self.tasks.iter().enumerate() {
            for export in &task.descriptor.exports {
                let (level, scope) = match &export.visibility {
                    Visibility::Instance => (Some(task.entry), None),
                    Visibility::Scope(scope) => match self.scope_owner(task.entry, scope) {
                        Some(owner) => (Some(owner), Some(scope.clone())),
                        None => {
                            return Err(ConfigError::UnknownScope {
                                task: task.id.to_string(),
                                scope: scope.name().to_string(),
                            });
                        }
                    },
                    Visibility::Project => (None, None),
                };

                index
                    .entry(export.provider.name.clone())
                    .or_default()
                    .push(Candidate {
                        task: i,
                        level,
                        scope,
                        key: export.provider.clone(),
                    });
            }
        }

        Ok(index)
    }

    fn resolve_tasks(&mut self, range: std::ops::Range<usize>) -> Result<(), ConfigError> {
        let exports = self.index_exports()?;

        for task in range {
            let resolved = self.tasks[task]
                .descriptor
                .dependencies
                .iter()
                .map(|dependency| {
                    let producer = self.resolve_dependency(task, dependency, &exports)?;
                    Ok(ResolvedDependency {
                        dependency: dependency.clone(),
                        producer,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;

            self.tasks[task].resolved = resolved;
        }

        Ok(())
    }

    /// Walks outward from the consumer: its own generator, each ancestor, then
    /// the project level. The first level with any candidate decides.
    fn resolve_dependency(
        &self,
        task: usize,
        dependency: &Dependency,
        exports: &HashMap<ArcStr, Vec<Candidate>>,
    ) -> Result<Option<usize>, ConfigError> {
        let consumer = &self.tasks[task];
        let candidates: Vec<&Candidate> = exports
            .get(&dependency.provider.name)
            .map(|all| {
                all.iter()
                    .filter(|c| c.task != task)
                    .filter(|c| match &dependency.scope {
                        Some(scope) => c.scope.as_ref() == Some(scope),
                        None => true,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut level = Some(consumer.entry);
        loop {
            let found: Vec<&Candidate> = candidates
                .iter()
                .copied()
                .filter(|c| c.level == level)
                .collect();

            if !found.is_empty() {
                return self.pick(task, dependency, &found).map(Some);
            }

            // Past the root, `None` stands for the project level.
            match level {
                Some(index) => level = self.entries[index].parent,
                None => break,
            }
        }

        if dependency.optional {
            return Ok(None);
        }

        Err(ConfigError::UnresolvedDependency {
            task: consumer.id.to_string(),
            provider: dependency.provider.name.to_string(),
        })
    }

    fn pick(
        &self,
        task: usize,
        dependency: &Dependency,
        found: &[&Candidate],
    ) -> Result<usize, ConfigError> {
        let consumer = &self.tasks[task];

        if found.len() > 1 {
            let mut candidates: Vec<String> = found
                .iter()
                .map(|c| self.tasks[c.task].id.to_string())
                .collect();
            candidates.sort();

            return Err(ConfigError::AmbiguousDependency {
                task: consumer.id.to_string(),
                provider: dependency.provider.name.to_string(),
                candidates,
            });
        }

        let candidate = found[0];
        if candidate.key.type_id != dependency.provider.type_id {
            return Err(ConfigError::ProviderTypeMismatch {
                task: consumer.id.to_string(),
                provider: dependency.provider.name.to_string(),
                producer: self.tasks[candidate.task].id.to_string(),
                expected: dependency.provider.type_name,
                found: candidate.key.type_name,
            });
        }

        Ok(candidate.task)
    }
}

/// Renders the task dependency graph as a Mermaid diagram.
impl fmt::Display for GeneratorTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for (index, task) in self.tasks.iter().enumerate() {
            let name = task.id.replace('"', "\\\"");
            writeln!(f, "    {index}[\"{name}\"]")?;
        }

        for (index, task) in self.tasks.iter().enumerate() {
            for resolved in &task.resolved {
                if let Some(producer) = resolved.producer {
                    let provider = resolved.dependency.provider.name.replace('"', "\\\"");
                    writeln!(f, "    {producer} -- \"{provider}\" --> {index}")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskOutput;
    use crate::provider::ProviderType;

    fn producer(name: &str, export: crate::provider::Export) -> TaskDescriptor {
        TaskDescriptor::define(name.to_string())
            .exports(export)
            .run(|_| Ok(TaskOutput::new()))
    }

    fn consumer(name: &str, dependency: Dependency) -> TaskDescriptor {
        TaskDescriptor::define(name.to_string())
            .depends_on(dependency)
            .run(|_| Ok(TaskOutput::new()))
    }

    #[test]
    fn test_entry_ids_follow_tree_path() {
        let bundle = GeneratorBundle::new("app")
            .child("server", GeneratorBundle::new("server"))
            .children(
                "models",
                [
                    GeneratorBundle::new("model"),
                    GeneratorBundle::new("model"),
                    GeneratorBundle::new("other"),
                ],
            )
            .lazy_child("web", || GeneratorBundle::new("web"));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let ids: Vec<&str> = tree.entries().map(GeneratorEntry::id).collect();

        assert_eq!(
            ids,
            vec![
                "app",
                "app.models.model",
                "app.models.model-2",
                "app.models.other",
                "app.server",
                "app.web",
            ]
        );
    }

    #[test]
    fn test_base_directory_is_joined() {
        let bundle = GeneratorBundle::new("app")
            .base_directory("packages/app")
            .child("src", GeneratorBundle::new("src").base_directory("src"));

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.entry("app.src").unwrap().base_directory(),
            Utf8Path::new("packages/app/src")
        );
    }

    #[test]
    fn test_instance_export_visible_to_descendants() {
        let config: ProviderType<String> = ProviderType::new("config");

        let bundle = GeneratorBundle::new("app")
            .task(producer("config", config.export()))
            .child(
                "child",
                GeneratorBundle::new("child").task(consumer("use", config.dependency())),
            );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.child#use").unwrap(),
            vec!["app#config"]
        );
    }

    #[test]
    fn test_instance_export_not_visible_to_siblings() {
        let config: ProviderType<String> = ProviderType::new("config");

        let bundle = GeneratorBundle::new("app")
            .child("a", GeneratorBundle::new("a").task(producer("config", config.export())))
            .child("b", GeneratorBundle::new("b").task(consumer("use", config.dependency())));

        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnresolvedDependency {
                task: "app.b#use".into(),
                provider: "config".into(),
            }
        );
    }

    #[test]
    fn test_scope_export_visible_across_siblings() {
        let scope = Scope::new("feature");
        let router: ProviderType<Vec<String>> = ProviderType::new("router");

        let bundle = GeneratorBundle::new("app").child(
            "feature",
            GeneratorBundle::new("feature")
                .scope(&scope)
                .child(
                    "router",
                    GeneratorBundle::new("router").task(producer("router", router.export_to(&scope))),
                )
                .child(
                    "page",
                    GeneratorBundle::new("page").task(consumer("page", router.dependency())),
                ),
        );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.feature.page#page").unwrap(),
            vec!["app.feature.router#router"]
        );
    }

    #[test]
    fn test_unknown_scope() {
        let scope = Scope::new("missing");
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app").task(producer("p", value.export_to(&scope)));
        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownScope { .. }));
    }

    #[test]
    fn test_project_export_visible_everywhere() {
        let logger: ProviderType<u8> = ProviderType::new("logger");

        let bundle = GeneratorBundle::new("app")
            .child(
                "a",
                GeneratorBundle::new("a").task(producer("logger", logger.export_project())),
            )
            .child(
                "b",
                GeneratorBundle::new("b").child(
                    "deep",
                    GeneratorBundle::new("deep").task(consumer("use", logger.dependency())),
                ),
            );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.b.deep#use").unwrap(),
            vec!["app.a#logger"]
        );
    }

    #[test]
    fn test_nearest_export_wins() {
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(producer("outer", value.export()))
            .child(
                "child",
                GeneratorBundle::new("child")
                    .task(producer("inner", value.export()))
                    .task(consumer("use", value.dependency())),
            );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.child#use").unwrap(),
            vec!["app.child#inner"]
        );
    }

    #[test]
    fn test_ambiguous_dependency_names_candidates() {
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(producer("first", value.export()))
            .task(producer("second", value.export()))
            .task(consumer("use", value.dependency()));

        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert_eq!(
            err,
            ConfigError::AmbiguousDependency {
                task: "app#use".into(),
                provider: "value".into(),
                candidates: vec!["app#first".into(), "app#second".into()],
            }
        );
    }

    #[test]
    fn test_optional_dependency() {
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app").task(consumer("use", value.dependency().optional()));

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert!(tree.dependent_task_ids("app#use").unwrap().is_empty());
    }

    #[test]
    fn test_scoped_dependency_ignores_instance_exports() {
        let scope = Scope::new("feature");
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .scope(&scope)
            .task(producer("scoped", value.export_to(&scope)))
            .child(
                "child",
                GeneratorBundle::new("child")
                    .task(producer("local", value.export()))
                    .task(consumer("use", value.dependency().in_scope(&scope))),
            );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.child#use").unwrap(),
            vec!["app#scoped"]
        );
    }

    #[test]
    fn test_type_mismatch() {
        let produced: ProviderType<u8> = ProviderType::new("value");
        let requested: ProviderType<String> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(producer("p", produced.export()))
            .task(consumer("c", requested.dependency()));

        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert!(matches!(err, ConfigError::ProviderTypeMismatch { .. }));
    }

    #[test]
    fn test_duplicate_task_name() {
        let bundle = GeneratorBundle::new("app")
            .task(TaskDescriptor::define("same").run(|_| Ok(TaskOutput::new())))
            .task(TaskDescriptor::define("same").run(|_| Ok(TaskOutput::new())));

        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateTask {
                generator: "app".into(),
                task: "same".into(),
            }
        );
    }

    #[test]
    fn test_same_provider_requested_twice() {
        let first = Scope::new("first");
        let second = Scope::new("second");
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .scope(&first)
            .scope(&second)
            .task(producer("a", value.export_to(&first)))
            .task(producer("b", value.export_to(&second)))
            .task(
                TaskDescriptor::define("use")
                    .depends_on(value.dependency().in_scope(&first))
                    .depends_on(value.dependency().in_scope(&second))
                    .run(|_| Ok(TaskOutput::new())),
            );

        let err = GeneratorTree::build(&bundle).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateDependency {
                task: "app#use".into(),
                provider: "value".into(),
            }
        );
    }

    #[test]
    fn test_task_does_not_resolve_to_itself() {
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(producer("outer", value.export()))
            .child(
                "child",
                GeneratorBundle::new("child").task(
                    TaskDescriptor::define("wrap")
                        .depends_on(value.dependency())
                        .exports(value.export())
                        .run(|_| Ok(TaskOutput::new())),
                ),
            );

        let tree = GeneratorTree::build(&bundle).unwrap();
        assert_eq!(
            tree.dependent_task_ids("app.child#wrap").unwrap(),
            vec!["app#outer"]
        );
    }

    #[test]
    fn test_display_mermaid() {
        let value: ProviderType<u8> = ProviderType::new("value");
        let bundle = GeneratorBundle::new("app")
            .task(producer("p", value.export()))
            .task(consumer("c", value.dependency()));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let text = tree.to_string();
        assert!(text.starts_with("graph LR"));
        assert!(text.contains("0 -- \"value\" --> 1"));
    }
}
