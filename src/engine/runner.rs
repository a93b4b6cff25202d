use std::collections::{HashMap, HashSet};
use std::sync::mpsc::channel;
use std::time::Instant;

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::bundle::GeneratorBundle;
use crate::core::{ArcStr, Dynamic};
use crate::engine::schedule::{PhasePlan, Schedule};
use crate::engine::{BuildContext, BuildStep, Phase, Spawn, TaskContext, TaskOutput, Values};
use crate::error::ExecuteError;
use crate::output::GeneratorOutput;
use crate::tree::GeneratorTree;

/// Values exported by every finished task, keyed by task index.
type Exported = HashMap<usize, HashMap<ArcStr, Dynamic>>;

/// What pass 1 keeps of a finished task besides its exports.
#[derive(Default)]
struct Finished {
    build: Option<BuildStep>,
    spawned: Vec<Spawn>,
}

/// Runs a generator tree phase by phase and collects the files it builds.
///
/// Pass 1 runs every task's callback, in parallel where the dependency graph
/// allows it. Pass 2 then runs the build steps one after another in schedule
/// order, each adding files to a shared [`GeneratorOutput`].
#[derive(Debug, Clone)]
pub struct Executor {
    phases: Vec<Phase>,
    concurrency: usize,
}

impl Executor {
    pub fn new(phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            phases: phases.into_iter().collect(),
            concurrency: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
        }
    }

    /// Upper bound on tasks running at the same time.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn run(&self, bundle: &GeneratorBundle) -> Result<GeneratorOutput, ExecuteError> {
        let tree = GeneratorTree::build(bundle)?;
        self.run_tree(tree)
    }

    pub fn run_tree(&self, mut tree: GeneratorTree) -> Result<GeneratorOutput, ExecuteError> {
        let s = Instant::now();
        let mut schedule = Schedule::new(&tree, &self.phases)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.concurrency)
            .thread_name(|i| format!("kumiki-task-{i}"))
            .build()?;

        let mut exported = Exported::new();
        let mut builds: HashMap<usize, BuildStep> = HashMap::new();

        for position in 0..schedule.phases.len() {
            schedule.phases[position].started = true;

            let mut finished =
                run_phase(&pool, &tree, &schedule.phases[position], &mut exported)?;

            // Spawned bundles are attached in schedule order so ids stay stable.
            let mut spawns = Vec::new();
            for &task in &schedule.phases[position].order {
                let Some(Finished { build, spawned }) = finished.remove(&task) else {
                    continue;
                };
                if let Some(build) = build {
                    builds.insert(task, build);
                }
                spawns.extend(spawned.into_iter().map(|spawn| (task, spawn)));
            }

            for (task, spawn) in spawns {
                let entry = tree.tasks[task].entry;
                let added = tree.attach(entry, &spawn.key, &spawn.bundle)?;
                schedule.add_dynamic_tasks(&tree, position, task, &spawn.phase, &added)?;
            }
        }

        tracing::info!(
            tasks = tree.tasks.len(),
            "Finished running tasks {}",
            crate::utils::as_overhead(s)
        );

        let s = Instant::now();
        let mut output = GeneratorOutput::new();

        for task in schedule.ordered().collect::<Vec<_>>() {
            let Some(step) = builds.remove(&task) else {
                continue;
            };

            let entry = &tree.tasks[task];
            let _span = tracing::debug_span!("build", task = entry.id()).entered();

            let mut context = BuildContext {
                tree: &tree,
                task: entry,
                values: dependency_values(&tree, task, &exported),
                exported: &exported,
                output: &mut output,
            };

            step(&mut context).map_err(|err| ExecuteError::Build(entry.id().to_string(), err))?;
        }

        tracing::info!(
            files = output.len(),
            "Finished build steps {}",
            crate::utils::as_overhead(s)
        );

        Ok(output)
    }
}

/// Values of the dependencies of `task`, taken from its producers' exports.
fn dependency_values(tree: &GeneratorTree, task: usize, exported: &Exported) -> Values {
    tree.tasks[task]
        .resolved
        .iter()
        .map(|resolved| {
            let name = resolved.dependency.provider.name.clone();
            let value = resolved
                .producer
                .and_then(|producer| exported.get(&producer))
                .and_then(|values| values.get(&name))
                .cloned();
            (name, value)
        })
        .collect()
}

/// Checks the exports of a finished task against its declaration.
fn collect_exports(
    tree: &GeneratorTree,
    task: usize,
    exports: Vec<(ArcStr, std::any::TypeId, Dynamic)>,
) -> Result<HashMap<ArcStr, Dynamic>, ExecuteError> {
    let entry = &tree.tasks[task];
    let declared = &entry.descriptor.exports;
    let mut values = HashMap::new();

    for (name, type_id, value) in exports {
        let matches = declared
            .iter()
            .any(|export| export.provider.name == name && export.provider.type_id == type_id);

        if !matches || values.contains_key(&name) {
            return Err(ExecuteError::UndeclaredExport {
                task: entry.id().to_string(),
                provider: name.to_string(),
            });
        }

        values.insert(name, value);
    }

    if let Some(missing) = declared
        .iter()
        .find(|export| !values.contains_key(&export.provider.name))
    {
        return Err(ExecuteError::MissingExport {
            task: entry.id().to_string(),
            provider: missing.provider.name.to_string(),
        });
    }

    Ok(values)
}

/// Pass 1 over a single phase.
///
/// Tasks start as soon as all of their producers inside this phase have
/// finished; producers in earlier phases are already done. The calling thread
/// only schedules, the pool runs the callbacks.
fn run_phase(
    pool: &rayon::ThreadPool,
    tree: &GeneratorTree,
    plan: &PhasePlan,
    exported: &mut Exported,
) -> Result<HashMap<usize, Finished>, ExecuteError> {
    let total_tasks = plan.order.len();
    let mut slots = HashMap::new();

    if total_tasks == 0 {
        return Ok(slots);
    }

    let mut dependency_counts: HashMap<usize, usize> = plan
        .order
        .iter()
        .map(|&task| (task, plan.local_dependencies(task).len()))
        .collect();

    let root_span = tracing::span!(Level::INFO, "phase", name = plan.name());
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&crate::utils::get_style_progress()?);
    root_span.pb_set_message(&format!("Running phase {}", plan.name()));
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task()?;

    pool.in_place_scope(|s| -> Result<(), ExecuteError> {
        let (result_sender, result_receiver) = channel::<(usize, anyhow::Result<TaskOutput>)>();
        let mut completed: HashSet<usize> = HashSet::new();

        let spawn_task = |exported: &Exported, index: usize| {
            let values = dependency_values(tree, index, exported);
            let sender = result_sender.clone();
            let pb_style = pb_style.clone();
            let parent = root_span.clone();

            s.spawn(move |_| {
                let task = &tree.tasks[index];

                let span = tracing::span!(parent: &parent, Level::INFO, "task", id = task.id());
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {}", task.id()));
                let _enter = span.enter();

                let context = TaskContext {
                    task,
                    generator: &tree.entries[task.entry],
                    values,
                };

                // Task state is never shared between workers, so a panic
                // cannot leave anything half-updated.
                let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (task.descriptor.run)(&context)
                })) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };

                        Err(anyhow::anyhow!(msg))
                    }
                };

                // The receiver is gone only if another task already failed.
                let _ = sender.send((index, output));
            });
        };

        for &task in &plan.order {
            if dependency_counts[&task] == 0 {
                spawn_task(exported, task);
            }
        }

        while completed.len() < total_tasks {
            let (index, output) = result_receiver
                .recv()
                .map_err(|_| anyhow::anyhow!("Task workers disconnected"))?;

            let id = tree.tasks[index].id();
            let output = output.map_err(|err| ExecuteError::Task(id.to_string(), err))?;
            tracing::debug!(task = id, "Task finished");

            exported.insert(index, collect_exports(tree, index, output.exports)?);
            slots.insert(
                index,
                Finished {
                    build: output.build,
                    spawned: output.spawned,
                },
            );

            completed.insert(index);
            root_span.pb_inc(1);

            for dependent in plan.local_dependents(index) {
                if let Some(count) = dependency_counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        spawn_task(exported, dependent);
                    }
                }
            }
        }

        Ok(())
    })?;

    Ok(slots)
}
