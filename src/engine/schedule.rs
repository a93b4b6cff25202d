//! Ordering of phases and of the tasks inside each phase.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::ArcStr;
use crate::engine::cycle::find_cycle;
use crate::engine::phase::{Phase, sort_phases};
use crate::error::ConfigError;
use crate::tree::GeneratorTree;

/// Tasks of one phase, with the dependency edges between them.
#[derive(Debug)]
pub(crate) struct PhasePlan {
    /// `None` for the implicit default phase.
    pub(crate) phase: Option<Phase>,
    graph: DiGraph<usize, ()>,
    nodes: HashMap<usize, NodeIndex>,
    pub(crate) order: Vec<usize>,
    pub(crate) started: bool,
}

impl PhasePlan {
    fn new(phase: Option<Phase>) -> Self {
        Self {
            phase,
            graph: DiGraph::new(),
            nodes: HashMap::new(),
            order: Vec::new(),
            started: false,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.phase.as_ref().map(Phase::name).unwrap_or("default")
    }

    /// Producers of `task` that belong to this phase.
    pub(crate) fn local_dependencies(&self, task: usize) -> Vec<usize> {
        let node = self.nodes[&task];
        self.graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| self.graph[n])
            .collect()
    }

    /// Tasks in this phase that consume `task`.
    pub(crate) fn local_dependents(&self, task: usize) -> Vec<usize> {
        let node = self.nodes[&task];
        self.graph
            .neighbors_directed(node, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect()
    }

    fn sort(&mut self, tree: &GeneratorTree) -> Result<(), ConfigError> {
        match toposort(&self.graph, None) {
            Ok(order) => {
                self.order = order.into_iter().map(|n| self.graph[n]).collect();
                Ok(())
            }
            Err(_) => {
                let cycle = find_cycle(&self.graph).unwrap_or_default();
                Err(ConfigError::TaskCycle(
                    cycle
                        .into_iter()
                        .map(|n| tree.tasks[self.graph[n]].id.to_string())
                        .collect(),
                ))
            }
        }
    }
}

/// A valid execution order for a resolved generator tree.
///
/// Built once before anything runs; afterwards only dynamic tasks can change
/// it, and only for phases that have not started yet.
#[derive(Debug)]
pub struct Schedule {
    pub(crate) phases: Vec<PhasePlan>,
    positions: HashMap<ArcStr, usize>,
    phase_of_task: HashMap<usize, usize>,
}

impl Schedule {
    pub fn new(tree: &GeneratorTree, phases: &[Phase]) -> Result<Self, ConfigError> {
        let sorted = sort_phases(phases)?;

        let mut plans = vec![PhasePlan::new(None)];
        let mut positions = HashMap::new();
        for phase in sorted {
            positions.insert(phase.name.clone(), plans.len());
            plans.push(PhasePlan::new(Some(phase)));
        }

        let mut schedule = Self {
            phases: plans,
            positions,
            phase_of_task: HashMap::new(),
        };

        let tasks: Vec<usize> = (0..tree.tasks.len()).collect();
        schedule.insert_tasks(tree, &tasks, None)?;

        for plan in &mut schedule.phases {
            plan.sort(tree)?;
        }

        Ok(schedule)
    }

    /// Task ids in execution order, phase by phase.
    pub fn ordered_ids<'a>(&self, tree: &'a GeneratorTree) -> Vec<&'a str> {
        self.ordered()
            .map(|task| tree.tasks[task].id())
            .collect()
    }

    /// Phase names in execution order, starting with the default phase.
    pub fn phase_names(&self) -> Vec<&str> {
        self.phases.iter().map(PhasePlan::name).collect()
    }

    pub(crate) fn ordered(&self) -> impl Iterator<Item = usize> + '_ {
        self.phases.iter().flat_map(|plan| plan.order.iter().copied())
    }

    fn position(&self, phase: &str, referenced_by: &str) -> Result<usize, ConfigError> {
        self.positions
            .get(phase)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPhase {
                phase: phase.to_string(),
                referenced_by: referenced_by.to_string(),
            })
    }

    /// Places tasks into their phases and adds their dependency edges.
    ///
    /// With `forced` set, tasks without a phase go to that phase instead of
    /// the default one, and tasks naming any other phase are rejected.
    fn insert_tasks(
        &mut self,
        tree: &GeneratorTree,
        tasks: &[usize],
        forced: Option<usize>,
    ) -> Result<(), ConfigError> {
        for &task in tasks {
            let entry = &tree.tasks[task];
            let position = match (entry.phase(), forced) {
                (None, None) => 0,
                (None, Some(forced)) => forced,
                (Some(name), None) => self.position(name, entry.id())?,
                (Some(name), Some(forced)) => {
                    let position = self.position(name, entry.id())?;
                    if position != forced {
                        return Err(ConfigError::UndeclaredDynamicPhase {
                            task: entry.id().to_string(),
                            phase: name.to_string(),
                        });
                    }
                    position
                }
            };

            let plan = &mut self.phases[position];
            let node = plan.graph.add_node(task);
            plan.nodes.insert(task, node);
            self.phase_of_task.insert(task, position);
        }

        for &task in tasks {
            let position = self.phase_of_task[&task];

            for producer in tree.tasks[task].producers() {
                let producer_position = self.phase_of_task[&producer];

                if producer_position > position {
                    return Err(ConfigError::PhaseOrder {
                        task: tree.tasks[task].id().to_string(),
                        dependency: tree.tasks[producer].id().to_string(),
                    });
                }

                if producer_position == position {
                    let plan = &mut self.phases[position];
                    let from = plan.nodes[&producer];
                    let to = plan.nodes[&task];
                    plan.graph.update_edge(from, to, ());
                }
            }
        }

        Ok(())
    }

    /// Adds tasks spawned by `spawner` (running in phase `from`) to the later
    /// phase `target`, then re-sorts that phase.
    pub(crate) fn add_dynamic_tasks(
        &mut self,
        tree: &GeneratorTree,
        from: usize,
        spawner: usize,
        target: &str,
        tasks: &[usize],
    ) -> Result<(), ConfigError> {
        let spawner_id = tree.tasks[spawner].id();
        let position = self.position(target, spawner_id)?;

        let declared = self.phases[from]
            .phase
            .as_ref()
            .is_some_and(|phase| phase.may_add_tasks_to(target));

        if !declared {
            return Err(ConfigError::UndeclaredDynamicPhase {
                task: spawner_id.to_string(),
                phase: target.to_string(),
            });
        }

        if self.phases[position].started {
            return Err(ConfigError::PhaseAlreadyRan {
                task: spawner_id.to_string(),
                phase: target.to_string(),
            });
        }

        self.insert_tasks(tree, tasks, Some(position))?;
        self.phases[position].sort(tree)?;

        tracing::debug!(
            phase = target,
            added = tasks.len(),
            spawner = spawner_id,
            "Added dynamic tasks"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{GeneratorBundle, TaskDescriptor};
    use crate::engine::TaskOutput;
    use crate::provider::{ProviderType, Scope};

    fn task(name: &str) -> crate::bundle::TaskDef {
        TaskDescriptor::define(name.to_string())
    }

    fn noop(def: crate::bundle::TaskDef) -> TaskDescriptor {
        def.run(|_| Ok(TaskOutput::new()))
    }

    fn position(order: &[&str], id: &str) -> usize {
        order.iter().position(|n| *n == id).unwrap()
    }

    #[test]
    fn test_order_is_topological() {
        let a: ProviderType<u8> = ProviderType::new("a");
        let b: ProviderType<u8> = ProviderType::new("b");

        let bundle = GeneratorBundle::new("app")
            .task(noop(task("c").depends_on(a.dependency()).depends_on(b.dependency())))
            .task(noop(task("b").depends_on(a.dependency()).exports(b.export())))
            .task(noop(task("a").exports(a.export())));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let schedule = Schedule::new(&tree, &[]).unwrap();
        let order = schedule.ordered_ids(&tree);

        assert_eq!(order.len(), 3);
        assert!(position(&order, "app#a") < position(&order, "app#b"));
        assert!(position(&order, "app#b") < position(&order, "app#c"));
    }

    #[test]
    fn test_task_cycle_lists_every_task() {
        let scope = Scope::new("s");
        let a: ProviderType<u8> = ProviderType::new("a");
        let b: ProviderType<u8> = ProviderType::new("b");
        let c: ProviderType<u8> = ProviderType::new("c");

        let bundle = GeneratorBundle::new("app")
            .scope(&scope)
            .task(noop(task("x").depends_on(c.dependency()).exports(a.export_to(&scope))))
            .task(noop(task("y").depends_on(a.dependency()).exports(b.export_to(&scope))))
            .task(noop(task("z").depends_on(b.dependency()).exports(c.export_to(&scope))))
            .task(noop(task("free")));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let err = Schedule::new(&tree, &[]).unwrap_err();

        match err {
            ConfigError::TaskCycle(cycle) => {
                assert_eq!(cycle, vec!["app#x", "app#y", "app#z"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tasks_are_bucketed_by_phase() {
        let late = Phase::new("late");
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(noop(task("consumer").phase(&late).depends_on(value.dependency())))
            .task(noop(task("producer").exports(value.export())));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let schedule = Schedule::new(&tree, &[late]).unwrap();

        assert_eq!(schedule.phase_names(), vec!["default", "late"]);
        assert_eq!(
            schedule.ordered_ids(&tree),
            vec!["app#producer", "app#consumer"]
        );
    }

    #[test]
    fn test_dependency_on_later_phase() {
        let late = Phase::new("late");
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(noop(task("consumer").depends_on(value.dependency())))
            .task(noop(task("producer").phase(&late).exports(value.export())));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let err = Schedule::new(&tree, &[late]).unwrap_err();

        assert_eq!(
            err,
            ConfigError::PhaseOrder {
                task: "app#consumer".into(),
                dependency: "app#producer".into(),
            }
        );
    }

    #[test]
    fn test_unknown_task_phase() {
        let ghost = Phase::new("ghost");
        let bundle = GeneratorBundle::new("app").task(noop(task("t").phase(&ghost)));

        let tree = GeneratorTree::build(&bundle).unwrap();
        let err = Schedule::new(&tree, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPhase { .. }));
    }

    #[test]
    fn test_dynamic_tasks_resort_target_phase() {
        let render = Phase::new("render");
        let expand = Phase::new("expand").adds_dynamic_tasks_to(&render);
        let value: ProviderType<u8> = ProviderType::new("value");

        let bundle = GeneratorBundle::new("app")
            .task(noop(task("enumerate").phase(&expand)))
            .task(noop(task("existing").phase(&render).exports(value.export())));

        let mut tree = GeneratorTree::build(&bundle).unwrap();
        let mut schedule = Schedule::new(&tree, &[render, expand]).unwrap();

        let spawned = GeneratorBundle::new("item")
            .task(noop(task("render").depends_on(value.dependency())));
        let added = tree.attach(0, "item", &spawned).unwrap();

        let spawner = 0;
        let from = schedule.phase_names().iter().position(|n| *n == "expand").unwrap();
        schedule
            .add_dynamic_tasks(&tree, from, spawner, "render", &added)
            .unwrap();

        let order = schedule.ordered_ids(&tree);
        assert!(position(&order, "app#enumerate") < position(&order, "app#existing"));
        assert!(position(&order, "app#existing") < position(&order, "app.item#render"));
    }

    #[test]
    fn test_dynamic_tasks_require_declared_relation() {
        let render = Phase::new("render");
        let expand = Phase::new("expand");

        let bundle = GeneratorBundle::new("app").task(noop(task("enumerate").phase(&expand)));

        let mut tree = GeneratorTree::build(&bundle).unwrap();
        let mut schedule = Schedule::new(&tree, &[expand, render]).unwrap();

        let added = tree
            .attach(0, "item", &GeneratorBundle::new("item").task(noop(task("t"))))
            .unwrap();
        let from = schedule.phase_names().iter().position(|n| *n == "expand").unwrap();
        let err = schedule
            .add_dynamic_tasks(&tree, from, 0, "render", &added)
            .unwrap_err();

        assert!(matches!(err, ConfigError::UndeclaredDynamicPhase { .. }));
    }
}
