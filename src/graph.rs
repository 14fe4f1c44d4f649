//! The dependency graph: machines expanded into tasks for one run.
//!
//! Generation solves every program down to concrete machines, checks the
//! producer/consumer relation for cycles, propagates identifiers along the
//! chain (aggregation changes arity mid-way) and expands each machine into
//! its tasks. Running submits tasks to a factory; unless everything must
//! run, only the tasks producing terminal outputs are queued and their
//! parents are pulled in on demand when a queued task pends.
//!
//! The graph also remembers which task produces which target, which is what
//! makes trace and history extraction possible.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GraphError, IdentifierError};
use crate::factory::Factory;
use crate::identifier::{Branch, Identifier, Index, ravel_identifiers};
use crate::machine::{
    Aggregate, ApplyOptions, Machine, OutputBranches, Program, meta_ios,
};
use crate::storage::WriteMode;
use crate::target::Target;
use crate::task::{MetaRecord, Status, Task, TaskCallback};

/// Scope of one generation: input identifiers, optional output overrides,
/// parameter values.
///
/// The `&str` builder methods accept raw atoms; anything failing the atom
/// grammar is recorded and surfaced as a [`GraphError`] when the scope is
/// handed to [`DependencyGraph::generate`], so a chain of calls never
/// panics on external input.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub indices: Vec<Index>,
    pub branches: Vec<Branch>,
    pub output_indices: Vec<Index>,
    pub output_branches: OutputBranches,
    pub parameters: BTreeMap<String, Value>,
    pub meta: Value,
    pub extra: BTreeMap<String, Value>,
    /// Atoms that failed validation, reported at generate time.
    invalid: Vec<String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(mut self, atom: &str) -> Self {
        match Index::atom(atom) {
            Ok(index) => self.indices.push(index),
            Err(_) => self.invalid.push(atom.to_string()),
        }
        self
    }

    pub fn branch(mut self, atom: &str) -> Self {
        match Branch::atom(atom) {
            Ok(branch) => self.branches.push(branch),
            Err(_) => self.invalid.push(atom.to_string()),
        }
        self
    }

    pub fn output_branch(mut self, atom: &str) -> Self {
        match Branch::atom(atom) {
            Ok(branch) => self.output_branches = OutputBranches::Extend(branch),
            Err(_) => self.invalid.push(atom.to_string()),
        }
        self
    }

    pub fn parameter(mut self, name: &str, value: Value) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    fn check(&self) -> Result<(), GraphError> {
        match self.invalid.first() {
            Some(atom) => Err(IdentifierError::InvalidAtom(atom.clone()).into()),
            None => Ok(()),
        }
    }
}

/// Options of one `run` call.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub mode: Option<WriteMode>,
    /// Branch fallback toggle, on unless disabled.
    pub no_fallback: bool,
    /// Build and record tasks without queueing them.
    pub dry: bool,
    pub callback: Option<TaskCallback>,
}

pub struct DependencyGraph {
    tasks: Vec<Arc<Task>>,
    machines: Vec<Arc<Machine>>,
    /// Output target to producing task.
    targets: HashMap<Target, Arc<Task>>,
    metarecords: Vec<MetaRecord>,
    aggregate: bool,
}

impl DependencyGraph {
    fn from_tasks(
        tasks: Vec<Arc<Task>>,
        metarecords: Vec<MetaRecord>,
    ) -> Self {
        let machines: Vec<Arc<Machine>> = {
            let mut seen = Vec::new();
            for task in &tasks {
                if !seen.iter().any(|m: &Arc<Machine>| Arc::ptr_eq(m, task.machine())) {
                    seen.push(task.machine().clone());
                }
            }
            seen
        };
        let targets = tasks
            .iter()
            .filter_map(|task| {
                task.output_target()
                    .map(|target| (target.clone(), task.clone()))
            })
            .collect();
        let aggregate = tasks.iter().any(|task| task.is_aggregate());
        Self {
            tasks,
            machines,
            targets,
            metarecords,
            aggregate,
        }
    }

    /// Solve the programs and expand them into tasks for the given scope.
    pub fn generate(programs: &[Program], scope: &Scope) -> Result<Self, GraphError> {
        scope.check()?;

        let mut machines: Vec<Arc<Machine>> = Vec::new();
        let mut metarecords = Vec::new();
        for program in programs {
            let (solved, consumed) = program.solve(&scope.parameters)?;
            metarecords.push(MetaRecord {
                name: program.name().to_string(),
                parameters: consumed,
            });
            machines.extend(solved);
        }

        let (graph, nodes) = machine_graph(&machines);
        toposort(&graph, None).map_err(|_| GraphError::Cycle)?;

        let input_ids = ravel_identifiers(&scope.indices, &scope.branches)?;
        let aggregating = chain_aggregate(&machines).is_aggregating();

        let mut tasks: Vec<Arc<Task>> = Vec::new();
        for (position, machine) in machines.iter().enumerate() {
            let requirements = related(&graph, &machines, nodes[position], true);
            let dependents = related(&graph, &machines, nodes[position], false);

            let current_inputs: Vec<Identifier>;
            let mut output_indices: Vec<Index> = Vec::new();
            let mut output_branches = OutputBranches::Default;

            if aggregating {
                current_inputs = match chain_aggregate(&requirements) {
                    Aggregate::Index => {
                        let indices: Vec<Index> =
                            input_ids.iter().map(|id| id.index.clone()).collect();
                        dedup_identifiers(ravel_identifiers(&indices, &[])?)
                    }
                    Aggregate::Branch => {
                        let branches: Vec<Branch> =
                            input_ids.iter().map(|id| id.branch.clone()).collect();
                        dedup_identifiers(ravel_identifiers(&[], &branches)?)
                    }
                    Aggregate::Ids => vec![Identifier::none()],
                    Aggregate::None => input_ids.clone(),
                };
                if dependents.is_empty() {
                    // final machines receive the caller's outputs
                    output_indices = scope.output_indices.clone();
                    output_branches = scope.output_branches.clone();
                }
            } else if requirements.is_empty() {
                // first machines map the caller's scope directly
                current_inputs = input_ids.clone();
                output_indices = scope.output_indices.clone();
                output_branches = scope.output_branches.clone();
            } else {
                // downstream machines consume the upstream outputs
                let indices: Vec<Index> = if scope.output_indices.is_empty() {
                    input_ids.iter().map(|id| id.index.clone()).collect()
                } else {
                    scope.output_indices.clone()
                };
                let branches: Vec<Branch> = match &scope.output_branches {
                    OutputBranches::Default => {
                        input_ids.iter().map(|id| id.branch.clone()).collect()
                    }
                    OutputBranches::Extend(branch) => vec![branch.clone()],
                    OutputBranches::List(list) => list.clone(),
                };
                current_inputs = ravel_identifiers(&indices, &branches)?;
            }

            let options = ApplyOptions {
                output_indices,
                output_branches,
                parameters: scope.parameters.clone(),
                meta: scope.meta.clone(),
                extra: scope.extra.clone(),
            };
            tasks.extend(machine.apply(&current_inputs, &options)?);
        }

        Ok(Self::from_tasks(tasks, metarecords))
    }

    /// Rebuild a graph from a serialised history, re-solving metamachine
    /// records against the given programs.
    pub fn recall(
        programs: &[Program],
        history: &[Value],
        meta: Value,
    ) -> Result<Self, GraphError> {
        let mut machines: HashMap<String, Arc<Machine>> = HashMap::new();
        let mut metas: HashMap<String, Program> = HashMap::new();
        for program in programs {
            match program {
                Program::Machine(machine) => {
                    machines.insert(machine.name().to_string(), machine.clone());
                }
                Program::Meta(_) => {
                    metas.insert(program.name().to_string(), program.clone());
                }
            }
        }

        let mut tasks = Vec::new();
        for record in history {
            let name = record
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| GraphError::History(record.to_string()))?;

            if record.get("inputs").is_none() {
                // metamachine record: re-solve with its recorded parameters
                let program = metas
                    .get(name)
                    .cloned()
                    .or_else(|| machines.get(name).cloned().map(Program::Machine))
                    .ok_or_else(|| GraphError::UnknownProgram(name.to_string()))?;
                let parameters = record
                    .get("parameters")
                    .and_then(Value::as_object)
                    .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                let (solved, _) = program.solve(&parameters)?;
                for machine in solved {
                    machines.insert(machine.name().to_string(), machine);
                }
            } else {
                let machine = machines
                    .get(name)
                    .cloned()
                    .ok_or_else(|| GraphError::UnknownProgram(name.to_string()))?;
                tasks.push(Task::deserialize(machine, record, meta.clone())?);
            }
        }

        Ok(Self::from_tasks(tasks, Vec::new()))
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Targets produced by the machines forming the external output surface.
    pub fn output_targets(&self) -> HashSet<Target> {
        let (_, meta_outputs) = meta_ios(&self.machines);
        let output_machines: Vec<&Arc<Machine>> = self
            .machines
            .iter()
            .filter(|machine| {
                machine
                    .flat_outputs()
                    .iter()
                    .any(|io| meta_outputs.contains(io))
            })
            .collect();

        self.tasks
            .iter()
            .filter(|task| {
                output_machines
                    .iter()
                    .any(|machine| Arc::ptr_eq(machine, task.machine()))
            })
            .filter_map(|task| task.output_target().cloned())
            .collect()
    }

    /// Submit the graph's tasks to the factory.
    ///
    /// A write mode against a locked output refuses the whole graph before
    /// anything is queued. Every task runs when a mode is set, any machine
    /// aggregates, or there is no terminal output; otherwise only terminal
    /// tasks are queued and parents join on demand when a task is neither
    /// complete nor ready.
    pub fn run(&self, factory: &Arc<Factory>, options: &RunOptions) -> Result<(), GraphError> {
        let output_targets = self.output_targets();

        let overwrite = matches!(
            options.mode,
            Some(WriteMode::Overwrite) | Some(WriteMode::Upgrade)
        );
        if overwrite
            && output_targets
                .iter()
                .any(|target| factory.get_storage(target).locked(target))
        {
            return Err(GraphError::LockedOutputs);
        }

        let run_all = options.mode.is_some() || self.aggregate || output_targets.is_empty();

        let mut remaining: Vec<Arc<Task>> = if run_all {
            self.tasks.clone()
        } else {
            self.tasks
                .iter()
                .filter(|task| {
                    task.output_target()
                        .is_some_and(|target| output_targets.contains(target))
                })
                .cloned()
                .collect()
        };

        let mut queued: HashSet<Uuid> = HashSet::new();
        let mut position = 0;
        while position < remaining.len() {
            let task = remaining[position].clone();
            position += 1;
            if !queued.insert(task.uuid()) {
                continue;
            }

            if !options.dry {
                task.prepare(options.mode, !options.no_fallback);
                if let Some(callback) = &options.callback {
                    task.add_callback(callback.clone());
                }
                factory.add_task(task.clone())?;
            }

            if !run_all && !task.complete(factory) && !task.ready(factory) {
                // pull the producers of this task's inputs into the run
                let parents: Vec<Arc<Task>> = self
                    .tasks
                    .iter()
                    .filter(|other| !queued.contains(&other.uuid()) && other.is_parent_of(&task))
                    .cloned()
                    .collect();
                debug!("pulling {} parent task(s) of {task}", parents.len());
                remaining.extend(parents);
            }
        }

        Ok(())
    }

    /// Chain of ancestor tasks (through recorded output targets), oldest
    /// first, ending with the task itself.
    pub fn trace(&self, task: &Arc<Task>) -> Vec<Arc<Task>> {
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        self.trace_into(task, &mut seen, &mut chain);
        chain
    }

    fn trace_into(
        &self,
        task: &Arc<Task>,
        seen: &mut HashSet<Uuid>,
        chain: &mut Vec<Arc<Task>>,
    ) {
        if !seen.insert(task.uuid()) {
            return;
        }
        for input in task.input_targets_flat() {
            if let Some(producer) = self.targets.get(&input) {
                self.trace_into(producer, seen, chain);
            }
        }
        chain.push(task.clone());
    }

    /// Serialised history: metamachine records, then the trace of the task.
    pub fn history(&self, task: &Arc<Task>) -> Vec<Value> {
        let mut records: Vec<Value> = self
            .metarecords
            .iter()
            .map(MetaRecord::serialize)
            .collect();
        records.extend(self.trace(task).iter().map(|task| task.serialize()));
        records
    }

    /// Tasks of the graph currently in the given status.
    pub fn tasks_with_status(&self, status: Status) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|task| task.status() == status)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Tasks:")?;
        for task in &self.tasks {
            writeln!(f, "\t{task}")?;
        }
        Ok(())
    }
}

/// Producer/consumer relation over i/o slot intersections.
fn machine_graph(machines: &[Arc<Machine>]) -> (DiGraph<usize, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..machines.len()).map(|i| graph.add_node(i)).collect();
    for (i, producer) in machines.iter().enumerate() {
        for (j, consumer) in machines.iter().enumerate() {
            if i == j {
                continue;
            }
            let feeds = producer.flat_outputs().iter().any(|output| {
                consumer
                    .flat_inputs()
                    .iter()
                    .any(|input| input == output)
            });
            if feeds {
                graph.add_edge(nodes[i], nodes[j], ());
            }
        }
    }
    (graph, nodes)
}

/// Transitively related machines: requirements (`upstream`) or dependents.
fn related(
    graph: &DiGraph<usize, ()>,
    machines: &[Arc<Machine>],
    start: NodeIndex,
    upstream: bool,
) -> Vec<Arc<Machine>> {
    let mut found = Vec::new();
    if upstream {
        let reversed = Reversed(graph);
        let mut dfs = Dfs::new(reversed, start);
        while let Some(node) = dfs.next(reversed) {
            if node != start {
                found.push(machines[graph[node]].clone());
            }
        }
    } else {
        let mut dfs = Dfs::new(graph, start);
        while let Some(node) = dfs.next(graph) {
            if node != start {
                found.push(machines[graph[node]].clone());
            }
        }
    }
    found
}

/// Aggregation mode of a machine chain: conflicting index/branch
/// aggregation collapses to full aggregation.
fn chain_aggregate(machines: &[Arc<Machine>]) -> Aggregate {
    let mut aggregate = Aggregate::None;
    for machine in machines {
        match machine.aggregate() {
            Aggregate::Index => {
                if aggregate == Aggregate::Branch {
                    return Aggregate::Ids;
                }
                aggregate = Aggregate::Index;
            }
            Aggregate::Branch => {
                if aggregate == Aggregate::Index {
                    return Aggregate::Ids;
                }
                aggregate = Aggregate::Branch;
            }
            Aggregate::Ids => return Aggregate::Ids,
            Aggregate::None => {}
        }
    }
    aggregate
}

fn dedup_identifiers(ids: Vec<Identifier>) -> Vec<Identifier> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Requires;
    use crate::task::TaskArgs;
    use serde_json::json;

    fn constant(name: &str, output: &str, value: Value) -> Program {
        Machine::builder(name, move |_args: &TaskArgs| Ok(value.clone()))
            .output(output)
            .build()
            .unwrap()
            .into()
    }

    fn upper(name: &str, input: &'static str, output: &str) -> Program {
        Machine::builder(name, move |args: &TaskArgs| {
            let text = args.input(input).and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        })
        .input(input)
        .output(output)
        .build()
        .unwrap()
        .into()
    }

    fn factory() -> Arc<Factory> {
        Factory::builder().register()
    }

    #[test]
    fn test_generate_chain() {
        let a = constant("a", "A", json!("foobar"));
        let b = upper("b", "A", "B");

        let scope = Scope::new().index("1").index("2");
        let graph = DependencyGraph::generate(&[a, b], &scope).unwrap();
        // two tasks per machine
        assert_eq!(graph.len(), 4);

        // terminal outputs are the B targets
        let outputs = graph.output_targets();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|target| target.name() == "B"));
    }

    #[test]
    fn test_invalid_scope_atom() {
        let a = constant("a", "A", json!(1));

        // bad atoms do not panic; they surface when the graph is generated
        let scope = Scope::new().index("not an atom").index("2");
        let result = DependencyGraph::generate(&[a.clone()], &scope);
        assert!(matches!(
            result,
            Err(GraphError::Identifier(IdentifierError::InvalidAtom(_)))
        ));

        let scope = Scope::new().index("1").branch("bad branch");
        assert!(DependencyGraph::generate(&[a], &scope).is_err());
    }

    #[test]
    fn test_cycle_detection() {
        let ab = Machine::builder("ab", |_args: &TaskArgs| Ok(Value::Null))
            .input("A")
            .output("B")
            .build()
            .unwrap();
        let ba = Machine::builder("ba", |_args: &TaskArgs| Ok(Value::Null))
            .input("B")
            .output("A")
            .build()
            .unwrap();

        let scope = Scope::new().index("1");
        let result = DependencyGraph::generate(&[ab.into(), ba.into()], &scope);
        assert!(matches!(result, Err(GraphError::Cycle)));
    }

    #[test]
    fn test_chained_mapping_run() {
        let fac = factory();

        // A exists only at index 1
        let a_slot = crate::target::TargetType::new("A").unwrap();
        let t = a_slot
            .target(Index::atom("1").unwrap(), Branch::empty())
            .unwrap();
        fac.write(&t, &json!("foobar"), None).unwrap();

        let b = upper("b", "A", "B");
        let scope = Scope::new().index("1").index("2");
        let graph = DependencyGraph::generate(&[b], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let statuses: Vec<Status> = graph.tasks().iter().map(|t| t.status()).collect();
        assert_eq!(statuses, vec![Status::Success, Status::Pending]);

        let out = graph.tasks()[0].output_target().unwrap();
        assert_eq!(fac.read(out).unwrap(), json!("FOOBAR"));
        fac.unregister();
    }

    #[test]
    fn test_full_chain_run() {
        let fac = factory();
        let a = constant("a", "A", json!("foobar"));
        let b = upper("b", "A", "B");

        let scope = Scope::new().index("1").index("2");
        let graph = DependencyGraph::generate(&[a, b], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        assert!(
            graph
                .tasks()
                .iter()
                .all(|task| task.status() == Status::Success)
        );
        fac.unregister();
    }

    #[test]
    fn test_branch_fallback_run() {
        let fac = factory();
        let slot_a = crate::target::TargetType::new("A").unwrap();
        let slot_b = crate::target::TargetType::new("B").unwrap();
        let br = Branch::atom("br1").unwrap();

        // A exists with the empty branch, B with br1
        fac.write(
            &slot_a
                .target(Index::atom("1").unwrap(), Branch::empty())
                .unwrap(),
            &json!("a"),
            None,
        )
        .unwrap();
        fac.write(
            &slot_b
                .target(Index::atom("1").unwrap(), br.clone())
                .unwrap(),
            &json!("b"),
            None,
        )
        .unwrap();

        let c = Machine::builder("c", |args: &TaskArgs| {
            Ok(json!([
                args.identifier("A").unwrap().to_string(),
                args.identifier("B").unwrap().to_string(),
            ]))
        })
        .input("A & B")
        .output("C")
        .build()
        .unwrap();

        let scope = Scope::new().index("1").branch("br1");
        let graph = DependencyGraph::generate(&[c.into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let task = &graph.tasks()[0];
        assert_eq!(task.status(), Status::Success);
        // A fell back to the empty branch, B kept br1
        let out = task.output_target().unwrap();
        assert_eq!(fac.read(out).unwrap(), json!(["1~", "1~br1"]));
        fac.unregister();
    }

    #[test]
    fn test_fallback_requires_exact_branch_somewhere() {
        let fac = factory();
        let slot_a = crate::target::TargetType::new("A").unwrap();
        let slot_b = crate::target::TargetType::new("B").unwrap();

        // both inputs exist only at the empty branch
        for slot in [&slot_a, &slot_b] {
            fac.write(
                &slot
                    .target(Index::atom("1").unwrap(), Branch::empty())
                    .unwrap(),
                &json!("x"),
                None,
            )
            .unwrap();
        }

        let c = Machine::builder("c", |_args: &TaskArgs| Ok(Value::Null))
            .input("A & B")
            .output("C")
            .build()
            .unwrap();

        let scope = Scope::new().index("1").branch("br1");
        let graph = DependencyGraph::generate(&[c.into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        // no input carries the requested branch: the task pends
        assert_eq!(graph.tasks()[0].status(), Status::Pending);
        fac.unregister();
    }

    #[test]
    fn test_requires_any_disables_fallback() {
        let fac = factory();
        let slot_a = crate::target::TargetType::new("A").unwrap();
        fac.write(
            &slot_a
                .target(Index::atom("1").unwrap(), Branch::empty())
                .unwrap(),
            &json!("a"),
            None,
        )
        .unwrap();

        let c = Machine::builder("c", |args: &TaskArgs| {
            Ok(json!(args.input("A").is_some()))
        })
        .input("A & B")
        .output("C")
        .requires(Requires::Any)
        .build()
        .unwrap();

        // requesting branch br1: A at the empty branch must NOT be found
        // (fallback is off under Requires::Any), but the task may still
        // run... with no input at all it pends.
        let scope = Scope::new().index("1").branch("br1");
        let graph = DependencyGraph::generate(&[c.clone().into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();
        assert_eq!(graph.tasks()[0].status(), Status::Pending);

        // at the exact branch, requires=any runs with the one input found
        let scope = Scope::new().index("1");
        let graph = DependencyGraph::generate(&[c.into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();
        let task = &graph.tasks()[0];
        assert_eq!(task.status(), Status::Success);
        assert_eq!(
            fac.read(task.output_target().unwrap()).unwrap(),
            json!(true)
        );
        fac.unregister();
    }

    #[test]
    fn test_aggregate_by_index_grouping() {
        let fac = factory();
        let slot = crate::target::TargetType::new("A").unwrap();
        let pairs = [("a", "x"), ("b", "x"), ("b", "y")];
        for (index, branch) in pairs {
            fac.write(
                &slot
                    .target(Index::atom(index).unwrap(), Branch::atom(branch).unwrap())
                    .unwrap(),
                &json!(index),
                None,
            )
            .unwrap();
        }

        let agg = Machine::builder("agg", |args: &TaskArgs| {
            let values: Vec<&Value> = args.input_list("A");
            Ok(json!(values.len()))
        })
        .input("A")
        .aggregate(Aggregate::Index)
        .output("N")
        .build()
        .unwrap();

        let scope = Scope {
            indices: vec![
                Index::atom("a").unwrap(),
                Index::atom("b").unwrap(),
                Index::atom("b").unwrap(),
            ],
            branches: vec![
                Branch::atom("x").unwrap(),
                Branch::atom("x").unwrap(),
                Branch::atom("y").unwrap(),
            ],
            ..Default::default()
        };
        let graph = DependencyGraph::generate(&[agg.into()], &scope).unwrap();
        assert_eq!(graph.len(), 2);

        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let x_task = graph
            .tasks()
            .iter()
            .find(|t| t.output_identifier().branch == Branch::atom("x").unwrap())
            .unwrap();
        assert_eq!(fac.read(x_task.output_target().unwrap()).unwrap(), json!(2));

        let y_task = graph
            .tasks()
            .iter()
            .find(|t| t.output_identifier().branch == Branch::atom("y").unwrap())
            .unwrap();
        assert_eq!(fac.read(y_task.output_target().unwrap()).unwrap(), json!(1));
        fac.unregister();
    }

    #[test]
    fn test_locked_output_refusal() {
        let storage = Arc::new(crate::storage::Storage::memory().with_lock("X"));
        let fac = Factory::builder().main(storage.clone()).register();

        let slot = crate::target::TargetType::new("X").unwrap();
        let target = slot
            .target(Index::atom("1").unwrap(), Branch::empty())
            .unwrap();
        storage.write(&target, &json!("locked"), None).unwrap();

        let machine = constant("x", "X", json!("new"));
        let scope = Scope::new().index("1");
        let graph = DependencyGraph::generate(&[machine], &scope).unwrap();

        let result = graph.run(
            &fac,
            &RunOptions {
                mode: Some(WriteMode::Overwrite),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(GraphError::LockedOutputs)));
        // nothing was queued
        assert_eq!(fac.queue_size(), 0);
        fac.unregister();
    }

    #[test]
    fn test_skip_existing_output() {
        let fac = factory();
        let machine = constant("x", "X", json!("value"));
        let scope = Scope::new().index("1");

        let graph = DependencyGraph::generate(&[machine.clone()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();
        assert_eq!(graph.tasks()[0].status(), Status::Success);

        // a second run over the same scope skips
        let graph = DependencyGraph::generate(&[machine], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();
        assert_eq!(graph.tasks()[0].status(), Status::Skipped);
        fac.unregister();
    }

    #[test]
    fn test_history_and_replay() {
        let fac = factory();
        let a = constant("a", "A", json!("foobar"));
        let b = upper("b", "A", "B");
        let programs = [a, b];

        let scope = Scope::new().index("1");
        let graph = DependencyGraph::generate(&programs, &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let final_task = graph
            .tasks()
            .iter()
            .find(|t| t.name() == "b")
            .unwrap()
            .clone();
        assert_eq!(final_task.status(), Status::Success);
        let history = graph.history(&final_task);
        // two metamachine records (trivial) + two task records
        assert_eq!(history.len(), 4);

        // replay the chain on a fresh factory
        let fac2 = factory();
        let replayed = DependencyGraph::recall(&programs, &history, Value::Null).unwrap();
        assert_eq!(replayed.len(), 2);
        replayed.run(&fac2, &RunOptions::default()).unwrap();
        fac2.hold();

        let out = replayed
            .tasks()
            .iter()
            .find(|t| t.name() == "b")
            .unwrap()
            .output_target()
            .unwrap()
            .clone();
        assert_eq!(fac2.read(&out).unwrap(), json!("FOOBAR"));
        fac.unregister();
        fac2.unregister();
    }

    #[test]
    fn test_error_status() {
        let fac = factory();
        let failing = Machine::builder("fail", |_args: &TaskArgs| {
            Err(anyhow::anyhow!("boom"))
        })
        .output("F")
        .build()
        .unwrap();

        let scope = Scope::new().index("1");
        let graph = DependencyGraph::generate(&[failing.into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let task = &graph.tasks()[0];
        assert_eq!(task.status(), Status::Error);
        assert!(task.error().unwrap().contains("boom"));
        fac.unregister();
    }

    #[test]
    fn test_reject_and_expected() {
        let fac = factory();
        let rejecting = Machine::builder("rej", |_args: &TaskArgs| {
            Err(crate::error::Reject::new("not this one").into())
        })
        .output("R")
        .build()
        .unwrap();
        let expected = Machine::builder("exp", |_args: &TaskArgs| {
            Err(crate::error::Expected::new("known failure").into())
        })
        .output("E")
        .build()
        .unwrap();

        let scope = Scope::new().index("1");
        let graph =
            DependencyGraph::generate(&[rejecting.into(), expected.into()], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        let rej = graph.tasks().iter().find(|t| t.name() == "rej").unwrap();
        assert_eq!(rej.status(), Status::Rejected);
        assert_eq!(rej.message().unwrap(), "not this one");
        // a rejection captures no error chain
        assert!(rej.error().is_none());

        let exp = graph.tasks().iter().find(|t| t.name() == "exp").unwrap();
        assert_eq!(exp.status(), Status::Error);
        assert_eq!(exp.message().unwrap(), "known failure");
        assert!(exp.error().is_none());
        fac.unregister();
    }

    #[test]
    fn test_no_task_runs_twice() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let fac = factory();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let a = Machine::builder("a", move |_args: &TaskArgs| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!("v"))
        })
        .output("A")
        .build()
        .unwrap();
        let b = upper("b", "A", "B");

        let scope = Scope::new().index("1").index("2");
        let graph = DependencyGraph::generate(&[a.into(), b], &scope).unwrap();
        graph.run(&fac, &RunOptions::default()).unwrap();
        fac.hold();

        assert_eq!(calls.load(Ordering::SeqCst), 2); // once per index
        assert!(
            graph
                .tasks()
                .iter()
                .all(|task| task.status().is_terminal())
        );
        fac.unregister();
    }
}
