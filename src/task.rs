//! Tasks: one concrete execution of a machine.
//!
//! A [`Task`] binds a machine to its input identifiers and one output
//! identifier. The factory drives it through `safe_run`: resolve inputs
//! (walking declared alternatives, then falling back branch atom by atom),
//! skip if the output already exists, pend if inputs are missing, otherwise
//! invoke the function and persist the result.
//!
//! The function receives a [`TaskArgs`] with everything the machine
//! declared; while it runs, [`current_task`] exposes a frozen
//! [`TaskSnapshot`] of the same information.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Expected, GraphError, MachineError, ParameterError, Reject};
use crate::factory::Factory;
use crate::identifier::{Branch, Identifier, Index};
use crate::machine::{Machine, Requires};
use crate::parameters::solve_parameters;
use crate::storage::WriteMode;
use crate::target::Target;

/// Task lifecycle states. `New → (Running | Pending) → terminal`; pending
/// tasks are re-queued, terminal tasks never run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Pending,
    Running,
    Rejected,
    Error,
    Skipped,
    Success,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Rejected | Status::Error | Status::Skipped | Status::Success
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::New => "NEW",
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Rejected => "REJECTED",
            Status::Error => "ERROR",
            Status::Skipped => "SKIPPED",
            Status::Success => "SUCCESS",
        };
        f.write_str(name)
    }
}

/// Per-task callback: `(task, message)`. The message is set for
/// rejections and errors, `None` for lifecycle-only transitions.
pub type TaskCallback = Arc<dyn Fn(&Task, Option<&str>) + Send + Sync>;

/// Single or aggregated per-input payload.
#[derive(Debug, Clone)]
pub enum Slot<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Slot<T> {
    pub fn one(&self) -> Option<&T> {
        match self {
            Slot::One(value) => Some(value),
            Slot::Many(_) => None,
        }
    }

    pub fn many(&self) -> Vec<&T> {
        match self {
            Slot::One(value) => vec![value],
            Slot::Many(values) => values.iter().collect(),
        }
    }
}

/// Everything a machine function may consume, keyed by the names declared
/// on the machine.
pub struct TaskArgs {
    name: String,
    inputs: BTreeMap<String, Slot<Value>>,
    identifiers: BTreeMap<String, Slot<Identifier>>,
    targets: BTreeMap<String, Slot<Target>>,
    attachments: BTreeMap<String, Slot<BTreeMap<String, Value>>>,
    groups: BTreeMap<String, Vec<String>>,
    output_name: Option<String>,
    output_identifier: Identifier,
    output_target: Option<Target>,
    parameters: BTreeMap<String, Value>,
    extra: BTreeMap<String, Value>,
    meta: Value,
    aggregate: bool,
}

impl TaskArgs {
    /// Data of one input; `None` when the input did not resolve or the task
    /// aggregates.
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(Slot::one)
    }

    /// Data of one input as a list (aggregating tasks); a missing input is
    /// the empty list.
    pub fn input_list(&self, name: &str) -> Vec<&Value> {
        self.inputs.get(name).map(Slot::many).unwrap_or_default()
    }

    /// All resolved input data by name.
    pub fn inputs(&self) -> &BTreeMap<String, Slot<Value>> {
        &self.inputs
    }

    pub fn identifier(&self, name: &str) -> Option<&Identifier> {
        self.identifiers.get(name).and_then(Slot::one)
    }

    pub fn identifier_list(&self, name: &str) -> Vec<&Identifier> {
        self.identifiers
            .get(name)
            .map(Slot::many)
            .unwrap_or_default()
    }

    pub fn identifiers(&self) -> &BTreeMap<String, Slot<Identifier>> {
        &self.identifiers
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.get(name).and_then(Slot::one)
    }

    pub fn targets(&self) -> &BTreeMap<String, Slot<Target>> {
        &self.targets
    }

    pub fn attachment(&self, name: &str) -> Option<&BTreeMap<String, Value>> {
        self.attachments.get(name).and_then(Slot::one)
    }

    pub fn attachment_list(&self, name: &str) -> Vec<&BTreeMap<String, Value>> {
        self.attachments
            .get(name)
            .map(Slot::many)
            .unwrap_or_default()
    }

    /// The nested mapping of one declared input group.
    pub fn group(&self, name: &str) -> Option<BTreeMap<&str, &Value>> {
        let members = self.groups.get(name)?;
        let mut map = BTreeMap::new();
        for member in members {
            if let Some(value) = self.input(member) {
                map.insert(member.as_str(), value);
            }
        }
        Some(map)
    }

    pub fn output_identifier(&self) -> &Identifier {
        &self.output_identifier
    }

    pub fn output_target(&self) -> Option<&Target> {
        self.output_target.as_ref()
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn extra(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.clone(),
            meta: self.meta.clone(),
            inputs: self.inputs.keys().cloned().collect(),
            output: self.output_name.clone(),
            targets: self.targets.clone(),
            identifiers: self.identifiers.clone(),
            indices: self
                .identifiers
                .iter()
                .map(|(name, slot)| {
                    let slot = match slot {
                        Slot::One(id) => Slot::One(id.index.clone()),
                        Slot::Many(ids) => {
                            Slot::Many(ids.iter().map(|id| id.index.clone()).collect())
                        }
                    };
                    (name.clone(), slot)
                })
                .collect(),
            branches: self
                .identifiers
                .iter()
                .map(|(name, slot)| {
                    let slot = match slot {
                        Slot::One(id) => Slot::One(id.branch.clone()),
                        Slot::Many(ids) => {
                            Slot::Many(ids.iter().map(|id| id.branch.clone()).collect())
                        }
                    };
                    (name.clone(), slot)
                })
                .collect(),
            attachments: self.attachments.clone(),
        }
    }
}

/// Frozen view of the active task, retrieved with [`current_task`].
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub name: String,
    pub meta: Value,
    pub inputs: Vec<String>,
    pub output: Option<String>,
    pub targets: BTreeMap<String, Slot<Target>>,
    pub identifiers: BTreeMap<String, Slot<Identifier>>,
    pub indices: BTreeMap<String, Slot<Index>>,
    pub branches: BTreeMap<String, Slot<Branch>>,
    pub attachments: BTreeMap<String, Slot<BTreeMap<String, Value>>>,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskSnapshot>> = const { RefCell::new(None) };
}

/// Snapshot of the task currently executing on this thread, if any.
pub fn current_task() -> Option<TaskSnapshot> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

struct ContextGuard {
    previous: Option<TaskSnapshot>,
}

impl ContextGuard {
    fn publish(snapshot: TaskSnapshot) -> Self {
        let previous = CURRENT_TASK.with(|cell| cell.borrow_mut().replace(snapshot));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Resolution result of one input slot.
#[derive(Debug, Clone)]
pub enum Resolved {
    One(Option<Target>),
    Many(Vec<Target>),
}

impl Resolved {
    fn is_found(&self) -> bool {
        match self {
            Resolved::One(target) => target.is_some(),
            Resolved::Many(targets) => !targets.is_empty(),
        }
    }
}

struct TaskState {
    status: Status,
    message: Option<String>,
    error: Option<String>,
    mode: Option<WriteMode>,
    fallback: bool,
    available: BTreeMap<String, Resolved>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub parameters: BTreeMap<String, Value>,
    pub meta: Value,
    pub extra: BTreeMap<String, Value>,
}

pub struct Task {
    uuid: Uuid,
    machine: Arc<Machine>,
    input_ids: Vec<Identifier>,
    output_id: Identifier,
    output: Option<Target>,
    parameters: BTreeMap<String, Value>,
    extra: BTreeMap<String, Value>,
    meta: Value,
    state: Mutex<TaskState>,
    callbacks: Mutex<Vec<TaskCallback>>,
}

impl Task {
    pub fn new(
        machine: Arc<Machine>,
        input_ids: Vec<Identifier>,
        output_id: Identifier,
        options: TaskOptions,
    ) -> Result<Arc<Self>, MachineError> {
        let output = match machine.main_output() {
            Some(slot) => Some(slot.target(output_id.index.clone(), output_id.branch.clone())?),
            None => None,
        };

        let parameters = solve_parameters(&machine.all_parameters(), &options.parameters)
            .map_err(|source| {
                MachineError::Parameter(ParameterError::Task {
                    task: machine.name().to_string(),
                    source: Box::new(source),
                })
            })?;

        Ok(Arc::new(Self {
            uuid: Uuid::new_v4(),
            machine,
            input_ids,
            output_id,
            output,
            parameters,
            extra: options.extra,
            meta: options.meta,
            state: Mutex::new(TaskState {
                status: Status::New,
                message: None,
                error: None,
                mode: None,
                fallback: true,
                available: BTreeMap::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
        }))
    }

    /// Reconstruct a task from its serialized record.
    pub fn deserialize(
        machine: Arc<Machine>,
        record: &Value,
        meta: Value,
    ) -> Result<Arc<Self>, GraphError> {
        let invalid = || GraphError::History(record.to_string());

        let inputs: Vec<Identifier> = record
            .get("inputs")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|_| invalid())?
            .ok_or_else(invalid)?;
        let output: Identifier = match record.get("output") {
            None | Some(Value::Null) => Identifier::none(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| invalid())?,
        };
        let as_map = |value: Option<&Value>| -> BTreeMap<String, Value> {
            value
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        };

        Ok(Self::new(
            machine,
            inputs,
            output,
            TaskOptions {
                parameters: as_map(record.get("parameters")),
                extra: as_map(record.get("extra")),
                meta,
            },
        )?)
    }

    /// Serialized record: `{name, inputs, output, parameters, extra}`.
    pub fn serialize(&self) -> Value {
        json!({
            "name": self.machine.name(),
            "inputs": self.input_ids,
            "output": self.output_id,
            "parameters": Value::Object(Map::from_iter(self.parameters.clone())),
            "extra": Value::Object(Map::from_iter(self.extra.clone())),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    /// Message of a rejection or expected error, if any.
    pub fn message(&self) -> Option<String> {
        self.state.lock().unwrap().message.clone()
    }

    /// Captured error chain of an unexpected failure.
    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn input_identifiers(&self) -> &[Identifier] {
        &self.input_ids
    }

    pub fn output_identifier(&self) -> Identifier {
        self.output_id.clone()
    }

    pub fn output_target(&self) -> Option<&Target> {
        self.output.as_ref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn meta(&self) -> &Value {
        &self.meta
    }

    pub fn is_aggregate(&self) -> bool {
        self.machine.aggregate().is_aggregating()
    }

    /// True when the output lands in a temporary storage.
    pub fn is_temporary(&self) -> bool {
        self.output.as_ref().is_some_and(Target::is_temp)
    }

    /// Queue ordering key: output identifier, or the null identifier for
    /// side-effect tasks.
    pub fn sort_key(&self) -> (Index, Branch) {
        if self.output.is_some() {
            (self.output_id.index.clone(), self.output_id.branch.clone())
        } else {
            (Index::empty(), Branch::empty())
        }
    }

    /// Set the write mode and fallback toggle for the coming run.
    pub fn prepare(&self, mode: Option<WriteMode>, fallback: bool) {
        let mut state = self.state.lock().unwrap();
        state.mode = mode;
        state.fallback = fallback;
    }

    pub fn add_callback(&self, callback: TaskCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// Branch fallback applies only under `Requires::All`.
    fn fallback_enabled(&self, state: &TaskState) -> bool {
        state.fallback && self.machine.requires() == Requires::All
    }

    /// True when another task's output can feed one of this task's inputs.
    pub fn is_child_of(&self, other: &Task) -> bool {
        let Some(output) = other.output_target() else {
            return false;
        };
        let feeds_input = self
            .machine
            .flat_inputs()
            .iter()
            .any(|io| io.dest() == Some(output.name()));
        feeds_input && self.input_ids.contains(&output.identifier())
    }

    pub fn is_parent_of(&self, other: &Task) -> bool {
        other.is_child_of(self)
    }

    /// Output target exists in its storage.
    pub fn complete(&self, factory: &Factory) -> bool {
        match &self.output {
            Some(target) => factory.exists(target),
            None => false,
        }
    }

    /// Resolve the available inputs and report readiness.
    pub fn ready(&self, factory: &Factory) -> bool {
        if self.machine.inputs().is_empty() {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        self.update_inputs(&mut state, factory);
        self.ready_locked(&state)
    }

    fn ready_locked(&self, state: &TaskState) -> bool {
        if self.machine.inputs().is_empty() {
            return true;
        }
        if state.available.is_empty() {
            return false;
        }
        match self.machine.requires() {
            Requires::All => state.available.values().all(Resolved::is_found),
            Requires::Any => state.available.values().any(Resolved::is_found),
        }
    }

    /// Walk each input's alternatives, in order, against every bound
    /// storage; crop the branch and retry while fallback allows. Resolutions
    /// in which no target carries the requested branch are dropped.
    fn update_inputs(&self, state: &mut TaskState, factory: &Factory) {
        if !matches!(state.status, Status::New | Status::Pending) {
            return;
        }
        let fallback = self.fallback_enabled(state);
        let aggregate = self.is_aggregate();

        let mut found: BTreeMap<String, Vec<Target>> = self
            .machine
            .input_names()
            .iter()
            .map(|name| (name.to_string(), Vec::new()))
            .collect();

        for id in &self.input_ids {
            let mut targets: BTreeMap<String, Target> = BTreeMap::new();

            for slot in self.machine.inputs() {
                let mut branch = id.branch.clone();
                'fallback: loop {
                    for alternative in &slot.alternatives {
                        let Ok(target) = alternative.target(id.index.clone(), branch.clone())
                        else {
                            continue;
                        };
                        if factory.exists(&target) {
                            debug!("found target {target} for input '{}'", slot.name);
                            targets.insert(slot.name.clone(), target);
                            break 'fallback;
                        }
                    }
                    if fallback && !branch.is_empty() {
                        branch = branch.crop(1).expect("non-empty branch");
                        continue;
                    }
                    debug!("no target found for input '{}'", slot.name);
                    break;
                }
            }

            // ignore this identifier unless at least one target carries the
            // requested branch
            if targets.values().all(|target| target.branch() != &id.branch) {
                continue;
            }
            for (name, target) in targets {
                found.entry(name).or_default().push(target);
            }
        }

        state.available = found
            .into_iter()
            .map(|(name, targets)| {
                let resolved = if aggregate {
                    Resolved::Many(targets)
                } else {
                    Resolved::One(targets.into_iter().next())
                };
                (name, resolved)
            })
            .collect();
    }

    /// Resolved input targets, substituting the primary defaults for inputs
    /// that never resolved. Used by temp-storage cleanup.
    pub fn input_targets_flat(&self) -> Vec<Target> {
        let state = self.state.lock().unwrap();
        let mut targets = Vec::new();
        for slot in self.machine.inputs() {
            match state.available.get(&slot.name) {
                Some(Resolved::One(Some(target))) => targets.push(target.clone()),
                Some(Resolved::Many(list)) if !list.is_empty() => {
                    targets.extend(list.iter().cloned());
                }
                _ => {
                    // defaults: the primary alternative at the requested ids
                    let ids: &[Identifier] = if self.is_aggregate() {
                        &self.input_ids
                    } else {
                        &self.input_ids[..self.input_ids.len().min(1)]
                    };
                    for id in ids {
                        if let Ok(target) =
                            slot.primary().target(id.index.clone(), id.branch.clone())
                        {
                            targets.push(target);
                        }
                    }
                }
            }
        }
        targets
    }

    fn transition(&self, status: Status, message: Option<String>) -> Status {
        {
            let mut state = self.state.lock().unwrap();
            state.status = status;
            if message.is_some() {
                state.message = message.clone();
            }
        }
        let callbacks = self.callbacks.lock().unwrap().clone();
        for callback in callbacks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(self, message.as_deref())
            }));
            if outcome.is_err() {
                info!("task {self}: an error occured during callback");
            }
        }
        status
    }

    fn set_error(&self, error: String) {
        self.state.lock().unwrap().error = Some(error);
    }

    /// Load input data and build the function arguments.
    fn load_args(&self, factory: &Factory) -> anyhow::Result<TaskArgs> {
        let available = self.state.lock().unwrap().available.clone();

        let mut inputs = BTreeMap::new();
        let mut identifiers = BTreeMap::new();
        let mut targets = BTreeMap::new();
        let mut attachments = BTreeMap::new();

        for (name, resolved) in &available {
            match resolved {
                Resolved::One(Some(target)) => {
                    let value = factory.read(target)?;
                    inputs.insert(name.clone(), Slot::One(value));
                    identifiers.insert(name.clone(), Slot::One(target.identifier()));
                    attachments.insert(name.clone(), Slot::One(target.attachment()));
                    targets.insert(name.clone(), Slot::One(target.clone()));
                }
                Resolved::One(None) => {} // missing input stays absent
                Resolved::Many(list) => {
                    let mut values = Vec::new();
                    let mut ids = Vec::new();
                    let mut attach = Vec::new();
                    for target in list {
                        match factory.read(target) {
                            Ok(value) => {
                                values.push(value);
                                ids.push(target.identifier());
                                attach.push(target.attachment());
                            }
                            Err(e) => {
                                debug!("skipping aggregate component {target}: {e}");
                            }
                        }
                    }
                    if values.is_empty() {
                        return Err(
                            Reject(format!("All input data for {name} were rejected")).into()
                        );
                    }
                    inputs.insert(name.clone(), Slot::Many(values));
                    identifiers.insert(name.clone(), Slot::Many(ids));
                    attachments.insert(name.clone(), Slot::Many(attach));
                    targets.insert(name.clone(), Slot::Many(list.clone()));
                }
            }
        }

        if let (Some(name), Some(target)) = (self.machine.output_name(), &self.output) {
            identifiers.insert(name.to_string(), Slot::One(target.identifier()));
            attachments.insert(name.to_string(), Slot::One(target.attachment()));
            targets.insert(name.to_string(), Slot::One(target.clone()));
        }

        Ok(TaskArgs {
            name: self.machine.name().to_string(),
            inputs,
            identifiers,
            targets,
            attachments,
            groups: self.machine.groups().clone(),
            output_name: self.machine.output_name().map(str::to_string),
            output_identifier: self.output_id.clone(),
            output_target: self.output.clone(),
            parameters: self.parameters.clone(),
            extra: self.extra.clone(),
            meta: self.meta.clone(),
            aggregate: self.is_aggregate(),
        })
    }

    /// Run the task once: skip, pend, or execute and persist.
    pub fn safe_run(&self, factory: &Factory) -> Status {
        let mode = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() || state.status == Status::Running {
                warn!("task {self} has terminated, cannot run again");
                return state.status;
            }

            if self.complete(factory) && state.mode.is_none() {
                info!("target of {self} already exists, skipping");
                drop(state);
                return self.transition(Status::Skipped, None);
            }

            self.update_inputs(&mut state, factory);
            if !self.ready_locked(&state) {
                info!("task {self} not ready, pending");
                drop(state);
                return self.transition(Status::Pending, None);
            }
            state.mode
        };

        info!("task {self}: running");
        self.transition(Status::Running, None);

        let args = match self.load_args(factory) {
            Ok(args) => args,
            Err(e) => return self.fail(e),
        };

        let result = {
            let _guard = ContextGuard::publish(args.snapshot());
            (self.machine.func())(&args)
        };

        let value = match result {
            Ok(value) => value,
            Err(e) => return self.fail(e),
        };

        if let Some(output) = &self.output {
            if let Err(e) = factory.write(output, &value, mode) {
                info!("task {self}: an error occured while writing output");
                self.set_error(e.to_string());
                return self.transition(Status::Error, Some(e.to_string()));
            }
        }

        info!("task {self}: done");
        self.transition(Status::Success, None)
    }

    /// Translate a function error into the matching terminal status.
    fn fail(&self, error: anyhow::Error) -> Status {
        if let Some(reject) = error.downcast_ref::<Reject>() {
            let message = reject.0.clone();
            info!("task {self} was rejected ({message})");
            return self.transition(Status::Rejected, Some(message));
        }
        if let Some(expected) = error.downcast_ref::<Expected>() {
            let message = expected.0.clone();
            info!("task {self} had an expected error ({message})");
            return self.transition(Status::Error, Some(message));
        }
        info!("task {self}: an error occured while running");
        self.set_error(format!("{error:?}"));
        self.transition(Status::Error, Some(error.to_string()))
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<String> = self.input_ids.iter().map(|id| id.to_string()).collect();
        write!(f, "{}({}", self.name(), inputs.join(", "))?;
        if let Some(output) = &self.output {
            write!(f, "->{output}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({self})")
    }
}

/// Solved metamachine record kept alongside a graph for history purposes.
#[derive(Debug, Clone)]
pub struct MetaRecord {
    pub name: String,
    pub parameters: BTreeMap<String, Value>,
}

impl MetaRecord {
    pub fn serialize(&self) -> Value {
        json!({
            "name": self.name,
            "parameters": Value::Object(Map::from_iter(self.parameters.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Aggregate as Agg;

    fn ix(s: &str) -> Index {
        Index::atom(s).unwrap()
    }

    fn id(index: &str) -> Identifier {
        Identifier::new(ix(index), Branch::empty())
    }

    fn machine_ab() -> Arc<Machine> {
        Machine::builder("proc", |_args| Ok(Value::Null))
            .input("A")
            .output("B")
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_identity() {
        let machine = machine_ab();
        let t1 = Task::new(
            machine.clone(),
            vec![id("1")],
            id("1"),
            TaskOptions::default(),
        )
        .unwrap();
        let t2 = Task::new(machine, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(t1, t1.clone());
    }

    #[test]
    fn test_sort_key() {
        let machine = machine_ab();
        let t = Task::new(machine, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        assert_eq!(t.sort_key(), (ix("1"), Branch::empty()));

        let side_effect = Machine::builder("side", |_args| Ok(Value::Null))
            .input("A")
            .build()
            .unwrap();
        let t = Task::new(side_effect, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        assert_eq!(t.sort_key(), (Index::empty(), Branch::empty()));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let machine = Machine::builder("proc", |_args| Ok(Value::Null))
            .input("A")
            .output("B")
            .parameter(
                crate::parameters::Parameter::new("n", crate::parameters::ParamKind::Int)
                    .with_default(json!(1)),
            )
            .build()
            .unwrap();
        let task = Task::new(
            machine.clone(),
            vec![Identifier::new(ix("1"), Branch::atom("br").unwrap())],
            id("2"),
            TaskOptions {
                parameters: BTreeMap::from([("n".to_string(), json!(3))]),
                ..Default::default()
            },
        )
        .unwrap();

        let record = task.serialize();
        assert_eq!(record["name"], json!("proc"));

        let back = Task::deserialize(machine, &record, Value::Null).unwrap();
        assert_eq!(back.input_identifiers(), task.input_identifiers());
        assert_eq!(back.output_identifier(), task.output_identifier());
        assert_eq!(back.parameters()["n"], json!(3));
    }

    #[test]
    fn test_is_child_of() {
        let producer = Machine::builder("a", |_args| Ok(Value::Null))
            .output("A")
            .build()
            .unwrap();
        let consumer = machine_ab();

        let parent = Task::new(producer, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        let child = Task::new(consumer, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        assert!(child.is_child_of(&parent));
        assert!(parent.is_parent_of(&child));
        assert!(!parent.is_child_of(&child));

        // different identifier: not related
        let other = Task::new(
            machine_ab(),
            vec![id("2")],
            id("2"),
            TaskOptions::default(),
        )
        .unwrap();
        assert!(!other.is_child_of(&parent));
    }

    #[test]
    fn test_aggregate_invariants() {
        let machine = Machine::builder("agg", |_args| Ok(Value::Null))
            .input("A")
            .aggregate(Agg::Ids)
            .build()
            .unwrap();
        let task = Task::new(
            machine,
            vec![id("1"), id("2")],
            Identifier::none(),
            TaskOptions::default(),
        )
        .unwrap();
        assert!(task.is_aggregate());
        assert!(task.output_identifier().is_none());
        assert_eq!(task.input_identifiers().len(), 2);
    }

    #[test]
    fn test_parameter_solving_at_creation() {
        let machine = Machine::builder("proc", |_args| Ok(Value::Null))
            .input("A")
            .output("B")
            .parameter(crate::parameters::Parameter::new(
                "n",
                crate::parameters::ParamKind::Int,
            ))
            .build()
            .unwrap();

        // missing required parameter fails at creation
        let result = Task::new(machine, vec![id("1")], id("1"), TaskOptions::default());
        assert!(matches!(
            result,
            Err(MachineError::Parameter(ParameterError::Task { .. }))
        ));
    }

    #[test]
    fn test_current_task_outside_run() {
        assert!(current_task().is_none());
    }
}
