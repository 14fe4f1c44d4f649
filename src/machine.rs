//! Machines: declarative wrappers around processing functions.
//!
//! A [`Machine`] couples a function with its i/o contract: named input slots
//! (each an ordered list of alternative [`TargetType`]s, the first being
//! primary), at most one output slot, typed parameters, an aggregation mode
//! and a readiness rule. The contract is validated up front by
//! [`MachineBuilder`]; at run time the function receives a
//! [`TaskArgs`](crate::task::TaskArgs) carrying exactly what was declared.
//!
//! A [`MetaMachine`] is solved rather than run: given its parameters it
//! yields child programs, recursively, until only concrete machines remain.
//! I/o slots that are not part of the composite's external surface are
//! marked temporary so intermediate artefacts can be cleaned up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{GraphError, MachineError, TargetError};
use crate::identifier::{Branch, Identifier, Index};
use crate::parameters::{Parameter, solve_parameters};
use crate::target::TargetType;
use crate::task::{Task, TaskArgs, TaskOptions};

pub type MachineFn = Arc<dyn Fn(&TaskArgs) -> anyhow::Result<Value> + Send + Sync>;

/// How a machine groups its input identifiers into tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// One task per input identifier.
    None,
    /// A single task over every input identifier.
    Ids,
    /// One task per distinct input branch, aggregating indices.
    Index,
    /// One task per distinct input index, aggregating branches.
    Branch,
}

impl Aggregate {
    pub fn is_aggregating(self) -> bool {
        self != Aggregate::None
    }
}

/// Readiness rule over the machine's inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requires {
    All,
    Any,
}

/// One named input or output slot with its alternatives.
#[derive(Debug, Clone)]
pub struct IoSlot {
    pub name: String,
    pub alternatives: Vec<TargetType>,
}

impl IoSlot {
    pub fn primary(&self) -> &TargetType {
        &self.alternatives[0]
    }
}

/// Parse the compact i/o grammar: `&`-separated slots, each with
/// `|`-separated alternatives of `name[:type[:dest]]` form.
///
/// `"A & B"` declares two slots; `"A|B"` one slot `A` with the alternative
/// destination `B`; `"A::A1 | A::A2"` one slot `A` trying `A1` then `A2`.
fn parse_io_expr(expr: &str) -> Result<Vec<(String, Vec<TargetType>)>, TargetError> {
    let mut slots: Vec<(String, Vec<TargetType>)> = Vec::new();
    for part in expr.split('&') {
        let mut name: Option<String> = None;
        let mut alternatives = Vec::new();
        for alt in part.split('|') {
            let (alt_name, slot) = TargetType::parse(alt.trim())?;
            match &name {
                None => name = Some(alt_name),
                Some(existing) => {
                    if alt_name != *existing && Some(alt_name.as_str()) != slot.dest() {
                        return Err(TargetError::Dest(alt.trim().to_string()));
                    }
                }
            }
            alternatives.push(slot);
        }
        let name = name.unwrap_or_default();
        match slots.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1.extend(alternatives),
            None => slots.push((name, alternatives)),
        }
    }
    Ok(slots)
}

pub struct Machine {
    name: String,
    description: Option<String>,
    func: MachineFn,
    inputs: Vec<IoSlot>,
    output: Option<IoSlot>,
    groups: BTreeMap<String, Vec<String>>,
    parameters: BTreeMap<String, Parameter>,
    frozen: BTreeMap<String, Parameter>,
    aggregate: Aggregate,
    requires: Requires,
}

impl Machine {
    pub fn builder<F>(name: impl Into<String>, func: F) -> MachineBuilder
    where
        F: Fn(&TaskArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        MachineBuilder {
            name: name.into(),
            description: None,
            func: Arc::new(func),
            inputs: Vec::new(),
            outputs: Vec::new(),
            groups: BTreeMap::new(),
            parameters: Vec::new(),
            aggregate: Aggregate::None,
            requires: Requires::All,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn func(&self) -> &MachineFn {
        &self.func
    }

    pub fn aggregate(&self) -> Aggregate {
        self.aggregate
    }

    pub fn requires(&self) -> Requires {
        self.requires
    }

    pub fn inputs(&self) -> &[IoSlot] {
        &self.inputs
    }

    pub fn output(&self) -> Option<&IoSlot> {
        self.output.as_ref()
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|slot| slot.name.as_str()).collect()
    }

    pub fn output_name(&self) -> Option<&str> {
        self.output.as_ref().map(|slot| slot.name.as_str())
    }

    /// Primary alternative of every input slot, in declaration order.
    pub fn main_inputs(&self) -> Vec<&TargetType> {
        self.inputs.iter().map(IoSlot::primary).collect()
    }

    pub fn main_output(&self) -> Option<&TargetType> {
        self.output.as_ref().map(IoSlot::primary)
    }

    /// Every input alternative, flattened.
    pub fn flat_inputs(&self) -> Vec<&TargetType> {
        self.inputs
            .iter()
            .flat_map(|slot| slot.alternatives.iter())
            .collect()
    }

    pub fn flat_outputs(&self) -> Vec<&TargetType> {
        self.output
            .iter()
            .flat_map(|slot| slot.alternatives.iter())
            .collect()
    }

    /// Assignable and frozen parameters together.
    pub fn all_parameters(&self) -> BTreeMap<String, Parameter> {
        let mut all = self.parameters.clone();
        all.extend(self.frozen.clone());
        all
    }

    pub fn parameters(&self) -> &BTreeMap<String, Parameter> {
        &self.parameters
    }

    fn variable_ios(&self) -> BTreeMap<String, Parameter> {
        self.parameters
            .iter()
            .filter(|(_, p)| p.is_variable_io())
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect()
    }

    /// Internal copy with replaced i/o slots, keeping everything else.
    pub(crate) fn remodel(
        self: &Arc<Self>,
        inputs: Vec<IoSlot>,
        output: Option<IoSlot>,
        parameters: BTreeMap<String, Parameter>,
    ) -> Arc<Machine> {
        Arc::new(Machine {
            name: self.name.clone(),
            description: self.description.clone(),
            func: self.func.clone(),
            inputs,
            output,
            groups: self.groups.clone(),
            parameters,
            frozen: self.frozen.clone(),
            aggregate: self.aggregate,
            requires: self.requires,
        })
    }

    /// Resolve variable i/o parameters, swapping or dropping the slots they
    /// control. Returns the replacement machine and the values consumed.
    pub fn solve(
        self: &Arc<Self>,
        provided: &BTreeMap<String, Value>,
    ) -> Result<(Arc<Machine>, BTreeMap<String, Value>), MachineError> {
        let variable = self.variable_ios();
        if variable.is_empty() {
            return Ok((self.clone(), BTreeMap::new()));
        }

        let mut consumed = BTreeMap::new();
        let mut resolved: BTreeMap<String, Option<TargetType>> = BTreeMap::new();
        for (name, parameter) in &variable {
            let value = parameter.parse(provided.get(name))?;
            let vio = parameter.variable_io().expect("variable io kind");
            resolved.insert(name.clone(), vio.resolve(name, &value)?);
            consumed.insert(name.clone(), value);
        }

        let mut inputs = Vec::new();
        for slot in &self.inputs {
            match resolved.get(&slot.name) {
                Some(None) => continue, // dropped
                Some(Some(target_type)) => inputs.push(IoSlot {
                    name: slot.name.clone(),
                    alternatives: vec![target_type.clone()],
                }),
                None => inputs.push(slot.clone()),
            }
        }

        let mut output = None;
        if let Some(slot) = &self.output {
            output = match resolved.get(&slot.name) {
                Some(None) => None,
                Some(Some(target_type)) => Some(IoSlot {
                    name: slot.name.clone(),
                    alternatives: vec![target_type.clone()],
                }),
                None => Some(slot.clone()),
            };
        }

        // variable i/o parameters are consumed by the solve
        let parameters = self
            .parameters
            .iter()
            .filter(|(name, _)| !variable.contains_key(*name))
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();

        Ok((self.remodel(inputs, output, parameters), consumed))
    }

    /// Expand identifiers into tasks, honouring the aggregation mode.
    pub fn apply(
        self: &Arc<Self>,
        identifiers: &[Identifier],
        options: &ApplyOptions,
    ) -> Result<Vec<Arc<Task>>, MachineError> {
        let mut tasks = if self.aggregate.is_aggregating() {
            self.apply_aggregate(identifiers, options)?
        } else {
            self.apply_map(identifiers, options)?
        };
        tasks.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(tasks)
    }

    fn apply_map(
        self: &Arc<Self>,
        identifiers: &[Identifier],
        options: &ApplyOptions,
    ) -> Result<Vec<Arc<Task>>, MachineError> {
        let output_ids = output_identifiers(
            identifiers.iter().map(|id| id.clone()).collect(),
            &options.output_indices,
            &options.output_branches,
        )?;
        if output_ids.len() != identifiers.len() {
            return Err(MachineError::IdentifierCount);
        }

        let dispatch = dispatch_parameters(identifiers, &options.parameters)?;

        let mut tasks = Vec::with_capacity(identifiers.len());
        for (input_id, output_id) in identifiers.iter().zip(output_ids) {
            let parameters = dispatch
                .as_ref()
                .map(|map| map[&input_id.key()].clone())
                .unwrap_or_else(|| options.parameters.clone());
            let task = Task::new(
                self.clone(),
                vec![input_id.clone()],
                output_id,
                TaskOptions {
                    parameters,
                    meta: options.meta.clone(),
                    extra: options.extra.clone(),
                },
            )?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn apply_aggregate(
        self: &Arc<Self>,
        identifiers: &[Identifier],
        options: &ApplyOptions,
    ) -> Result<Vec<Arc<Task>>, MachineError> {
        // distinct group identifiers, first-seen order
        let mut groups: Vec<Identifier> = Vec::new();
        let mut push = |id: Identifier| {
            if !groups.contains(&id) {
                groups.push(id);
            }
        };
        match self.aggregate {
            Aggregate::Ids => push(Identifier::none()),
            Aggregate::Index => {
                for id in identifiers {
                    push(Identifier::new(Index::empty(), id.branch.clone()));
                }
            }
            Aggregate::Branch => {
                for id in identifiers {
                    push(Identifier::new(id.index.clone(), Branch::empty()));
                }
            }
            Aggregate::None => unreachable!("apply_aggregate on a mapping machine"),
        }

        let output_ids = output_identifiers(
            groups.clone(),
            &options.output_indices,
            &options.output_branches,
        )?;
        if output_ids.len() != groups.len() {
            return Err(MachineError::IdentifierCount);
        }

        let dispatch = dispatch_parameters(identifiers, &options.parameters)?;

        let mut tasks = Vec::with_capacity(groups.len());
        for (group, output_id) in groups.iter().zip(output_ids) {
            let input_ids: Vec<Identifier> = identifiers
                .iter()
                .filter(|id| match self.aggregate {
                    Aggregate::Ids => true,
                    Aggregate::Index => id.branch == group.branch,
                    Aggregate::Branch => id.index == group.index,
                    Aggregate::None => unreachable!(),
                })
                .cloned()
                .collect();

            // per-identifier dispatch inside an aggregating task stays
            // id-wise: each declared parameter becomes the list of per-id
            // values, in input order
            let parameters = match &dispatch {
                Some(map) => {
                    let mut merged: BTreeMap<String, Value> = BTreeMap::new();
                    for id in &input_ids {
                        for (key, value) in &map[&id.key()] {
                            merged
                                .entry(key.clone())
                                .or_insert_with(|| Value::Array(Vec::new()))
                                .as_array_mut()
                                .expect("dispatch array")
                                .push(value.clone());
                        }
                    }
                    merged
                }
                None => options.parameters.clone(),
            };

            let task = Task::new(
                self.clone(),
                input_ids,
                output_id,
                TaskOptions {
                    parameters,
                    meta: options.meta.clone(),
                    extra: options.extra.clone(),
                },
            )?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Machine({})", self.name)
    }
}

/// Caller-side options of one expansion.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Replacement output indices; empty keeps the input indices.
    pub output_indices: Vec<Index>,
    pub output_branches: OutputBranches,
    pub parameters: BTreeMap<String, Value>,
    pub meta: Value,
    pub extra: BTreeMap<String, Value>,
}

/// Caller-provided output branches.
#[derive(Debug, Clone, Default)]
pub enum OutputBranches {
    /// Keep the input branches.
    #[default]
    Default,
    /// Set-append one branch to every input branch.
    Extend(Branch),
    /// Pairwise replacement.
    List(Vec<Branch>),
}

fn output_identifiers(
    input_ids: Vec<Identifier>,
    output_indices: &[Index],
    output_branches: &OutputBranches,
) -> Result<Vec<Identifier>, MachineError> {
    let indices: Vec<Index> = if output_indices.is_empty() {
        input_ids.iter().map(|id| id.index.clone()).collect()
    } else {
        output_indices.to_vec()
    };

    let branches: Vec<Branch> = match output_branches {
        OutputBranches::Default => input_ids.iter().map(|id| id.branch.clone()).collect(),
        OutputBranches::Extend(extension) => input_ids
            .iter()
            .map(|id| id.branch.concat(extension))
            .collect(),
        OutputBranches::List(list) => list.clone(),
    };

    if indices.len() != branches.len() {
        return Err(MachineError::IdentifierCount);
    }
    Ok(indices
        .into_iter()
        .zip(branches)
        .map(|(index, branch)| Identifier::new(index, branch))
        .collect())
}

/// Split an id-keyed parameter map into per-identifier subsets.
///
/// Returns `None` when the map is not keyed by the identifiers, in which
/// case the same parameters apply to every task.
fn dispatch_parameters(
    identifiers: &[Identifier],
    parameters: &BTreeMap<String, Value>,
) -> Result<Option<BTreeMap<String, BTreeMap<String, Value>>>, MachineError> {
    let keys: Vec<String> = identifiers.iter().map(Identifier::key).collect();
    if !keys.iter().any(|key| parameters.contains_key(key)) {
        return Ok(None);
    }
    let mut dispatch = BTreeMap::new();
    for key in keys {
        let Some(Value::Object(map)) = parameters.get(&key) else {
            return Err(MachineError::MissingDispatch);
        };
        dispatch.insert(
            key,
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        );
    }
    Ok(Some(dispatch))
}

pub struct MachineBuilder {
    name: String,
    description: Option<String>,
    func: MachineFn,
    inputs: Vec<(String, Vec<TargetType>)>,
    outputs: Vec<(String, Vec<TargetType>)>,
    groups: BTreeMap<String, Vec<String>>,
    parameters: Vec<Parameter>,
    aggregate: Aggregate,
    requires: Requires,
}

impl MachineBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare inputs with the compact grammar (`"A & B"`, `"A|B"`,
    /// `"A:T:D"`). May be called repeatedly.
    pub fn input(mut self, expr: &str) -> Self {
        match parse_io_expr(expr) {
            Ok(slots) => {
                for (name, alternatives) in slots {
                    match self.inputs.iter_mut().find(|(n, _)| *n == name) {
                        Some(entry) => entry.1.extend(alternatives),
                        None => self.inputs.push((name, alternatives)),
                    }
                }
            }
            Err(e) => self.inputs.push((format!("!{e}"), Vec::new())),
        }
        self
    }

    /// Declare one input slot explicitly.
    pub fn input_slot(mut self, name: impl Into<String>, alternatives: Vec<TargetType>) -> Self {
        let name = name.into();
        match self.inputs.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1.extend(alternatives),
            None => self.inputs.push((name, alternatives)),
        }
        self
    }

    pub fn output(mut self, expr: &str) -> Self {
        match parse_io_expr(expr) {
            Ok(slots) => self.outputs.extend(slots),
            Err(e) => self.outputs.push((format!("!{e}"), Vec::new())),
        }
        self
    }

    pub fn output_slot(mut self, name: impl Into<String>, target_type: TargetType) -> Self {
        self.outputs.push((name.into(), vec![target_type]));
        self
    }

    /// Declare a named bundle of input slots passed to the function as one
    /// nested mapping.
    pub fn group(mut self, name: impl Into<String>, inputs: &[&str]) -> Self {
        self.groups
            .entry(name.into())
            .or_default()
            .extend(inputs.iter().map(|s| s.to_string()));
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn requires(mut self, requires: Requires) -> Self {
        self.requires = requires;
        self
    }

    pub fn build(self) -> Result<Arc<Machine>, MachineError> {
        // deferred i/o grammar failures
        for (name, alternatives) in self.inputs.iter().chain(&self.outputs) {
            if alternatives.is_empty() {
                return Err(MachineError::Target(TargetError::Dest(name.clone())));
            }
        }

        if self.outputs.len() > 1 {
            return Err(MachineError::MultipleOutputs);
        }
        let output = self.outputs.into_iter().next().map(|(name, alternatives)| {
            IoSlot {
                name,
                alternatives,
            }
        });
        if let Some(slot) = &output
            && slot.alternatives.len() > 1
        {
            return Err(MachineError::DuplicateOutput(slot.name.clone()));
        }

        let inputs: Vec<IoSlot> = self
            .inputs
            .into_iter()
            .map(|(name, alternatives)| IoSlot { name, alternatives })
            .collect();

        // split off frozen parameters, check for duplicates
        let mut parameters = BTreeMap::new();
        let mut frozen = BTreeMap::new();
        for parameter in self.parameters {
            let name = parameter.name().to_string();
            if parameters.contains_key(&name) || frozen.contains_key(&name) {
                return Err(MachineError::DuplicateParameter(name));
            }
            if parameter.is_frozen() {
                frozen.insert(name, parameter);
            } else {
                parameters.insert(name, parameter);
            }
        }

        // non-variable parameters must not shadow i/o names
        let io_names: Vec<&str> = inputs
            .iter()
            .map(|slot| slot.name.as_str())
            .chain(output.iter().map(|slot| slot.name.as_str()))
            .collect();
        for (name, parameter) in parameters.iter().chain(&frozen) {
            if !parameter.is_variable_io() && io_names.contains(&name.as_str()) {
                return Err(MachineError::Overlap(name.clone()));
            }
        }

        for (group, members) in &self.groups {
            for member in members {
                if !inputs.iter().any(|slot| slot.name == *member) {
                    return Err(MachineError::UnknownGroupInput {
                        group: group.clone(),
                        input: member.clone(),
                    });
                }
            }
        }

        Ok(Arc::new(Machine {
            name: self.name,
            description: self.description,
            func: self.func,
            inputs,
            output,
            groups: self.groups,
            parameters,
            frozen,
            aggregate: self.aggregate,
            requires: self.requires,
        }))
    }
}

pub type MetaFn =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> anyhow::Result<Vec<Program>> + Send + Sync>;

/// A machine whose "function" yields child programs when solved.
pub struct MetaMachine {
    name: String,
    description: Option<String>,
    solver: MetaFn,
    /// Parameters consumed by the solver itself.
    parameters: BTreeMap<String, Parameter>,
    /// Declared external surface, informational.
    inputs: Vec<TargetType>,
    outputs: Vec<TargetType>,
}

impl MetaMachine {
    pub fn new<F>(name: impl Into<String>, solver: F) -> Self
    where
        F: Fn(&BTreeMap<String, Value>) -> anyhow::Result<Vec<Program>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            solver: Arc::new(solver),
            parameters: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Fixed composite: solving always yields the given programs.
    pub fn from_list(name: impl Into<String>, programs: Vec<Program>) -> Self {
        let (inputs, outputs) = meta_ios_of_programs(&programs);
        let cloned = programs.clone();
        let mut meta = Self::new(name, move |_| Ok(cloned.clone()));
        meta.inputs = inputs;
        meta.outputs = outputs;
        meta
    }

    /// A `choice` parameter selects among named pipelines.
    pub fn from_choices(
        name: impl Into<String>,
        choices: BTreeMap<String, Vec<Program>>,
        default: Option<String>,
    ) -> Self {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for programs in choices.values() {
            let (ins, outs) = meta_ios_of_programs(programs);
            for io in ins {
                if !inputs.contains(&io) {
                    inputs.push(io);
                }
            }
            for io in outs {
                if !outputs.contains(&io) {
                    outputs.push(io);
                }
            }
        }

        let options: Vec<Value> = choices.keys().map(|k| Value::String(k.clone())).collect();
        let mut parameter = Parameter::new("choice", crate::parameters::ParamKind::Choice(options));
        if let Some(default) = default {
            parameter = parameter.with_default(Value::String(default));
        }

        let table = choices;
        let mut meta = Self::new(name, move |params: &BTreeMap<String, Value>| {
            let choice = params
                .get("choice")
                .and_then(Value::as_str)
                .unwrap_or_default();
            table
                .get(choice)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown choice: {choice}"))
        });
        meta.parameters.insert("choice".to_string(), parameter);
        meta.inputs = inputs;
        meta.outputs = outputs;
        meta
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters
            .insert(parameter.name().to_string(), parameter);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, Parameter> {
        &self.parameters
    }

    /// Declared external surface: `(inputs, outputs)`.
    pub fn surface(&self) -> (&[TargetType], &[TargetType]) {
        (&self.inputs, &self.outputs)
    }

    /// Bind parameters, invoke the solver and recursively solve the
    /// children; intermediates are marked temporary.
    pub fn solve(
        self: &Arc<Self>,
        provided: &BTreeMap<String, Value>,
    ) -> Result<(Vec<Arc<Machine>>, BTreeMap<String, Value>), GraphError> {
        let mut consumed = solve_parameters(&self.parameters, provided)?;

        let children = (self.solver)(&consumed).map_err(|source| GraphError::Solve {
            name: self.name.clone(),
            source,
        })?;

        let mut solved = Vec::new();
        for child in children {
            let (machines, values) = child.solve(provided)?;
            solved.extend(machines);
            consumed.extend(values);
        }

        Ok((mark_intermediates_temp(solved), consumed))
    }
}

impl fmt::Debug for MetaMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetaMachine({})", self.name)
    }
}

/// The union a toolbox and a dependency graph operate on.
#[derive(Clone)]
pub enum Program {
    Machine(Arc<Machine>),
    Meta(Arc<MetaMachine>),
}

impl Program {
    pub fn name(&self) -> &str {
        match self {
            Program::Machine(machine) => machine.name(),
            Program::Meta(meta) => meta.name(),
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Program::Machine(machine) => machine.description(),
            Program::Meta(meta) => meta.description(),
        }
    }

    /// Assignable parameters this program (or its solver) exposes.
    pub fn parameters(&self) -> BTreeMap<String, Parameter> {
        match self {
            Program::Machine(machine) => machine.parameters().clone(),
            Program::Meta(meta) => meta.parameters().clone(),
        }
    }

    /// Solve to a flat list of concrete machines, collecting the parameter
    /// values consumed along the way.
    pub fn solve(
        &self,
        provided: &BTreeMap<String, Value>,
    ) -> Result<(Vec<Arc<Machine>>, BTreeMap<String, Value>), GraphError> {
        match self {
            Program::Machine(machine) => {
                let (solved, consumed) = machine.solve(provided)?;
                Ok((vec![solved], consumed))
            }
            Program::Meta(meta) => meta.solve(provided),
        }
    }
}

impl From<Arc<Machine>> for Program {
    fn from(machine: Arc<Machine>) -> Self {
        Program::Machine(machine)
    }
}

impl From<Arc<MetaMachine>> for Program {
    fn from(meta: Arc<MetaMachine>) -> Self {
        Program::Meta(meta)
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Program({})", self.name())
    }
}

/// External surface of a machine list: slots appearing only as inputs, and
/// slots appearing only as outputs.
pub fn meta_ios(machines: &[Arc<Machine>]) -> (Vec<TargetType>, Vec<TargetType>) {
    let all_inputs: Vec<TargetType> = machines
        .iter()
        .flat_map(|m| m.flat_inputs().into_iter().cloned())
        .collect();
    let all_outputs: Vec<TargetType> = machines
        .iter()
        .flat_map(|m| m.flat_outputs().into_iter().cloned())
        .collect();

    let mut inputs = Vec::new();
    for io in &all_inputs {
        if !all_outputs.contains(io) && !inputs.contains(io) {
            inputs.push(io.clone());
        }
    }
    let mut outputs = Vec::new();
    for io in &all_outputs {
        if !all_inputs.contains(io) && !outputs.contains(io) {
            outputs.push(io.clone());
        }
    }
    (inputs, outputs)
}

fn meta_ios_of_programs(programs: &[Program]) -> (Vec<TargetType>, Vec<TargetType>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut add = |list: &mut Vec<TargetType>, io: TargetType| {
        if !list.contains(&io) {
            list.push(io);
        }
    };
    let mut machines = Vec::new();
    for program in programs {
        match program {
            Program::Machine(machine) => machines.push(machine.clone()),
            Program::Meta(meta) => {
                let (ins, outs) = meta.surface();
                for io in ins {
                    add(&mut inputs, io.clone());
                }
                for io in outs {
                    add(&mut outputs, io.clone());
                }
            }
        }
    }
    let (ins, outs) = meta_ios(&machines);
    for io in ins {
        add(&mut inputs, io);
    }
    for io in outs {
        add(&mut outputs, io);
    }
    (inputs, outputs)
}

/// Flag every i/o slot that is not part of the composite surface as
/// temporary, so the factory can clean the intermediate artefacts up.
pub(crate) fn mark_intermediates_temp(machines: Vec<Arc<Machine>>) -> Vec<Arc<Machine>> {
    let (meta_inputs, meta_outputs) = meta_ios(&machines);

    machines
        .into_iter()
        .map(|machine| {
            let inputs: Vec<IoSlot> = machine
                .inputs()
                .iter()
                .map(|slot| IoSlot {
                    name: slot.name.clone(),
                    alternatives: slot
                        .alternatives
                        .iter()
                        .map(|io| {
                            if meta_inputs.contains(io) || io.is_temp() {
                                io.clone()
                            } else {
                                io.clone().with_temp(true)
                            }
                        })
                        .collect(),
                })
                .collect();
            let output = machine.output().map(|slot| IoSlot {
                name: slot.name.clone(),
                alternatives: slot
                    .alternatives
                    .iter()
                    .map(|io| {
                        if meta_outputs.contains(io) || io.is_temp() {
                            io.clone()
                        } else {
                            io.clone().with_temp(true)
                        }
                    })
                    .collect(),
            });
            let parameters = machine.parameters().clone();
            machine.remodel(inputs, output, parameters)
        })
        .collect()
}
