//! Toolbox: an ordered registry of named programs.
//!
//! Beyond the programs themselves, a toolbox bundles everything its
//! sessions install into their storages: shared file handlers, a default
//! handler, per-name comparators and an optional signature writer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::EngineError;
use crate::handlers::FileHandler;
use crate::machine::Program;
use crate::signature::Signature;
use crate::storage::Comparator;

pub struct Toolbox {
    name: String,
    description: Option<String>,
    programs: Vec<(String, Program)>,
    help: HashMap<String, String>,
    meta: HashMap<String, Value>,
    groups: BTreeMap<String, Vec<String>>,
    handlers: HashMap<String, Arc<dyn FileHandler>>,
    default_handler: Option<Arc<dyn FileHandler>>,
    comparators: HashMap<String, Comparator>,
    signature: Option<Signature>,
}

impl Toolbox {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            programs: Vec::new(),
            help: HashMap::new(),
            meta: HashMap::new(),
            groups: BTreeMap::new(),
            handlers: HashMap::new(),
            default_handler: None,
            comparators: HashMap::new(),
            signature: None,
        }
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

    /// Register a program under a name; duplicate names are refused.
    pub fn add_program(
        &mut self,
        name: impl Into<String>,
        program: impl Into<Program>,
    ) -> Result<(), EngineError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(EngineError::Toolbox(format!("program {name} already added")));
        }
        info!("adding new program: {name}");
        self.programs.push((name, program.into()));
        Ok(())
    }

    /// Replace a program, keeping its registration order.
    pub fn reset_program(&mut self, name: &str, program: impl Into<Program>) {
        match self.programs.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = program.into(),
            None => self.programs.push((name.to_string(), program.into())),
        }
    }

    pub fn remove_program(&mut self, name: &str) {
        self.programs.retain(|(n, _)| n != name);
        self.help.remove(name);
        self.meta.remove(name);
        for group in self.groups.values_mut() {
            group.retain(|member| member != name);
        }
    }

    pub fn set_help(&mut self, name: impl Into<String>, help: impl Into<String>) {
        self.help.insert(name.into(), help.into());
    }

    pub fn help(&self, name: &str) -> Option<&str> {
        self.help.get(name).map(String::as_str)
    }

    pub fn set_meta(&mut self, name: impl Into<String>, meta: Value) {
        self.meta.insert(name.into(), meta);
    }

    pub fn set_group(&mut self, group: impl Into<String>, name: impl Into<String>) {
        self.groups.entry(group.into()).or_default().push(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, program)| program)
    }

    pub fn program_names(&self) -> Vec<&str> {
        self.programs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn programs(&self) -> Vec<Program> {
        self.programs
            .iter()
            .map(|(_, program)| program.clone())
            .collect()
    }

    /// Register a file handler under a target name or type tag.
    pub fn add_handler(
        &mut self,
        key: impl Into<String>,
        handler: Arc<dyn FileHandler>,
        replace: bool,
    ) -> Result<(), EngineError> {
        let key = key.into();
        if !replace && self.handlers.contains_key(&key) {
            return Err(EngineError::Toolbox(format!(
                "file handler already set for target {key}"
            )));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn set_default_handler(&mut self, handler: Arc<dyn FileHandler>) {
        self.default_handler = Some(handler);
    }

    pub fn add_comparator(&mut self, name: impl Into<String>, comparator: Comparator) {
        self.comparators.insert(name.into(), comparator);
    }

    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    pub fn handlers(&self) -> &HashMap<String, Arc<dyn FileHandler>> {
        &self.handlers
    }

    pub fn default_handler(&self) -> Option<&Arc<dyn FileHandler>> {
        self.default_handler.as_ref()
    }

    pub fn comparators(&self) -> &HashMap<String, Comparator> {
        &self.comparators
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Map every program name and output destination to the programs able
    /// to produce it.
    pub fn relationships(&self) -> HashMap<String, Vec<Program>> {
        let mut relation: HashMap<String, Vec<Program>> = HashMap::new();
        for (name, program) in &self.programs {
            relation.entry(name.clone()).or_default().push(program.clone());

            let outputs: Vec<String> = match program {
                Program::Machine(machine) => machine
                    .flat_outputs()
                    .iter()
                    .filter_map(|io| io.dest())
                    .map(str::to_string)
                    .collect(),
                Program::Meta(meta) => meta
                    .surface()
                    .1
                    .iter()
                    .filter_map(|io| io.dest())
                    .map(str::to_string)
                    .collect(),
            };
            for output in outputs {
                if output != *name {
                    relation.entry(output).or_default().push(program.clone());
                }
            }
        }
        relation
    }

    /// Programs required to materialise `name`, walking input destinations
    /// up through the relationships.
    pub fn closure(&self, name: &str) -> Vec<Program> {
        let relation = self.relationships();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = vec![name.to_string()];
        let mut programs: Vec<Program> = Vec::new();

        while let Some(item) = queue.pop() {
            if !visited.insert(item.clone()) {
                continue;
            }
            let Some(found) = relation.get(&item) else {
                continue;
            };
            for program in found {
                if !programs.iter().any(|p| p.name() == program.name()) {
                    programs.push(program.clone());
                }
                let inputs: Vec<String> = match program {
                    Program::Machine(machine) => machine
                        .flat_inputs()
                        .iter()
                        .filter_map(|io| io.dest())
                        .map(str::to_string)
                        .collect(),
                    Program::Meta(meta) => meta
                        .surface()
                        .0
                        .iter()
                        .filter_map(|io| io.dest())
                        .map(str::to_string)
                        .collect(),
                };
                queue.extend(inputs);
            }
        }
        programs
    }
}

impl std::fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Toolbox({}, programs={:?})",
            self.name,
            self.program_names()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::task::TaskArgs;
    use serde_json::Value;

    fn machine(name: &str, input: Option<&str>, output: &str) -> Program {
        let mut builder = Machine::builder(name, |_args: &TaskArgs| Ok(Value::Null));
        if let Some(input) = input {
            builder = builder.input(input);
        }
        builder.output(output).build().unwrap().into()
    }

    #[test]
    fn test_program_registry() {
        let mut toolbox = Toolbox::new("demo");
        toolbox.add_program("a", machine("a", None, "A")).unwrap();
        toolbox.add_program("b", machine("b", Some("A"), "B")).unwrap();

        assert!(toolbox.contains("a"));
        assert!(toolbox.get("b").is_some());
        assert_eq!(toolbox.program_names(), vec!["a", "b"]);

        // duplicates refused
        assert!(toolbox.add_program("a", machine("a", None, "A")).is_err());

        toolbox.remove_program("a");
        assert!(!toolbox.contains("a"));
    }

    #[test]
    fn test_closure() {
        let mut toolbox = Toolbox::new("demo");
        toolbox.add_program("A", machine("a", None, "A")).unwrap();
        toolbox.add_program("B", machine("b", Some("A"), "B")).unwrap();
        toolbox.add_program("C", machine("c", Some("B"), "C")).unwrap();

        let closure = toolbox.closure("C");
        let names: Vec<&str> = closure.iter().map(Program::name).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
        assert!(names.contains(&"c"));

        let closure = toolbox.closure("B");
        let names: Vec<&str> = closure.iter().map(Program::name).collect();
        assert!(!names.contains(&"c"));
    }
}
