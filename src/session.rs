//! Sessions: a toolbox bound to a set of storages.
//!
//! A session owns a dedicated factory wired with the toolbox's handlers,
//! comparators and signature. `run` expands one program into a dependency
//! graph and drains it; `autorun` pulls in the producer programs of
//! whatever the requested program consumes; `replay` re-runs a serialised
//! history. The session also keeps the history of every successful task it
//! has driven, keyed by the output's display form.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use console::style;
use serde_json::Value;
use tracing::info;

use crate::error::EngineError;
use crate::factory::Factory;
use crate::filedb::FileDb;
use crate::graph::{DependencyGraph, RunOptions, Scope};
use crate::machine::{MetaMachine, Program};
use crate::pathexpr::PathScheme;
use crate::storage::{Storage, WriteMode};
use crate::target::Target;
use crate::task::{Status, Task};
use crate::toolbox::Toolbox;

/// Options of one session run.
#[derive(Clone, Default)]
pub struct SessionRun {
    pub mode: Option<WriteMode>,
    pub no_fallback: bool,
    /// Plan only: build tasks without queueing them.
    pub dry: bool,
    /// Block until the factory drains (default).
    pub no_hold: bool,
    /// Include intermediary (temporary) tasks in the result.
    pub show_all: bool,
    pub stop_on_error: bool,
}

pub struct SessionBuilder {
    toolbox: Toolbox,
    name: Option<String>,
    main: Option<Arc<Storage>>,
    temp: Option<Arc<Storage>>,
    dedicated: Vec<(String, Arc<Storage>)>,
    auto_cleanup: bool,
}

impl SessionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn main(mut self, storage: Arc<Storage>) -> Self {
        self.main = Some(storage);
        self
    }

    pub fn temp(mut self, storage: Arc<Storage>) -> Self {
        self.temp = Some(storage);
        self
    }

    /// Dedicated storage for one target name.
    pub fn dedicated(mut self, name: impl Into<String>, storage: Arc<Storage>) -> Self {
        self.dedicated.push((name.into(), storage));
        self
    }

    pub fn auto_cleanup(mut self, auto_cleanup: bool) -> Self {
        self.auto_cleanup = auto_cleanup;
        self
    }

    pub fn build(self) -> Session {
        let mut builder = match self.name {
            Some(name) => Factory::named(name),
            None => Factory::builder(),
        }
        .main(self.main.unwrap_or_else(|| Arc::new(Storage::memory())))
        .temp(
            self.temp
                .unwrap_or_else(|| Arc::new(Storage::memory().with_name("temp"))),
        )
        .auto_cleanup(self.auto_cleanup);

        for (name, storage) in self.dedicated {
            builder = builder.storage(name, storage);
        }

        Session {
            toolbox: self.toolbox,
            factory: builder.register(),
            history: Mutex::new(BTreeMap::new()),
        }
    }
}

pub struct Session {
    toolbox: Toolbox,
    factory: Arc<Factory>,
    /// Serialised chains of successful tasks, by output display form.
    history: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl Session {
    pub fn builder(toolbox: Toolbox) -> SessionBuilder {
        SessionBuilder {
            toolbox,
            name: None,
            main: None,
            temp: None,
            dedicated: Vec::new(),
            auto_cleanup: true,
        }
    }

    /// File-backed session: a working directory, an optional temp
    /// directory, and dedicated per-name directories, all wired with the
    /// toolbox's handlers, comparators and signature.
    pub fn with_dirs(
        toolbox: Toolbox,
        workdir: impl Into<Utf8PathBuf>,
        tempdir: Option<Utf8PathBuf>,
        targetdirs: &[(&str, Utf8PathBuf)],
        locks: &[&str],
    ) -> Result<Session, EngineError> {
        let main = file_storage(&toolbox, workdir.into(), PathScheme::workdir(), false, locks)?;

        let temp = match tempdir {
            Some(path) => Some(file_storage(
                &toolbox,
                path,
                PathScheme::workdir(),
                true,
                &[],
            )?),
            None => None,
        };

        let mut builder = Session::builder(toolbox);
        if let Some(temp) = temp {
            builder = builder.temp(temp);
        }
        for (name, path) in targetdirs {
            let scheme = PathScheme::dedicated(*name)?;
            let storage = file_storage(&builder.toolbox, path.clone(), scheme, false, locks)?;
            builder = builder.dedicated(*name, storage);
        }
        Ok(builder.main(main).build())
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub fn factory(&self) -> &Arc<Factory> {
        &self.factory
    }

    /// Run one program of the toolbox over the given scope.
    pub fn run(
        &self,
        program: &str,
        scope: &Scope,
        options: &SessionRun,
    ) -> Result<Vec<Arc<Task>>, EngineError> {
        let program = self
            .toolbox
            .get(program)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProgram(program.to_string()))?;
        self.run_programs(&[program], scope, options)
    }

    /// Run a program together with every producer program it depends on.
    pub fn autorun(
        &self,
        program: &str,
        scope: &Scope,
        options: &SessionRun,
    ) -> Result<Vec<Arc<Task>>, EngineError> {
        let closure = self.toolbox.closure(program);
        if closure.is_empty() {
            return Err(EngineError::UnknownProgram(program.to_string()));
        }
        let composite = MetaMachine::from_list(format!("autorun({program})"), closure);
        self.run_programs(&[Arc::new(composite).into()], scope, options)
    }

    fn run_programs(
        &self,
        programs: &[Program],
        scope: &Scope,
        options: &SessionRun,
    ) -> Result<Vec<Arc<Task>>, EngineError> {
        self.factory.set_stop_on_error(options.stop_on_error);

        let graph = DependencyGraph::generate(programs, scope)?;
        graph.run(
            &self.factory,
            &RunOptions {
                mode: options.mode,
                no_fallback: options.no_fallback,
                dry: options.dry || self.factory.is_dry(),
                callback: None,
            },
        )?;

        if !options.no_hold {
            self.factory.hold();
            self.record_history(&graph);
            info!(
                "{} {} task(s) done",
                style("session:").green(),
                graph.len()
            );
        }

        Ok(graph
            .tasks()
            .iter()
            .filter(|task| options.show_all || !task.is_temporary())
            .cloned()
            .collect())
    }

    /// Re-run a serialised task chain against this session's storages.
    pub fn replay(
        &self,
        history: &[Value],
        options: &SessionRun,
    ) -> Result<Vec<Arc<Task>>, EngineError> {
        let programs = self.toolbox.programs();
        let graph = DependencyGraph::recall(&programs, history, Value::Null)?;
        graph.run(
            &self.factory,
            &RunOptions {
                mode: options.mode,
                no_fallback: options.no_fallback,
                dry: options.dry || self.factory.is_dry(),
                callback: None,
            },
        )?;

        if !options.no_hold {
            self.factory.hold();
            self.record_history(&graph);
        }

        Ok(graph
            .tasks()
            .iter()
            .filter(|task| options.show_all || !task.is_temporary())
            .cloned()
            .collect())
    }

    fn record_history(&self, graph: &DependencyGraph) {
        let mut history = self.history.lock().unwrap();
        for task in graph.tasks() {
            if task.status() == Status::Success
                && let Some(output) = task.output_target()
            {
                history.insert(output.to_string(), graph.history(task));
            }
        }
    }

    /// Serialised history of a successful output, by its display form.
    pub fn history_of(&self, output: &str) -> Option<Vec<Value>> {
        self.history.lock().unwrap().get(output).cloned()
    }

    pub fn histories(&self) -> BTreeMap<String, Vec<Value>> {
        self.history.lock().unwrap().clone()
    }

    /// Recent tasks, newest first, filtered by status; temporary tasks are
    /// hidden unless `show_all` (tasks in trouble always show).
    pub fn monitor(
        &self,
        count: Option<usize>,
        status: Option<&[Status]>,
        show_all: bool,
    ) -> Vec<Arc<Task>> {
        let tasks = self.factory.tasks();
        let mut remaining = count.unwrap_or(tasks.len());
        let mut selected = Vec::new();

        for task in tasks.iter().rev() {
            if remaining == 0 {
                break;
            }
            let current = task.status();
            if let Some(filter) = status
                && !filter.contains(&current)
            {
                continue;
            }
            let in_trouble = matches!(
                current,
                Status::Error | Status::Rejected | Status::Running
            );
            if status.is_none() && !in_trouble && !show_all && task.is_temporary() {
                continue;
            }
            selected.push(task.clone());
            remaining -= 1;
        }
        selected
    }

    /// Every target persisted across the session's storages.
    pub fn list(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = Vec::new();
        for storage in self.factory.storages() {
            for target in storage.list() {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
        targets.sort();
        targets
    }

    /// Targets by storage name.
    pub fn summary(&self) -> Vec<(String, Vec<Target>)> {
        self.factory
            .storages()
            .iter()
            .map(|storage| {
                let mut targets = storage.list();
                targets.sort();
                (storage.name().to_string(), targets)
            })
            .collect()
    }

    /// Physical locations of the given targets (or everything).
    pub fn locations(&self, targets: Option<&[Target]>) -> Vec<(Target, Option<Utf8PathBuf>)> {
        let all;
        let targets = match targets {
            Some(targets) => targets,
            None => {
                all = self.list();
                &all
            }
        };
        targets
            .iter()
            .map(|target| {
                (
                    target.clone(),
                    self.factory.location(target),
                )
            })
            .collect()
    }

    /// Clear the temporary storages, returning the removed targets.
    pub fn cleanup(&self) -> Result<Vec<Target>, EngineError> {
        let mut removed = Vec::new();
        for storage in self.factory.storages() {
            if storage.temporary() {
                removed.extend(storage.clear()?);
            }
        }
        Ok(removed)
    }

    /// Stop the factory after the current task; returns the tasks still
    /// running.
    pub fn stop(&self, hold: bool) -> Vec<Arc<Task>> {
        self.factory.stop();
        if hold {
            self.factory.hold();
        }
        self.running_tasks()
    }

    /// Drop queued tasks, returning the ones currently running.
    pub fn clear(&self) -> Vec<Arc<Task>> {
        let running = self.running_tasks();
        self.factory.reset_queue();
        running
    }

    pub fn reset(&self) {
        self.factory.reset_queue();
    }

    pub fn hold(&self) {
        self.factory.hold();
    }

    /// Close the session: clear the queue, optionally wait for the running
    /// task, and drop the factory from the registry.
    pub fn close(&self, hold: bool) {
        self.clear();
        if hold {
            self.factory.hold();
        }
        self.factory.unregister();
    }

    fn running_tasks(&self) -> Vec<Arc<Task>> {
        self.factory
            .tasks()
            .into_iter()
            .filter(|task| task.status() == Status::Running)
            .collect()
    }
}

/// Build one file storage wired with the toolbox extras.
fn file_storage(
    toolbox: &Toolbox,
    path: Utf8PathBuf,
    scheme: PathScheme,
    temporary: bool,
    locks: &[&str],
) -> Result<Arc<Storage>, EngineError> {
    let mut db = FileDb::new(path)?.with_scheme(scheme);
    for (key, handler) in toolbox.handlers() {
        db = db.with_handler(key.clone(), handler.clone());
    }
    if let Some(handler) = toolbox.default_handler() {
        db = db.with_default_handler(handler.clone());
    }
    if let Some(signature) = toolbox.signature() {
        db = db.with_signature(signature.clone());
    }

    let mut storage = db.into_storage().with_temporary(temporary);
    for (name, comparator) in toolbox.comparators() {
        storage = storage.with_comparator(name.clone(), comparator.clone());
    }
    for name in locks {
        storage = storage.with_lock(*name);
    }
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::task::TaskArgs;
    use serde_json::json;

    fn toolbox() -> Toolbox {
        let mut toolbox = Toolbox::new("demo");
        let a = Machine::builder("a", |_args: &TaskArgs| Ok(json!("foobar")))
            .output("A")
            .build()
            .unwrap();
        let b = Machine::builder("b", |args: &TaskArgs| {
            let text = args.input("A").and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        })
        .input("A")
        .output("B")
        .build()
        .unwrap();
        toolbox.add_program("A", a).unwrap();
        toolbox.add_program("B", b).unwrap();
        toolbox
    }

    #[test]
    fn test_session_run() {
        let session = Session::builder(toolbox()).build();

        let tasks = session
            .run("A", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status(), Status::Success);

        let tasks = session
            .run("B", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        assert_eq!(tasks[0].status(), Status::Success);
        let output = tasks[0].output_target().unwrap();
        assert_eq!(session.factory().read(output).unwrap(), json!("FOOBAR"));

        assert!(
            session
                .run("missing", &Scope::new(), &SessionRun::default())
                .is_err()
        );
        session.close(true);
    }

    #[test]
    fn test_session_autorun() {
        let session = Session::builder(toolbox()).build();

        // autorun pulls the producer of A in
        let tasks = session
            .autorun("B", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        assert!(tasks.iter().all(|task| task.status() == Status::Success));

        let listed = session.list();
        assert_eq!(listed.len(), 2);
        session.close(true);
    }

    #[test]
    fn test_session_history_and_replay() {
        let session = Session::builder(toolbox()).build();
        session
            .run("A", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        let tasks = session
            .run("B", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        let output = tasks[0].output_target().unwrap().to_string();
        let history = session.history_of(&output).unwrap();
        assert!(!history.is_empty());

        // replay on a fresh session reproduces the final value
        let session2 = Session::builder(toolbox()).build();
        let replayed = session2.replay(&history, &SessionRun::default()).unwrap();
        assert!(replayed.iter().all(|task| task.status().is_terminal()));
        let out = replayed
            .iter()
            .find(|task| task.name() == "b")
            .unwrap()
            .output_target()
            .unwrap()
            .clone();
        assert_eq!(session2.factory().read(&out).unwrap(), json!("FOOBAR"));

        session.close(true);
        session2.close(true);
    }

    #[test]
    fn test_session_monitor() {
        let session = Session::builder(toolbox()).build();
        session
            .run("A", &Scope::new().index("1").index("2"), &SessionRun::default())
            .unwrap();

        let monitored = session.monitor(None, None, true);
        assert_eq!(monitored.len(), 2);

        let successes = session.monitor(None, Some(&[Status::Success]), true);
        assert_eq!(successes.len(), 2);

        let limited = session.monitor(Some(1), None, true);
        assert_eq!(limited.len(), 1);
        session.close(true);
    }

    #[test]
    fn test_session_with_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();

        let session = Session::with_dirs(
            toolbox(),
            root.join("work"),
            Some(root.join("temp")),
            &[],
            &[],
        )
        .unwrap();

        let tasks = session
            .run("A", &Scope::new().index("1"), &SessionRun::default())
            .unwrap();
        assert_eq!(tasks[0].status(), Status::Success);
        assert!(root.join("work").join("1").join("A").exists());

        let locations = session.locations(None);
        assert_eq!(locations.len(), 1);
        assert!(locations[0].1.is_some());
        session.close(true);
    }
}
