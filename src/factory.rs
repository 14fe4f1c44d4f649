//! The factory: storage bindings plus the task scheduler.
//!
//! Factories are a process-local registry keyed by name; looking up an
//! existing name returns the existing factory, storage options untouched.
//! Each factory owns a sorted task queue and a single worker thread. The
//! worker drains the queue in `(index, branch)` order (index-empty-last,
//! branch-empty-first, mirroring target ordering so producers run before
//! their consumers), collects tasks that pend, re-enqueues them, and keeps
//! iterating as long as some task succeeded. When a pass makes no progress
//! the set of available inputs cannot have changed, so the worker exits.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use indicatif::ProgressStyle;
use serde_json::Value;
use tracing::{Level, debug, info, span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::StorageError;
use crate::identifier::Branch;
use crate::storage::{Storage, WriteMode};
use crate::target::Target;
use crate::task::{Status, Task};

static FACTORIES: LazyLock<Mutex<HashMap<String, Arc<Factory>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Most recent tasks kept for monitoring.
const MAX_TASKLIST_LENGTH: usize = 1000;

/// Factory-level callback, invoked with the finished tasks when the worker
/// exits.
pub type FactoryCallback = Arc<dyn Fn(&[Arc<Task>]) + Send + Sync>;

/// Thread-safe task queue, kept sorted by `(index, branch)`; duplicate
/// tasks (by identity) are refused.
pub struct TaskQueue {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Pop the smallest task, or `None` when empty.
    pub fn get(&self) -> Option<Arc<Task>> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.is_empty() {
            return None;
        }
        Some(tasks.remove(0))
    }

    /// Insert in sorted position; `false` when the task is already queued.
    pub fn put(&self, task: Arc<Task>) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.iter().any(|queued| queued.uuid() == task.uuid()) {
            return false;
        }
        let key = task.sort_key();
        let position = tasks.partition_point(|queued| queued.sort_key() <= key);
        tasks.insert(position, task);
        true
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FactoryBuilder {
    name: Option<String>,
    main: Option<Arc<Storage>>,
    temp: Option<Arc<Storage>>,
    named: HashMap<String, Arc<Storage>>,
    branch_scoped: HashMap<(String, String), Arc<Storage>>,
    callback: Option<FactoryCallback>,
    nosession: bool,
    auto_cleanup: bool,
    stop_on_error: bool,
    dry: bool,
}

impl FactoryBuilder {
    /// Main storage; defaults to an in-memory one.
    pub fn main(mut self, storage: Arc<Storage>) -> Self {
        self.main = Some(storage);
        self
    }

    /// Storage receiving targets flagged temporary.
    pub fn temp(mut self, storage: Arc<Storage>) -> Self {
        self.temp = Some(storage);
        self
    }

    /// Dedicated storage for one target name.
    pub fn storage(mut self, name: impl Into<String>, storage: Arc<Storage>) -> Self {
        self.named.insert(name.into(), storage);
        self
    }

    /// Dedicated storage for one `(name, branch)` pair.
    pub fn branch_storage(
        mut self,
        name: impl Into<String>,
        branch: &Branch,
        storage: Arc<Storage>,
    ) -> Self {
        self.branch_scoped
            .insert((name.into(), branch.to_string()), storage);
        self
    }

    pub fn callback(mut self, callback: impl Fn(&[Arc<Task>]) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Clear pending tasks whenever the worker exits.
    pub fn nosession(mut self, nosession: bool) -> Self {
        self.nosession = nosession;
        self
    }

    pub fn auto_cleanup(mut self, auto_cleanup: bool) -> Self {
        self.auto_cleanup = auto_cleanup;
        self
    }

    pub fn stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.stop_on_error = stop_on_error;
        self
    }

    /// Dry factories accept tasks and never run them.
    pub fn dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    /// Register the factory, or return the existing one with this name.
    pub fn register(self) -> Arc<Factory> {
        let name = self
            .name
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut factories = FACTORIES.lock().unwrap();
        if let Some(existing) = factories.get(&name) {
            return existing.clone();
        }

        info!("create factory: '{name}'");
        let factory = Arc::new(Factory {
            name: name.clone(),
            main: self.main.unwrap_or_else(|| Arc::new(Storage::memory())),
            temp: self.temp,
            named: self.named,
            branch_scoped: self.branch_scoped,
            queue: TaskQueue::new(),
            tasklist: Mutex::new(VecDeque::with_capacity(MAX_TASKLIST_LENGTH)),
            callback: self.callback,
            nosession: self.nosession,
            auto_cleanup: self.auto_cleanup,
            stop_on_error: AtomicBool::new(self.stop_on_error),
            stop_flag: AtomicBool::new(false),
            worker: Mutex::new(None),
            lock: Mutex::new(()),
            dry: self.dry,
        });
        factories.insert(name, factory.clone());
        factory
    }
}

pub struct Factory {
    name: String,
    main: Arc<Storage>,
    temp: Option<Arc<Storage>>,
    named: HashMap<String, Arc<Storage>>,
    branch_scoped: HashMap<(String, String), Arc<Storage>>,
    queue: TaskQueue,
    tasklist: Mutex<VecDeque<Arc<Task>>>,
    callback: Option<FactoryCallback>,
    nosession: bool,
    auto_cleanup: bool,
    stop_on_error: AtomicBool,
    stop_flag: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Guards the hand-over between a queue drain and pending re-entry.
    lock: Mutex<()>,
    dry: bool,
}

impl Factory {
    pub fn builder() -> FactoryBuilder {
        FactoryBuilder {
            name: None,
            main: None,
            temp: None,
            named: HashMap::new(),
            branch_scoped: HashMap::new(),
            callback: None,
            nosession: false,
            auto_cleanup: true,
            stop_on_error: false,
            dry: false,
        }
    }

    pub fn named(name: impl Into<String>) -> FactoryBuilder {
        let mut builder = Self::builder();
        builder.name = Some(name.into());
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_dry(&self) -> bool {
        self.dry
    }

    pub fn set_stop_on_error(&self, stop: bool) {
        self.stop_on_error.store(stop, Ordering::SeqCst);
    }

    /// Most recent tasks, oldest first.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasklist.lock().unwrap().iter().cloned().collect()
    }

    /// Every distinct storage bound to this factory.
    pub fn storages(&self) -> Vec<Arc<Storage>> {
        let mut storages: Vec<Arc<Storage>> = Vec::new();
        let mut push = |storage: &Arc<Storage>| {
            if !storages.iter().any(|s| Arc::ptr_eq(s, storage)) {
                storages.push(storage.clone());
            }
        };
        push(&self.main);
        if let Some(temp) = &self.temp {
            push(temp);
        }
        for storage in self.named.values() {
            push(storage);
        }
        for storage in self.branch_scoped.values() {
            push(storage);
        }
        storages
    }

    /// Storage routing: `(name, branch)` binding, then name binding, then
    /// the temp storage for temporary targets, then main.
    pub fn get_storage(&self, target: &Target) -> Arc<Storage> {
        let key = (target.name().to_string(), target.branch().to_string());
        if let Some(storage) = self.branch_scoped.get(&key) {
            return storage.clone();
        }
        if let Some(storage) = self.named.get(target.name()) {
            return storage.clone();
        }
        if let Some(temp) = &self.temp
            && target.is_temp()
        {
            return temp.clone();
        }
        self.main.clone()
    }

    pub fn exists(&self, target: &Target) -> bool {
        self.get_storage(target).exists(target)
    }

    pub fn read(&self, target: &Target) -> Result<Value, StorageError> {
        self.get_storage(target).read(target)
    }

    pub fn write(
        &self,
        target: &Target,
        data: &Value,
        mode: Option<WriteMode>,
    ) -> Result<(), StorageError> {
        self.get_storage(target).write(target, data, mode)
    }

    pub fn remove(&self, target: &Target) -> Result<(), StorageError> {
        self.get_storage(target).remove(target)
    }

    pub fn location(&self, target: &Target) -> Option<Utf8PathBuf> {
        self.get_storage(target).location(target)
    }

    /// Verify the target can be represented by its storage.
    pub fn check(&self, target: &Target) -> Result<(), StorageError> {
        self.get_storage(target).check(target)
    }

    /// Queue a task and make sure the worker is serving. Duplicate tasks
    /// are silently ignored.
    pub fn add_task(self: &Arc<Self>, task: Arc<Task>) -> Result<(), StorageError> {
        info!("adding task to queue: {task}");
        if let Some(output) = task.output_target() {
            self.check(output)?;
        }

        let added = {
            let _guard = self.lock.lock().unwrap();
            self.queue.put(task.clone())
        };
        if added {
            let mut tasklist = self.tasklist.lock().unwrap();
            if tasklist.len() == MAX_TASKLIST_LENGTH {
                tasklist.pop_front();
            }
            tasklist.push_back(task);
        }

        self.serve();
        Ok(())
    }

    /// Request termination after the current task.
    pub fn stop(&self) {
        info!(
            "force stopping factory: {} ({} pending)",
            self.name,
            self.queue.len()
        );
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// True while the worker thread is draining tasks.
    pub fn serving(&self) -> bool {
        self.worker
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Spawn the worker if it is not already running.
    pub fn serve(self: &Arc<Self>) {
        if self.dry {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);

        let mut worker = self.worker.lock().unwrap();
        if worker.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }

        info!(
            "start factory: {} ({} pending)",
            self.name,
            self.queue.len()
        );
        let factory = self.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name(format!("factory-{}", self.name))
                .spawn(move || factory.work())
                .expect("spawn factory worker"),
        );
    }

    /// Block until the worker exits.
    pub fn hold(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            debug!("holding factory: {}", self.name);
            let _ = worker.join();
        }
    }

    /// Drop every queued task.
    pub fn reset_queue(&self) {
        self.queue.clear();
    }

    /// Remove the factory from the registry.
    pub fn unregister(&self) {
        FACTORIES.lock().unwrap().remove(&self.name);
    }

    /// The worker loop: drain, collect pendings, re-enqueue, continue while
    /// progress is made.
    fn work(self: Arc<Self>) {
        let mut summary: Vec<Arc<Task>> = Vec::new();

        let root_span = span!(Level::INFO, "factory_tasks");
        root_span.pb_set_style(
            &ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] {pos} task(s) {msg}")
                .expect("progress template"),
        );
        root_span.pb_set_message("running tasks...");
        let _enter = root_span.enter();

        loop {
            let mut pending: Vec<Arc<Task>> = Vec::new();
            let mut updated = false;

            while let Some(task) = self.queue.get() {
                let status = task.safe_run(&self);

                if self.stop_on_error.load(Ordering::SeqCst) && status == Status::Error {
                    self.stop();
                }

                updated = updated || status == Status::Success;
                if status == Status::Pending {
                    pending.push(task);
                } else {
                    summary.push(task);
                    root_span.pb_inc(1);
                }

                if self.stopping() {
                    break;
                }
            }

            let guard = self.lock.lock().unwrap();
            let pending_count = pending.len();
            for task in pending {
                self.queue.put(task);
            }

            if !self.stopping() {
                if updated {
                    continue;
                }
                if self.queue.len() > pending_count {
                    // new tasks arrived during the drain
                    continue;
                }
            }

            if pending_count == 0 {
                info!("stopping factory: {} (empty queue)", self.name);
            } else {
                info!(
                    "stopping factory: {} ({pending_count} tasks pending)",
                    self.name
                );
            }
            drop(guard);

            self.finish(&summary);
            return;
        }
    }

    /// Exit path of the worker: factory callback, optional queue reset,
    /// temp-storage cleanup.
    fn finish(&self, summary: &[Arc<Task>]) {
        debug!("running callback for factory: {}", self.name);
        if let Some(callback) = &self.callback {
            callback(summary);
        }

        if self.nosession {
            info!("remove {} pending tasks", self.queue.len());
            self.reset_queue();
        }

        if self.auto_cleanup {
            for storage in self.storages() {
                storage.cleanup(summary);
            }
        }
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factory({})", self.name)
    }
}

pub fn factory_exists(name: &str) -> bool {
    FACTORIES.lock().unwrap().contains_key(name)
}

pub fn get_factory(name: &str) -> Option<Arc<Factory>> {
    FACTORIES.lock().unwrap().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{Identifier, Index};
    use crate::machine::Machine;
    use crate::task::TaskOptions;
    use serde_json::json;

    fn simple_task(name: &str, index: &str) -> Arc<Task> {
        let machine = Machine::builder(name, |_args| Ok(json!("ok")))
            .output("A")
            .build()
            .unwrap();
        let id = Identifier::new(Index::atom(index).unwrap(), Branch::empty());
        Task::new(machine, vec![id.clone()], id, TaskOptions::default()).unwrap()
    }

    #[test]
    fn test_queue_ordering() {
        let queue = TaskQueue::new();
        let t2 = simple_task("m", "2");
        let t1 = simple_task("m", "1");
        let t3 = simple_task("m", "3");
        assert!(queue.put(t2.clone()));
        assert!(queue.put(t1.clone()));
        assert!(queue.put(t3.clone()));

        assert_eq!(queue.get().unwrap().uuid(), t1.uuid());
        assert_eq!(queue.get().unwrap().uuid(), t2.uuid());
        assert_eq!(queue.get().unwrap().uuid(), t3.uuid());
        assert!(queue.get().is_none());
    }

    #[test]
    fn test_queue_null_index_last() {
        let queue = TaskQueue::new();
        let agg = {
            let machine = Machine::builder("agg", |_args| Ok(json!(1)))
                .output("Z")
                .build()
                .unwrap();
            Task::new(
                machine,
                vec![Identifier::none()],
                Identifier::none(),
                TaskOptions::default(),
            )
            .unwrap()
        };
        let plain = simple_task("m", "1");
        queue.put(agg.clone());
        queue.put(plain.clone());

        // the null-index task drains after the indexed one
        assert_eq!(queue.get().unwrap().uuid(), plain.uuid());
        assert_eq!(queue.get().unwrap().uuid(), agg.uuid());
    }

    #[test]
    fn test_queue_duplicates() {
        let queue = TaskQueue::new();
        let task = simple_task("m", "1");
        assert!(queue.put(task.clone()));
        assert!(!queue.put(task.clone()));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_registry() {
        let factory = Factory::named("registry-test").register();
        assert!(factory_exists("registry-test"));

        // same name returns the same factory
        let again = Factory::named("registry-test").register();
        assert!(Arc::ptr_eq(&factory, &again));

        factory.unregister();
        assert!(!factory_exists("registry-test"));
    }

    #[test]
    fn test_storage_routing() {
        let dedicated = Arc::new(Storage::memory().with_name("dedicated"));
        let temp = Arc::new(Storage::memory().with_name("temp").with_temporary(true));
        let factory = Factory::builder()
            .storage("B", dedicated.clone())
            .temp(temp.clone())
            .register();

        let plain = Target::new("A", Index::atom("1").unwrap(), Branch::empty()).unwrap();
        let routed = Target::new("B", Index::atom("1").unwrap(), Branch::empty()).unwrap();
        let mut temporary = Target::new("C", Index::atom("1").unwrap(), Branch::empty()).unwrap();
        temporary.set_temp(true);

        assert_eq!(factory.get_storage(&plain).name(), factory.main.name());
        assert_eq!(factory.get_storage(&routed).name(), "dedicated");
        assert_eq!(factory.get_storage(&temporary).name(), "temp");
        factory.unregister();
    }

    #[test]
    fn test_run_simple_task() {
        let factory = Factory::builder().register();
        let task = simple_task("m", "1");
        factory.add_task(task.clone()).unwrap();
        factory.hold();

        assert_eq!(task.status(), Status::Success);
        let output = task.output_target().unwrap();
        assert_eq!(factory.read(output).unwrap(), json!("ok"));
        factory.unregister();
    }

    #[test]
    fn test_dry_factory() {
        let factory = Factory::builder().dry(true).register();
        let task = simple_task("m", "1");
        factory.add_task(task.clone()).unwrap();
        factory.hold();

        assert_eq!(task.status(), Status::New);
        assert_eq!(factory.queue_size(), 1);
        factory.unregister();
    }

    #[test]
    fn test_temp_cleanup() {
        use crate::target::TargetType;

        let temp = Arc::new(Storage::memory().with_name("temp").with_temporary(true));
        let factory = Factory::builder().temp(temp.clone()).register();

        let slot = TargetType::new("A").unwrap().with_temp(true);
        let id = |index: &str| Identifier::new(Index::atom(index).unwrap(), Branch::empty());
        let a1 = slot.target(Index::atom("1").unwrap(), Branch::empty()).unwrap();
        let a2 = slot.target(Index::atom("2").unwrap(), Branch::empty()).unwrap();
        factory.write(&a1, &json!("v"), None).unwrap();
        factory.write(&a2, &json!("v"), None).unwrap();

        // a successful consumer frees its temporary input
        let ok = Machine::builder("ok", |_args| Ok(json!(1)))
            .input_slot("A", vec![slot.clone()])
            .output("B")
            .build()
            .unwrap();
        let task = Task::new(ok, vec![id("1")], id("1"), TaskOptions::default()).unwrap();
        factory.add_task(task).unwrap();
        factory.hold();
        assert!(!temp.exists(&a1));

        // a failing consumer keeps it for inspection
        let bad = Machine::builder("bad", |_args| Err(anyhow::anyhow!("boom")))
            .input_slot("A", vec![slot.clone()])
            .output("C")
            .build()
            .unwrap();
        let task = Task::new(bad, vec![id("2")], id("2"), TaskOptions::default()).unwrap();
        factory.add_task(task).unwrap();
        factory.hold();
        assert!(temp.exists(&a2));
        factory.unregister();
    }

    #[test]
    fn test_stop_flag() {
        let factory = Factory::builder().register();
        factory.stop();
        assert!(factory.stopping());
        // serve resets the flag
        factory.serve();
        assert!(!factory.stopping());
        factory.hold();
        factory.unregister();
    }
}
