#![deny(
    unsafe_code,
    // clippy::unwrap_used,
    // clippy::expect_used,
    clippy::panic,
)]

//! Content-addressed task orchestration for reproducible, file-backed data
//! pipelines.
//!
//! Declare [`Machine`]s (functions with typed inputs, an optional output
//! and parameters), collect them in a [`Toolbox`], and let a [`Session`]
//! expand them into a [`DependencyGraph`] of [`Task`]s keyed by structured
//! [`Identifier`]s. The [`Factory`] drains the task queue with respect to
//! input readiness; each task reads its inputs from the bound
//! [`Storage`]s, runs the function and persists the result.
//!
//! ```no_run
//! use karakuri::{Machine, Scope, Session, SessionRun, Toolbox};
//! use serde_json::{Value, json};
//!
//! let greet = Machine::builder("greet", |_args| Ok(json!("hello")))
//!     .output("greeting")
//!     .build()?;
//!
//! let shout = Machine::builder("shout", |args: &karakuri::TaskArgs| {
//!     let text = args.input("greeting").and_then(Value::as_str).unwrap_or_default();
//!     Ok(json!(text.to_uppercase()))
//! })
//! .input("greeting")
//! .output("shouted")
//! .build()?;
//!
//! let mut toolbox = Toolbox::new("demo");
//! toolbox.add_program("greeting", greet)?;
//! toolbox.add_program("shouted", shout)?;
//!
//! let session = Session::builder(toolbox).build();
//! let tasks = session.autorun("shouted", &Scope::new().index("1"), &SessionRun::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod factory;
pub mod filedb;
pub mod graph;
pub mod handlers;
pub mod identifier;
pub mod machine;
pub mod parameters;
pub mod pathexpr;
pub mod session;
pub mod signature;
pub mod storage;
pub mod target;
pub mod task;
pub mod toolbox;

pub use camino;
pub use serde_json::Value;

pub use crate::error::{
    EngineError, Expected, GraphError, HandlerError, IdentifierError, MachineError,
    ParameterError, PathError, Reject, StorageError, TargetError,
};
pub use crate::factory::{Factory, FactoryBuilder, TaskQueue, factory_exists, get_factory};
pub use crate::filedb::FileDb;
pub use crate::graph::{DependencyGraph, RunOptions, Scope};
pub use crate::handlers::{
    CborHandler, ChainedHandler, FileHandler, JsonHandler, KeyedHandler, PairHandler,
};
pub use crate::identifier::{Branch, Identifier, Index, ravel_identifiers};
pub use crate::machine::{
    Aggregate, ApplyOptions, Machine, MachineBuilder, MetaMachine, OutputBranches, Program,
    Requires,
};
pub use crate::parameters::{ParamKind, Parameter, VarIo, solve_parameters};
pub use crate::pathexpr::{IdTemplate, PathScheme, ValueRule};
pub use crate::session::{Session, SessionBuilder, SessionRun};
pub use crate::signature::{Signature, SignatureItem};
pub use crate::storage::{Backend, MemoryBackend, Storage, WriteMode};
pub use crate::target::{Target, TargetType};
pub use crate::task::{
    MetaRecord, Slot, Status, Task, TaskArgs, TaskCallback, TaskOptions, TaskSnapshot,
    current_task,
};
pub use crate::toolbox::Toolbox;

/// Install a basic `tracing` subscriber for binaries that do not set up
/// their own.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
