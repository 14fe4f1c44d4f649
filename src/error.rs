use camino::Utf8PathBuf;
use thiserror::Error;

/// Sentinel error for rejecting a task from inside a machine function.
///
/// Return it through `anyhow` (`Err(Reject::new("..").into())`); the engine
/// downcasts it and marks the task `Rejected` instead of `Error`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Reject(pub String);

impl Reject {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Sentinel error for a clean, expected failure of a machine function.
///
/// The task ends in `Error` state with the message alone, no captured chain.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Expected(pub String);

impl Expected {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("Invalid identifier atom: '{0}'")]
    InvalidAtom(String),

    #[error("Incompatible numbers of indices and branches")]
    Ravel,
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("Invalid target name: '{0}'")]
    Name(String),

    #[error("Invalid destination for i/o slot: '{0}'")]
    Dest(String),

    #[error("Cannot generate a target from a virtual i/o slot")]
    Virtual,

    #[error("Key '{0}' already in attachment with a different value")]
    AttachmentKey(String),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

#[derive(Debug, Error)]
pub enum PathError {
    #[error("Missing field {0} in layout template")]
    MissingField(&'static str),

    #[error("Missing placeholder in template: {0}")]
    MissingPlaceholder(String),

    #[error("Cannot have multiple generative groups in template: {0}")]
    MultipleGroups(String),

    #[error("Invalid template: {0}")]
    Template(String),

    #[error("Unauthorized target name: {0}")]
    Name(String),

    #[error("Unauthorized branch: {0}")]
    Branch(String),

    #[error("Invalid identifier length: {got} != {expected}")]
    Arity { expected: usize, got: usize },

    #[error("Invalid identifier <{name}>: {reason}")]
    Value { name: String, reason: String },

    #[error("Cannot parse path: {0}")]
    Parse(String),

    #[error("Path does not round-trip: {0}")]
    RoundTrip(String),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Failed to read file `{0}`: {1}")]
    FileRead(Utf8PathBuf, std::io::Error),

    #[error("Failed to write file `{0}`: {1}")]
    FileWrite(Utf8PathBuf, std::io::Error),

    #[error("Failed to decode `{0}`: {1}")]
    Decode(Utf8PathBuf, String),

    #[error("Failed to encode value for `{0}`: {1}")]
    Encode(Utf8PathBuf, String),

    #[error("Handler for key '{0}' expects an object value")]
    NotAnObject(String),

    #[error("Chained handlers expect object values")]
    ChainValue,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Target {0} already exists")]
    AlreadyExists(String),

    #[error("Target {0} does not exist")]
    DoesNotExist(String),

    #[error("Targets '{0}' are locked")]
    Locked(String),

    #[error("Invalid target {target}: {source}")]
    InvalidTarget { target: String, source: PathError },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("I/O error at `{path}`: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("Missing required parameter: \"{0}\"")]
    Missing(String),

    #[error("Parameter `{0}` cannot be null")]
    Null(String),

    #[error("Expected {expected} values for parameter `{name}`, got {got}")]
    Arity {
        name: String,
        expected: i64,
        got: usize,
    },

    #[error("Invalid value for parameter `{name}`: {value}")]
    Invalid { name: String, value: String },

    #[error("Value {value} is not among the choices for parameter `{name}`")]
    Choice { name: String, value: String },

    #[error("Path does not exist: {0}")]
    PathMissing(String),

    #[error("Task {task}: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<ParameterError>,
    },
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Multiple outputs are not authorized")]
    MultipleOutputs,

    #[error("Output `{0}` already set, alternative outputs are not authorized")]
    DuplicateOutput(String),

    #[error("Parameter `{0}` already set")]
    DuplicateParameter(String),

    #[error("Overlapping parameter and i/o names: {0}")]
    Overlap(String),

    #[error("Group `{group}` refers to unknown input `{input}`")]
    UnknownGroupInput { group: String, input: String },

    #[error("Incompatible numbers of input and output identifiers")]
    IdentifierCount,

    #[error("Missing identifiers in id-wise parameters")]
    MissingDispatch,

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cycle detected in machine graph")]
    Cycle,

    #[error("Unknown program: {0}")]
    UnknownProgram(String),

    #[error("Some output targets are locked")]
    LockedOutputs,

    #[error("Could not solve metamachine '{name}': {source}")]
    Solve {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid history record: {0}")]
    History(String),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Umbrella error for the high-level session API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("Unknown program: {0}")]
    UnknownProgram(String),

    #[error("Toolbox error: {0}")]
    Toolbox(String),
}
