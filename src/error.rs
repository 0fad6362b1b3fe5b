use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a directory watcher backend.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("{what} failed: {source}")]
    Os {
        what: &'static str,
        source: std::io::Error,
    },

    #[error("Path {0} does not exist")]
    MissingPath(PathBuf),

    #[error("Path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Failed to watch {path}: {source}")]
    AddWatch {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Watcher used before init()")]
    NotInitialized,

    #[error("Watcher backend unavailable on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Notify backend error: {0}")]
    Notify(#[from] notify::Error),
}

impl WatcherError {
    pub(crate) fn last_os(what: &'static str) -> Self {
        WatcherError::Os {
            what,
            source: std::io::Error::last_os_error(),
        }
    }
}

/// Errors raised when submitting work to the worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool has been stopped")]
    Stopped,

    #[error("Worker pool needs at least one worker")]
    NoWorkers,

    #[error("Worker {index} failed to initialise: {reason}")]
    WorkerInit { index: usize, reason: String },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Outcome of awaiting a task that did not produce a value.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task was dropped before completing")]
    Cancelled,

    #[error("Timed out waiting for task")]
    Timeout,
}

/// Errors reported by a GPU backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("Failed to parse {name}: {message}")]
    Parse { name: String, message: String },

    #[error("Validation of {name} failed: {message}")]
    Validation { name: String, message: String },

    #[error("SPIR-V generation for {name} failed: {message}")]
    Codegen { name: String, message: String },

    #[error("Program {name} could not be linked: {message}")]
    Link { name: String, message: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Range {offset}..{end} is outside the {len} byte allocation")]
    OutOfBounds { offset: usize, end: usize, len: usize },

    #[error("Execution context unavailable: {0}")]
    Context(String),

    #[error("Cannot view slot bytes as {type_name}: {reason}")]
    SlotView {
        type_name: &'static str,
        reason: String,
    },
}

/// Top level error for building and driving a [`crate::Sandbox`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Make sure there is a valid {0} in the watched folder")]
    MissingMainShader(String),

    #[error("Failed to spawn watcher thread: {0}")]
    Thread(std::io::Error),
}
