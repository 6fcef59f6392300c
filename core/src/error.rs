use crate::framework::FrameworkState;

/// Errors surfaced by the framework, its scheduler and the plugin bridge
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RsisError {
    #[error("framework is not initialized")]
    NotAlive,

    // --- libraries ---
    #[error("library '{0}' is already loaded")]
    DuplicateLibrary(String),

    #[error("library '{0}' is not loaded")]
    UnknownLibrary(String),

    #[error("failed to open library '{name}': {reason}")]
    LibraryOpen { name: String, reason: String },

    #[error("library '{library}' is missing symbol {symbol}")]
    MissingSymbol { library: String, symbol: String },

    #[error("ABI version mismatch for '{library}': plugin has {found}, expected {expected}")]
    AbiMismatch {
        library: String,
        found: u32,
        expected: u32,
    },

    #[error("library '{0}' has been unloaded")]
    LibraryUnloaded(String),

    #[error("library '{library}' still has {instances} live model instance(s)")]
    LibraryInUse { library: String, instances: usize },

    // --- models ---
    #[error("model type '{0}' is not registered")]
    UnknownModelType(String),

    #[error("model type '{model_type}' is already provided by library '{library}'")]
    DuplicateModelType { model_type: String, library: String },

    #[error("library '{library}' does not provide model type '{model_type}'")]
    ModelTypeNotInLibrary { library: String, model_type: String },

    #[error("model '{0}' already exists")]
    DuplicateModel(String),

    #[error("model '{0}' does not exist")]
    UnknownModel(String),

    #[error("model '{0}' was destroyed")]
    ModelDestroyed(String),

    #[error("factory for '{0}' returned null")]
    NullModel(String),

    #[error("model '{model}' has no field '{field}'")]
    UnknownField { model: String, field: String },

    #[error("size mismatch on '{field}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid value for '{field}' of model '{model}'")]
    InvalidValue { model: String, field: String },

    #[error("model '{model}' failed in {op}")]
    ModelFailure { model: String, op: &'static str },

    // --- scheduling ---
    #[error("callback '{name}' at {callback} Hz is faster than its thread at {thread} Hz")]
    CallbackTooFast {
        name: String,
        callback: f64,
        thread: f64,
    },

    #[error("invalid frequency {0}")]
    InvalidFrequency(f64),

    #[error("{fast} Hz is not an integer multiple of {slow} Hz")]
    NonIntegerRate { fast: f64, slow: f64 },

    #[error("frame offset {offset} must be below the divisor {divisor}")]
    FrameOffset { offset: u64, divisor: u64 },

    #[error("invalid epoch duration {0}")]
    InvalidEpochDuration(f64),

    #[error("thread {0} does not exist")]
    UnknownThread(usize),

    // --- framework ---
    #[error("cannot {command} while in state {state:?}")]
    InvalidTransition {
        command: &'static str,
        state: FrameworkState,
    },

    #[error("timed out waiting for the runner")]
    HandshakeTimeout,

    #[error("runner thread is gone")]
    RunnerGone,

    #[error("{0}")]
    Command(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, RsisError>;
