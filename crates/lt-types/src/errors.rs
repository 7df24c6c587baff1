use thiserror::Error;

/// Main error type for the LoraTune system
#[derive(Error, Debug)]
pub enum LtError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Trial log error: {0}")]
    TrialLog(#[from] TrialLogError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Hyperparameter schema and decoding errors
#[derive(Error, Debug, PartialEq)]
pub enum SchemaError {
    #[error("Schema defines no hyperparameters")]
    Empty,

    #[error("Duplicate hyperparameter: {name}")]
    DuplicateParameter { name: String },

    #[error("Invalid bounds for {name}: min {min}, max {max}")]
    InvalidBounds { name: String, min: f64, max: f64 },

    #[error("Vector has {actual} values but the schema defines {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Non-finite value for {name}: {value}")]
    NonFinite { name: String, value: f64 },

    #[error("Missing hyperparameter: {name}")]
    MissingParameter { name: String },

    #[error("Exponential hyperparameter {name} must be positive, got {value}")]
    NonPositiveExponential { name: String, value: f64 },

    #[error("Unknown hyperparameter index: {index}")]
    UnknownIndex { index: usize },
}

/// Trial log errors
#[derive(Error, Debug)]
pub enum TrialLogError {
    #[error("Malformed record at {path}:{line}: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },

    #[error("Trial log not found: {path}")]
    NotFound { path: String },
}

/// Errors raised while training or evaluating a trial
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Failed to launch {stage} command {program}: {message}")]
    LaunchFailed {
        stage: String,
        program: String,
        message: String,
    },

    #[error("{stage} command exited with status {status}")]
    CommandFailed { stage: String, status: String },

    #[error("Empty {stage} command")]
    EmptyCommand { stage: String },

    #[error("Results file missing: {path}")]
    MissingResults { path: String },

    #[error("No score for task {task}")]
    MissingTask { task: String },

    #[error("Invalid score for task {task}: {value}")]
    InvalidScore { task: String, value: f64 },

    #[error("Benchmark {function} needs at least {required} values, got {actual}")]
    TooFewDimensions {
        function: String,
        required: usize,
        actual: usize,
    },
}

/// Search strategy and surrogate errors
#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("Unknown search strategy: {name}")]
    UnknownStrategy { name: String },

    #[error("Surrogate has no observations")]
    NoObservations,

    #[error("Kernel matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Study already finished: {state}")]
    AlreadyFinished { state: String },
}

/// Result type alias for LoraTune operations
pub type LtResult<T> = Result<T, LtError>;

/// Helper trait for converting string errors
pub trait IntoLtError {
    fn into_lt_error(self) -> LtError;
}

impl IntoLtError for String {
    fn into_lt_error(self) -> LtError {
        LtError::Internal(self)
    }
}

impl IntoLtError for &str {
    fn into_lt_error(self) -> LtError {
        LtError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::LtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::LtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::LtError::Config(format!($($arg)*))
    };
}
