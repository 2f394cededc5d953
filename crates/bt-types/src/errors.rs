use thiserror::Error;

use crate::job::JobStatus;

/// Main error type for the BayesTune system
#[derive(Error, Debug)]
pub enum TuneError {
    #[error("Numerical error: {0}")]
    Numerical(#[from] NumericalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parameter space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

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

/// Failures of the surrogate math. These abort the current iteration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    #[error("Covariance matrix of size {size} is not positive definite after jitter")]
    NotPositiveDefinite { size: usize },

    #[error("Slice sampler bracket expansion exceeded {steps} steps")]
    BracketExpansion { steps: usize },

    #[error("Slice sampler shrank its bracket to zero width")]
    SliceCollapsed,

    #[error("Non-finite value encountered in {what}")]
    NonFinite { what: String },
}

/// Experiment store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {id}")]
    JobNotFound { id: usize },

    #[error("Invalid transition for job {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: usize,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Timed out after {waited_ms} ms waiting for lock {path}")]
    LockTimeout { path: String, waited_ms: u128 },

    #[error("Store file is corrupt: {message}")]
    Corrupt { message: String },

    #[error("Stored parameter space does not match the requested one")]
    SpaceMismatch,

    #[error("Point has dimension {actual}, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Parameter space errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("Duplicate parameter name: {name}")]
    DuplicateName { name: String },

    #[error("Invalid bounds for {name}: min {min} > max {max}")]
    InvalidBounds { name: String, min: f64, max: f64 },

    #[error("Integer parameter {name} spans too many values: [{min}, {max}]")]
    SpanTooWide { name: String, min: i64, max: i64 },

    #[error("Categorical parameter {name} has no options")]
    NoOptions { name: String },

    #[error("Parameter {name} has zero width")]
    ZeroWidth { name: String },

    #[error("Point has {actual} coordinates, space has dimension {expected}")]
    WrongDimension { expected: usize, actual: usize },

    #[error("Coordinate {index} = {value} lies outside the unit interval")]
    OutOfUnitRange { index: usize, value: f64 },

    #[error("Value for {name} does not fit its declaration: {message}")]
    BadValue { name: String, message: String },
}

/// Result type alias for BayesTune operations
pub type TuneResult<T> = Result<T, TuneError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TuneError::Config(format!($($arg)*))
    };
}
