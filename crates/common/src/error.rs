use thiserror::Error;

/// Canonical SFQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SfqError::InvalidPlan`]: ill-typed or ill-arity plan construction, caught
///   by the planner-node factories before execution
/// - [`SfqError::TypeMismatch`]: a cell of the wrong variant reached a typed
///   column or operator at runtime
/// - [`SfqError::Io`]: raw filesystem failures from std APIs
/// - [`SfqError::Storage`]: column/frame/archive format violations
/// - [`SfqError::Unreachable`]: the lambda worker (or another out-of-process
///   peer) stopped answering
/// - [`SfqError::Cancelled`]: the process-wide cancel flag tripped; unwinds
///   cleanly and produces no output
/// - [`SfqError::Internal`]: an engine invariant was violated (a bug)
#[derive(Debug, Error)]
pub enum SfqError {
    /// Plan construction failures.
    ///
    /// Examples:
    /// - wrong input arity for an operator kind
    /// - appending columns of differing types
    /// - projection index out of range
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Runtime cell-type coercion failures.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-format failures that are not raw IO: corrupt index files,
    /// truncated segments, codec errors.
    #[error("storage error: {0}")]
    Storage(String),

    /// The lambda worker or another out-of-process peer died.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The query was cancelled via the runtime cancel flag.
    #[error("query cancelled")]
    Cancelled,

    /// An engine invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

// Execution nodes latch the first failure and re-surface it to every
// consumer, so the error must be cloneable. `std::io::Error` is not; it is
// demoted to a `Storage` message on clone.
impl Clone for SfqError {
    fn clone(&self) -> Self {
        match self {
            SfqError::InvalidPlan(s) => SfqError::InvalidPlan(s.clone()),
            SfqError::TypeMismatch(s) => SfqError::TypeMismatch(s.clone()),
            SfqError::Io(e) => SfqError::Storage(format!("io error: {e}")),
            SfqError::Storage(s) => SfqError::Storage(s.clone()),
            SfqError::Unreachable(s) => SfqError::Unreachable(s.clone()),
            SfqError::Cancelled => SfqError::Cancelled,
            SfqError::Internal(s) => SfqError::Internal(s.clone()),
        }
    }
}

/// Standard SFQ result alias.
pub type Result<T> = std::result::Result<T, SfqError>;
