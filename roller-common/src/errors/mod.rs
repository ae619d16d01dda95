//! Error taxonomy for the AutoRoll core.
//!
//! Library errors are typed (`RollerError`) so callers can distinguish
//! absence, lost CAS races, and transient I/O from real failures. The
//! compact code catalog in [`catalog`] assigns each class a stable code
//! used in logs and the status surface.
//!
//! | Range      | Category | Description                         |
//! |------------|----------|-------------------------------------|
//! | E001-E019  | Config   | Configuration and setup errors      |
//! | E100-E129  | Review   | Code-review-system errors           |
//! | E200-E219  | Repo     | Repo inspector errors               |
//! | E300-E329  | State    | State machine errors                |
//! | E400-E419  | Store    | Record store and counter errors     |
//! | E500-E599  | Internal | Internal/unexpected errors          |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use thiserror::Error;

/// The error type shared by all AutoRoll subsystems.
#[derive(Debug, Error)]
pub enum RollerError {
    /// A record violated its invariants; rejected at the API boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested record does not exist. Callers may treat absence as a
    /// normal outcome.
    #[error("{resource} {id} not found")]
    NotFound {
        resource: &'static str,
        id: String,
    },

    /// Compare-and-swap failure; the stored record advanced underneath the
    /// caller. Retryable with a fresh read.
    #[error("concurrent update of {resource} {id}")]
    ConcurrentUpdate {
        resource: &'static str,
        id: String,
    },

    /// Network or filesystem failure. The failing tick is abandoned and
    /// re-attempted; FSM state is not advanced.
    #[error("transient failure: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Inconsistency reported by an external collaborator.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// An undeclared state transition or equivalent internal bug.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RollerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn concurrent_update(resource: &'static str, id: impl Into<String>) -> Self {
        Self::ConcurrentUpdate {
            resource,
            id: id.into(),
        }
    }

    pub fn transient(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transient(Box::new(err))
    }

    pub fn transient_msg(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into().into())
    }

    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a retry of the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ConcurrentUpdate { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Catalog code for this error class.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::RecordValidationFailed,
            Self::NotFound { .. } => ErrorCode::RecordNotFound,
            Self::ConcurrentUpdate { .. } => ErrorCode::RecordConcurrentUpdate,
            Self::Transient(_) => ErrorCode::TransientIo,
            Self::PolicyViolation(_) => ErrorCode::RepoPolicyViolation,
            Self::Fatal(_) => ErrorCode::Internal,
        }
    }
}

impl From<std::io::Error> for RollerError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err)
    }
}

impl From<serde_json::Error> for RollerError {
    fn from(err: serde_json::Error) -> Self {
        Self::transient(err)
    }
}

impl From<reqwest::Error> for RollerError {
    fn from(err: reqwest::Error) -> Self {
        Self::transient(err)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RollerError>;
