//! Error catalog for AutoRoll.
//!
//! Each error class carries a unique code in the ROLL-Exxx format,
//! grouped by subsystem. Codes are stable across releases so operators
//! can grep dashboards and logs for them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering AutoRoll failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Config (E001-E019)
    /// Configuration file not found.
    ConfigNotFound,
    /// Configuration file could not be parsed.
    ConfigParseError,
    /// Configuration contains invalid values.
    ConfigValidationError,
    /// Working directory could not be created or opened.
    ConfigWorkdirError,

    // Review (E100-E129)
    /// Code-review system request failed.
    ReviewRequestFailed,
    /// Change not found at the code-review system.
    ReviewChangeNotFound,
    /// Review system rejected the upload.
    ReviewUploadRejected,
    /// Review system does not support the requested capability.
    ReviewCapabilityUnsupported,

    // Repo (E200-E219)
    /// Repo inspector refresh failed.
    RepoUpdateFailed,
    /// Repo inspector reported inconsistent state.
    RepoPolicyViolation,

    // State machine (E300-E329)
    /// Transition requested between states with no table entry.
    StateUndeclaredTransition,
    /// No-op collapsing exceeded its iteration cap.
    StateCollapseOverrun,
    /// Persisted state label could not be parsed.
    StateParseError,

    // Store (E400-E419)
    /// Record failed validation at the store boundary.
    RecordValidationFailed,
    /// Requested record does not exist.
    RecordNotFound,
    /// Compare-and-swap lost to a concurrent writer.
    RecordConcurrentUpdate,
    /// Counter or record persistence failed.
    TransientIo,

    // Internal (E500-E599)
    /// Unexpected internal error.
    Internal,
}

/// Subsystem that owns an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Review,
    Repo,
    State,
    Store,
    Internal,
}

/// Static catalog entry for an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Stable code string, e.g. `ROLL-E301`.
    pub code: &'static str,
    /// Owning subsystem.
    pub category: ErrorCategory,
    /// Human-readable message template.
    pub message: &'static str,
}

impl ErrorCode {
    /// Catalog entry for this code.
    pub fn entry(self) -> ErrorEntry {
        match self {
            Self::ConfigNotFound => ErrorEntry {
                code: "ROLL-E001",
                category: ErrorCategory::Config,
                message: "configuration file not found",
            },
            Self::ConfigParseError => ErrorEntry {
                code: "ROLL-E002",
                category: ErrorCategory::Config,
                message: "configuration file could not be parsed",
            },
            Self::ConfigValidationError => ErrorEntry {
                code: "ROLL-E003",
                category: ErrorCategory::Config,
                message: "configuration contains invalid values",
            },
            Self::ConfigWorkdirError => ErrorEntry {
                code: "ROLL-E004",
                category: ErrorCategory::Config,
                message: "working directory could not be created or opened",
            },
            Self::ReviewRequestFailed => ErrorEntry {
                code: "ROLL-E100",
                category: ErrorCategory::Review,
                message: "code-review system request failed",
            },
            Self::ReviewChangeNotFound => ErrorEntry {
                code: "ROLL-E101",
                category: ErrorCategory::Review,
                message: "change not found at the code-review system",
            },
            Self::ReviewUploadRejected => ErrorEntry {
                code: "ROLL-E102",
                category: ErrorCategory::Review,
                message: "review system rejected the uploaded roll",
            },
            Self::ReviewCapabilityUnsupported => ErrorEntry {
                code: "ROLL-E103",
                category: ErrorCategory::Review,
                message: "review system does not support the requested capability",
            },
            Self::RepoUpdateFailed => ErrorEntry {
                code: "ROLL-E200",
                category: ErrorCategory::Repo,
                message: "repo inspector refresh failed",
            },
            Self::RepoPolicyViolation => ErrorEntry {
                code: "ROLL-E201",
                category: ErrorCategory::Repo,
                message: "repo inspector reported inconsistent state",
            },
            Self::StateUndeclaredTransition => ErrorEntry {
                code: "ROLL-E300",
                category: ErrorCategory::State,
                message: "state transition has no table entry",
            },
            Self::StateCollapseOverrun => ErrorEntry {
                code: "ROLL-E301",
                category: ErrorCategory::State,
                message: "no-op collapsing exceeded its iteration cap",
            },
            Self::StateParseError => ErrorEntry {
                code: "ROLL-E302",
                category: ErrorCategory::State,
                message: "persisted state label could not be parsed",
            },
            Self::RecordValidationFailed => ErrorEntry {
                code: "ROLL-E400",
                category: ErrorCategory::Store,
                message: "record failed validation",
            },
            Self::RecordNotFound => ErrorEntry {
                code: "ROLL-E401",
                category: ErrorCategory::Store,
                message: "record not found",
            },
            Self::RecordConcurrentUpdate => ErrorEntry {
                code: "ROLL-E402",
                category: ErrorCategory::Store,
                message: "record lost a compare-and-swap race",
            },
            Self::TransientIo => ErrorEntry {
                code: "ROLL-E403",
                category: ErrorCategory::Store,
                message: "persistence or network operation failed",
            },
            Self::Internal => ErrorEntry {
                code: "ROLL-E500",
                category: ErrorCategory::Internal,
                message: "unexpected internal error",
            },
        }
    }

    /// Stable code string, e.g. `ROLL-E301`.
    pub fn code_str(self) -> &'static str {
        self.entry().code
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = self.entry();
        write!(f, "{}: {}", entry.code, entry.message)
    }
}
