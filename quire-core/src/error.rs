//! Error taxonomy shared by every quire component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a failure, used to pick the recovery path and
/// the `code` of wire-level error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Document, version, branch, tag, session or lock absent.
    NotFound,
    /// Duplicate branch/tag or already-initialized document.
    AlreadyExists,
    /// Merge hunk could not be applied. Reported as data, never raised.
    Conflict,
    /// Client base version does not match the session. Recover by resync.
    StaleVersion,
    /// Section lock or document save lock unavailable. Recover by retry.
    LockHeld,
    /// Stored content does not match its recorded hash.
    Corruption,
    /// Request is malformed or not permitted for this caller.
    InvalidInput,
    /// Durable store failure.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StaleVersion => "stale-version",
            ErrorKind::LockHeld => "lock-held",
            ErrorKind::Corruption => "corruption",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::Storage => "storage",
        }
    }

    /// Whether the caller may retry the same request after recovering.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::StaleVersion | ErrorKind::LockHeld)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
