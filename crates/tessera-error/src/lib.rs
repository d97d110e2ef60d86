//! Error taxonomy for the tessera transaction manager.
//!
//! Every fault inside a transaction is reported as a [`TxError`]: a tagged
//! status, a non-recoverable flag, and an optional description. The engine's
//! recovery dispatcher inspects the status to decide between a silent retry,
//! an escalation to irrevocable mode, and surfacing the error to the user.

use std::fmt;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TxError>;

// ---------------------------------------------------------------------------
// Lock token
// ---------------------------------------------------------------------------

/// Opaque identity of a contended lock.
///
/// Conflict errors carry a back-reference to the lock that caused them so
/// that contention-management policies can key on it. The token is the
/// lock's address; it must never be dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(usize);

impl LockToken {
    /// Build a token from a lock's address.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// The raw address this token was built from.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Internal error codes
// ---------------------------------------------------------------------------

/// Enumerated internal failures that are not errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Catch-all for violated internal expectations.
    GeneralError,
    /// An address or index fell outside its valid range.
    OutOfBounds,
    /// An allocation failed inside the runtime.
    OutOfMemory,
    /// The floating-point environment was in an unsupported state.
    InvalidFenv,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GeneralError => "general error",
            Self::OutOfBounds => "out of bounds",
            Self::OutOfMemory => "out of memory",
            Self::InvalidFenv => "invalid floating-point environment",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Discriminated error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// A concurrent transaction holds an incompatible lock.
    Conflicting(Option<LockToken>),
    /// The attempted operation requires irrevocable mode; the transaction
    /// should restart with exclusive access.
    Revocable,
    /// An internal enumerated error.
    Code(ErrorCode),
    /// A libc-like operation failed with a POSIX errno value.
    Errno(i32),
    /// A platform-specific kernel error value.
    KernReturn(i32),
    /// A signal was delivered to the transaction's thread. Carries the
    /// signal number.
    Signal(i32),
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflicting(_) => write!(f, "conflict with concurrent transaction"),
            Self::Revocable => write!(f, "operation requires irrevocable execution"),
            Self::Code(code) => write!(f, "{code}"),
            Self::Errno(errno) => write!(f, "errno {errno}"),
            Self::KernReturn(v) => write!(f, "kernel error {v}"),
            Self::Signal(signo) => write!(f, "signal {signo}"),
        }
    }
}

// ---------------------------------------------------------------------------
// TxError
// ---------------------------------------------------------------------------

/// A fault reported from inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{}", self.render())]
pub struct TxError {
    status: ErrorStatus,
    non_recoverable: bool,
    description: Option<&'static str>,
}

impl TxError {
    fn render(&self) -> String {
        match self.description {
            Some(description) => format!("{}: {description}", self.status),
            None => self.status.to_string(),
        }
    }

    /// A conflict on `lock` (or an anonymous conflict when `None`).
    #[must_use]
    pub const fn conflicting(lock: Option<LockToken>) -> Self {
        Self {
            status: ErrorStatus::Conflicting(lock),
            non_recoverable: false,
            description: None,
        }
    }

    /// Request a restart in irrevocable mode.
    #[must_use]
    pub const fn revocable() -> Self {
        Self {
            status: ErrorStatus::Revocable,
            non_recoverable: false,
            description: None,
        }
    }

    /// An internal enumerated error. Internal errors default to
    /// non-recoverable; they signal broken invariants, not environment
    /// conditions.
    #[must_use]
    pub const fn code(code: ErrorCode) -> Self {
        Self {
            status: ErrorStatus::Code(code),
            non_recoverable: true,
            description: None,
        }
    }

    /// An errno-tagged failure.
    #[must_use]
    pub const fn errno(errno: i32) -> Self {
        Self {
            status: ErrorStatus::Errno(errno),
            non_recoverable: false,
            description: None,
        }
    }

    /// A platform kernel error.
    #[must_use]
    pub const fn kern_return(value: i32) -> Self {
        Self {
            status: ErrorStatus::KernReturn(value),
            non_recoverable: false,
            description: None,
        }
    }

    /// A signal delivered during the transaction.
    #[must_use]
    pub const fn signal(signo: i32) -> Self {
        Self {
            status: ErrorStatus::Signal(signo),
            non_recoverable: true,
            description: None,
        }
    }

    /// Attach a static description.
    #[must_use]
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }

    /// Mark this error as non-recoverable; the engine will surface it
    /// instead of retrying.
    #[must_use]
    pub const fn into_non_recoverable(mut self) -> Self {
        self.non_recoverable = true;
        self
    }

    /// The tagged status.
    #[must_use]
    pub const fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Optional description.
    #[must_use]
    pub const fn description(&self) -> Option<&'static str> {
        self.description
    }

    /// Whether the engine must not retry this transaction.
    #[must_use]
    pub const fn is_non_recoverable(&self) -> bool {
        self.non_recoverable
    }

    /// Whether this error is a lock conflict.
    #[must_use]
    pub const fn is_conflicting(&self) -> bool {
        matches!(self.status, ErrorStatus::Conflicting(_))
    }

    /// Whether this error requests irrevocable re-execution.
    #[must_use]
    pub const fn is_revocable(&self) -> bool {
        matches!(self.status, ErrorStatus::Revocable)
    }

    /// The contended lock, when this is a conflict that named one.
    #[must_use]
    pub const fn conflicting_lock(&self) -> Option<LockToken> {
        match self.status {
            ErrorStatus::Conflicting(lock) => lock,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicting_carries_lock_token() {
        let token = LockToken::from_addr(0xdead_b000);
        let err = TxError::conflicting(Some(token));
        assert!(err.is_conflicting());
        assert!(!err.is_non_recoverable());
        assert_eq!(err.conflicting_lock(), Some(token));
    }

    #[test]
    fn test_anonymous_conflict() {
        let err = TxError::conflicting(None);
        assert!(err.is_conflicting());
        assert_eq!(err.conflicting_lock(), None);
    }

    #[test]
    fn test_internal_code_is_non_recoverable() {
        let err = TxError::code(ErrorCode::GeneralError);
        assert!(err.is_non_recoverable());
        assert!(!err.is_conflicting());
    }

    #[test]
    fn test_errno_recoverable_until_marked() {
        let err = TxError::errno(libc_eagain());
        assert!(!err.is_non_recoverable());
        let err = err.into_non_recoverable();
        assert!(err.is_non_recoverable());
    }

    #[test]
    fn test_display_includes_description() {
        let err = TxError::revocable().with_description("socket send on retry");
        let text = err.to_string();
        assert!(text.contains("irrevocable"), "display: {text}");
        assert!(text.contains("socket send on retry"), "display: {text}");
    }

    #[test]
    fn test_status_accessor_round_trips() {
        let err = TxError::errno(11);
        assert_eq!(err.status(), ErrorStatus::Errno(11));
        let err = TxError::kern_return(5);
        assert_eq!(err.status(), ErrorStatus::KernReturn(5));
        let err = TxError::signal(15);
        assert_eq!(err.status(), ErrorStatus::Signal(15));
        assert!(err.is_non_recoverable());
    }

    const fn libc_eagain() -> i32 {
        11
    }
}
