//! Fault classification for the restart loop.
//!
//! After rollback, the engine asks this dispatcher what to do with the
//! error that unwound the attempt: re-enter the body, re-enter it in
//! irrevocable mode, or surface the error to the user.

use tessera_error::{ErrorStatus, TxError};

/// How aggressively the engine recovers from environmental errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryStrategy {
    /// Classify errno values and retry the transient ones.
    #[default]
    Auto,
    /// Surface every environmental error to the user; only conflicts and
    /// irrevocability requests are handled internally.
    Full,
}

/// The dispatcher's decision for one rolled-back attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Re-execute the body.
    Retry,
    /// Re-execute the body under the process-wide exclusive lock.
    RetryIrrevocable,
    /// Rethrow to the caller.
    Surface,
}

/// Decide the fate of a rolled-back attempt.
///
/// `enomem_retried` tracks whether this transaction already used its one
/// allocation-failure retry.
pub fn dispatch(
    strategy: RecoveryStrategy,
    error: &TxError,
    enomem_retried: &mut bool,
) -> Verdict {
    if error.is_non_recoverable() {
        return Verdict::Surface;
    }

    match error.status() {
        ErrorStatus::Conflicting(_) => Verdict::Retry,
        ErrorStatus::Revocable => Verdict::RetryIrrevocable,
        ErrorStatus::Errno(errno) if strategy == RecoveryStrategy::Auto => {
            match errno {
                libc::EAGAIN | libc::EINTR | libc::EBUSY => Verdict::Retry,
                libc::ENOMEM => {
                    // One retry on allocation pressure, then give up.
                    if *enomem_retried {
                        Verdict::Surface
                    } else {
                        *enomem_retried = true;
                        Verdict::Retry
                    }
                }
                _ => Verdict::Surface,
            }
        }
        ErrorStatus::Errno(_)
        | ErrorStatus::Code(_)
        | ErrorStatus::KernReturn(_)
        | ErrorStatus::Signal(_) => Verdict::Surface,
    }
}
