//! Thread-local transaction facade.
//!
//! The explicit-context API ([`crate::Transaction`]) is primary; this
//! module is sugar for callers that want one implicit transaction per
//! thread, in the style of the original C interface.

use std::cell::RefCell;

use tessera_error::{ErrorCode, Result, TxError};

use crate::tx::Transaction;

thread_local! {
    static CURRENT: RefCell<Transaction> = RefCell::new(Transaction::new());
}

/// Run `body` in this thread's implicit transaction.
///
/// Module registrations persist across calls on the same thread. Nesting
/// is rejected: the inner call fails without touching the outer
/// transaction.
pub fn run<R>(body: impl FnMut(&mut Transaction) -> Result<R>) -> Result<R> {
    CURRENT.with(|cell| {
        let mut tx = cell.try_borrow_mut().map_err(|_| {
            TxError::code(ErrorCode::GeneralError)
                .with_description("nested transactions are not supported")
        })?;
        tx.run(body)
    })
}

/// Inspect or configure this thread's implicit transaction outside of a
/// transactional scope.
pub fn with_transaction<R>(f: impl FnOnce(&mut Transaction) -> R) -> R {
    CURRENT.with(|cell| f(&mut cell.borrow_mut()))
}

/// Release the implicit transaction's resources, e.g. before thread exit.
pub fn release() {
    CURRENT.with(|cell| cell.borrow_mut().release());
}
