//! Counting read/write lock with writer upgrade.
//!
//! The whole lock is a single `AtomicU8`. `0` means unlocked, `1..=254` is
//! the reader count, and `255` marks an exclusive writer. `254` doubles as
//! the saturation sentinel: the acquisition that would reach it is rejected
//! as a conflict, so the counter can never overflow into the writer value.
//!
//! All operations use relaxed ordering on the counter itself. The lock only
//! arbitrates ownership; the layers above issue the release/acquire fences
//! that publish the protected payload at commit time.

use std::sync::atomic::{AtomicU8, Ordering};

use tessera_error::{LockToken, Result, TxError};

const WRITER: u8 = u8::MAX;
const READER_SATURATED: u8 = u8::MAX - 1;

/// Counting read/write lock. Never blocks; acquisition failures are
/// reported as conflicts for the transaction engine to resolve.
#[derive(Debug, Default)]
pub struct TxRwLock {
    n: AtomicU8,
}

impl TxRwLock {
    /// New unlocked instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            n: AtomicU8::new(0),
        }
    }

    /// Identity token used in conflict reports.
    #[must_use]
    pub fn token(&self) -> LockToken {
        LockToken::from_addr(std::ptr::from_ref(self) as usize)
    }

    /// Try to acquire a read grant.
    ///
    /// Fails with a conflict if a writer holds the lock or the reader count
    /// is saturated.
    pub fn try_rdlock(&self) -> Result<()> {
        let mut n = self.n.load(Ordering::Relaxed);
        loop {
            if n == WRITER || n == READER_SATURATED {
                return Err(TxError::conflicting(Some(self.token())));
            }
            // Weak compare-exchange: spurious failures just re-run the loop.
            match self
                .n
                .compare_exchange_weak(n, n + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(observed) => n = observed,
            }
        }
    }

    /// Try to acquire the write grant.
    ///
    /// With `upgrade` set, the caller asserts it is currently the only
    /// reader and atomically trades its read grant for the write grant.
    pub fn try_wrlock(&self, upgrade: bool) -> Result<()> {
        let expected = u8::from(upgrade);
        self.n
            .compare_exchange(expected, WRITER, Ordering::Relaxed, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| TxError::conflicting(Some(self.token())))
    }

    /// Release the caller's grant: a writer resets the counter, a reader
    /// decrements it.
    pub fn unlock(&self) {
        let n = self.n.load(Ordering::Relaxed);
        if n == WRITER {
            self.n.store(0, Ordering::Relaxed);
            return;
        }
        debug_assert_ne!(n, 0, "unlock of unowned lock");
        self.n.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether a writer currently holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.n.load(Ordering::Relaxed) == WRITER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share() {
        let lock = TxRwLock::new();
        lock.try_rdlock().unwrap();
        lock.try_rdlock().unwrap();
        lock.try_rdlock().unwrap();
        lock.unlock();
        lock.unlock();
        lock.unlock();
        // Fully released; a writer may now enter.
        lock.try_wrlock(false).unwrap();
        lock.unlock();
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = TxRwLock::new();
        lock.try_wrlock(false).unwrap();
        let err = lock.try_rdlock().unwrap_err();
        assert!(err.is_conflicting());
        assert_eq!(err.conflicting_lock(), Some(lock.token()));
        lock.unlock();
        lock.try_rdlock().unwrap();
    }

    #[test]
    fn test_writer_excludes_writer() {
        let lock = TxRwLock::new();
        lock.try_wrlock(false).unwrap();
        assert!(lock.try_wrlock(false).is_err());
        lock.unlock();
    }

    #[test]
    fn test_upgrade_from_sole_reader() {
        let lock = TxRwLock::new();
        lock.try_rdlock().unwrap();
        lock.try_wrlock(true).unwrap();
        assert!(lock.is_write_locked());
        lock.unlock();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_upgrade_fails_with_second_reader() {
        let lock = TxRwLock::new();
        lock.try_rdlock().unwrap();
        lock.try_rdlock().unwrap();
        assert!(lock.try_wrlock(true).is_err());
        lock.unlock();
        lock.try_wrlock(true).unwrap();
        lock.unlock();
    }

    #[test]
    fn test_wrlock_fails_while_read_locked() {
        let lock = TxRwLock::new();
        lock.try_rdlock().unwrap();
        assert!(lock.try_wrlock(false).is_err());
        lock.unlock();
    }

    #[test]
    fn test_reader_count_saturates() {
        let lock = TxRwLock::new();
        for _ in 0..254 {
            lock.try_rdlock().unwrap();
        }
        // The 255th acquisition hits the saturation sentinel.
        let err = lock.try_rdlock().unwrap_err();
        assert!(err.is_conflicting());
        for _ in 0..254 {
            lock.unlock();
        }
        lock.try_wrlock(false).unwrap();
        lock.unlock();
    }
}
