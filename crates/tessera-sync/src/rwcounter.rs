//! Per-transaction acquisition counter for a [`TxRwLock`].
//!
//! A transaction may pass through the same lock many times. Only the first
//! acquisition touches the shared lock and only the last release unlocks
//! it; everything in between just moves the local counter. The top bit
//! records whether the transaction ever took the lock in write mode.

use tessera_error::Result;

use crate::rwlock::TxRwLock;

const WRITTEN: u32 = 1 << 27;
const COUNT_MASK: u32 = WRITTEN - 1;

/// Transaction-local view of one shared [`TxRwLock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RwCounter {
    state: u32,
}

impl RwCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self { state: 0 }
    }

    /// Count a read acquisition, taking the shared lock on first entry.
    pub fn rdlock(&mut self, lock: &TxRwLock) -> Result<()> {
        if self.state & COUNT_MASK == 0 {
            lock.try_rdlock()?;
        }
        self.state = (self.state & WRITTEN) | ((self.state & COUNT_MASK) + 1);
        Ok(())
    }

    /// Count a write acquisition, taking or upgrading the shared lock the
    /// first time write mode is requested.
    pub fn wrlock(&mut self, lock: &TxRwLock) -> Result<()> {
        if self.state & WRITTEN == 0 {
            let upgrade = self.state & COUNT_MASK != 0;
            lock.try_wrlock(upgrade)?;
        }
        self.state = WRITTEN | ((self.state & COUNT_MASK) + 1);
        Ok(())
    }

    /// Count a release, unlocking the shared lock when the last local
    /// grant goes away.
    pub fn unlock(&mut self, lock: &TxRwLock) {
        debug_assert_ne!(self.state & COUNT_MASK, 0, "unlock without acquisition");
        self.state = (self.state & WRITTEN) | ((self.state & COUNT_MASK) - 1);
        if self.state & COUNT_MASK != 0 {
            return;
        }
        lock.unlock();
        self.state = 0;
    }

    /// How many grants this transaction currently holds.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.state & COUNT_MASK
    }

    /// Whether this transaction ever took write mode on the lock.
    #[must_use]
    pub const fn has_written(&self) -> bool {
        self.state & WRITTEN != 0
    }
}
