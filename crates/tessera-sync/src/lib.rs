//! Non-blocking synchronization primitives for the tessera runtime.
//!
//! - [`TxRwLock`]: the counting read/write lock that guards every memory
//!   frame and every module-owned shared resource. It never blocks; a
//!   failed acquisition surfaces as a conflict and the transaction engine
//!   decides what to do about it.
//! - [`RwCounter`]: a per-transaction wrapper that makes repeated
//!   acquisitions of the same lock idempotent within one transaction.
//! - [`SharedTreemap`]: a lock-free sharded directory mapping wide integer
//!   keys to shared per-resource objects.

#![allow(unsafe_code)]

mod rwcounter;
mod rwlock;
mod treemap;

pub use rwcounter::RwCounter;
pub use rwlock::TxRwLock;
pub use treemap::SharedTreemap;
