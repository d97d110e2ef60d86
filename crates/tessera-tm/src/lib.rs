//! Transactional memory substrate.
//!
//! Word-granularity transactional access to process memory. Memory is
//! partitioned into fixed-size blocks; every block has a global frame (a
//! lock) and, once a transaction touches it, a transaction-local page
//! buffering its contents. Loads and stores run against the page; commit
//! publishes written pages back to memory, rollback discards them.
//! Privatized regions are accessed through raw pointers instead, with the
//! page holding the rollback snapshot.
//!
//! All entry points are `unsafe`: the caller vouches that the addresses
//! are valid for the declared access for the remainder of the transaction,
//! exactly as with raw pointer arithmetic. Within that contract, the frame
//! locks make concurrent transactional access race-free.

#![allow(unsafe_code)]

mod frame;
mod module;
mod page;
mod vmem_tx;

use std::mem::MaybeUninit;

pub use frame::{Frame, FrameMap, frame_map};
pub use module::{TmModule, ensure_module};

use tessera_core::Transaction;
use tessera_error::Result;
use tessera_types::PrivatizeFlags;

/// Transactionally read `dst.len()` bytes starting at `addr`.
///
/// # Safety
/// `[addr, addr + dst.len())` must be valid for reads for the remainder
/// of the transaction.
pub unsafe fn load(tx: &mut Transaction, addr: usize, dst: &mut [u8]) -> Result<()> {
    let id = ensure_module(tx)?;
    let (module, _journal) = tx.module_state_and_journal::<TmModule>(id)?;
    unsafe { module.vmem.load(addr, dst) }
}

/// Transactionally write `src` to `addr`.
///
/// # Safety
/// `[addr, addr + src.len())` must be valid for writes for the remainder
/// of the transaction.
pub unsafe fn store(tx: &mut Transaction, addr: usize, src: &[u8]) -> Result<()> {
    let id = ensure_module(tx)?;
    let (module, journal) = tx.module_state_and_journal::<TmModule>(id)?;
    unsafe { module.vmem.store(addr, src, id, journal) }
}

/// Transactional memcpy from `laddr` to `saddr`.
///
/// # Safety
/// `[laddr, laddr + len)` must be valid for reads and
/// `[saddr, saddr + len)` for writes for the remainder of the transaction.
pub unsafe fn load_store(tx: &mut Transaction, laddr: usize, saddr: usize, len: usize) -> Result<()> {
    let id = ensure_module(tx)?;
    let (module, journal) = tx.module_state_and_journal::<TmModule>(id)?;
    unsafe { module.vmem.load_store(laddr, saddr, len, id, journal) }
}

/// Declare `[addr, addr + len)` for direct raw-pointer access with the
/// given intent; empty flags release the region instead.
///
/// # Safety
/// The region must be valid for the declared access for the remainder of
/// the transaction.
pub unsafe fn privatize(
    tx: &mut Transaction,
    addr: usize,
    len: usize,
    flags: PrivatizeFlags,
) -> Result<()> {
    let id = ensure_module(tx)?;
    let (module, journal) = tx.module_state_and_journal::<TmModule>(id)?;
    unsafe { module.vmem.privatize(addr, len, flags, id, journal) }
}

/// Privatize the region from `addr` up to and including the first
/// occurrence of `sentinel` (C-string convention).
///
/// # Safety
/// The memory from `addr` through the first `sentinel` byte must be valid
/// for the declared access for the remainder of the transaction.
pub unsafe fn privatize_c(
    tx: &mut Transaction,
    addr: usize,
    sentinel: u8,
    flags: PrivatizeFlags,
) -> Result<()> {
    let id = ensure_module(tx)?;
    let (module, journal) = tx.module_state_and_journal::<TmModule>(id)?;
    unsafe { module.vmem.privatize_c(addr, sentinel, flags, id, journal) }
}

/// Transactionally read a plain-data value at `addr`.
///
/// # Safety
/// `addr` must point to a valid, initialized `T` readable for the
/// remainder of the transaction, and `T` must tolerate byte-wise copying.
pub unsafe fn load_value<T: Copy>(tx: &mut Transaction, addr: usize) -> Result<T> {
    let mut out = MaybeUninit::<T>::uninit();
    let dst = unsafe {
        std::slice::from_raw_parts_mut(out.as_mut_ptr().cast::<u8>(), std::mem::size_of::<T>())
    };
    unsafe { load(tx, addr, dst)? };
    Ok(unsafe { out.assume_init() })
}

/// Transactionally write a plain-data value to `addr`.
///
/// # Safety
/// `addr` must be valid for writing a `T` for the remainder of the
/// transaction, and `T` must tolerate byte-wise copying.
pub unsafe fn store_value<T: Copy>(tx: &mut Transaction, addr: usize, value: T) -> Result<()> {
    let src = unsafe {
        std::slice::from_raw_parts(
            std::ptr::from_ref(&value).cast::<u8>(),
            std::mem::size_of::<T>(),
        )
    };
    unsafe { store(tx, addr, src) }
}
