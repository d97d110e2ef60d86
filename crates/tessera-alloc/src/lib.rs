//! Transactional heap allocation.
//!
//! The allocator module gives transactions `malloc`/`free` with rollback:
//! an allocation is performed eagerly (so the body can use the memory) and
//! journalled, and is deallocated again if the transaction rolls back; a
//! `free` is only journalled during the body and the actual deallocation
//! is deferred to commit, so rolled-back frees never happen.
//!
//! This module is also the reference consumer of the core contracts: a
//! pointer side-table indexed by event cookies, one journal event per
//! operation, and apply/undo dispatch on the call code.

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc, dealloc};
use std::any::Any;

use tracing::trace;

use tessera_core::{Module, Transaction};
use tessera_error::{ErrorCode, Result, TxError};
use tessera_types::{Event, ModuleId};

const CALL_MALLOC: u16 = 0;
const CALL_FREE: u16 = 1;

/// Round a request up to the next multiple of the word size, so every
/// allocation carries at least word alignment.
fn round_to_word(size: usize) -> usize {
    let mask = std::mem::size_of::<usize>() - 1;
    (size + mask) & !mask
}

fn layout_for(size: usize) -> Result<Layout> {
    Layout::from_size_align(round_to_word(size.max(1)), std::mem::size_of::<usize>())
        .map_err(|_| TxError::code(ErrorCode::OutOfBounds).with_description("oversized allocation"))
}

/// One journalled allocator operation.
#[derive(Debug, Clone, Copy)]
struct PtrRecord {
    ptr: *mut u8,
    size: usize,
}

/// Allocator module state: the pointer side-table for the current
/// transaction.
#[derive(Debug, Default)]
pub struct AllocatorTx {
    ptrtab: Vec<PtrRecord>,
}

// Raw pointers in the side-table are owned by this module alone; the
// transaction (and thus the module) never migrates between threads.
unsafe impl Send for AllocatorTx {}

impl AllocatorTx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operations recorded in the current transaction.
    #[must_use]
    pub fn pending_ops(&self) -> usize {
        self.ptrtab.len()
    }

    fn record(&mut self, ptr: *mut u8, size: usize) -> u32 {
        self.ptrtab.push(PtrRecord { ptr, size });
        (self.ptrtab.len() - 1) as u32
    }

    fn lookup(&self, cookie: u32) -> Result<PtrRecord> {
        self.ptrtab.get(cookie as usize).copied().ok_or_else(|| {
            TxError::code(ErrorCode::OutOfBounds).with_description("stale allocator cookie")
        })
    }
}

impl Module for AllocatorTx {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn apply_events(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            let record = self.lookup(event.cookie)?;
            match event.call {
                // The allocation already happened; commit keeps it.
                CALL_MALLOC => {}
                // Deferred free becomes real at commit.
                CALL_FREE => unsafe {
                    dealloc(record.ptr, layout_for(record.size)?);
                },
                _ => {
                    return Err(TxError::code(ErrorCode::GeneralError)
                        .with_description("unknown allocator call"));
                }
            }
        }
        Ok(())
    }

    fn undo_events(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            let record = self.lookup(event.cookie)?;
            match event.call {
                // Roll back the eager allocation.
                CALL_MALLOC => unsafe {
                    dealloc(record.ptr, layout_for(record.size)?);
                },
                // The free never happened; nothing to undo.
                CALL_FREE => {}
                _ => {
                    return Err(TxError::code(ErrorCode::GeneralError)
                        .with_description("unknown allocator call"));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        trace!(ops = self.ptrtab.len(), "allocator finished");
        self.ptrtab.clear();
        Ok(())
    }

    fn release(&mut self) {
        self.ptrtab.clear();
    }
}

/// Slot of the allocator module, registering it on first use.
pub fn ensure_module(tx: &mut Transaction) -> Result<ModuleId> {
    if let Some(id) = tx.find_module::<AllocatorTx>() {
        return Ok(id);
    }
    tx.register_module(Box::new(AllocatorTx::new()))
}

/// Transactionally allocate `size` bytes (word-aligned, rounded up to a
/// word multiple). The memory is usable immediately and is reclaimed if
/// the transaction rolls back.
pub fn malloc(tx: &mut Transaction, size: usize) -> Result<*mut u8> {
    let id = ensure_module(tx)?;
    let layout = layout_for(size)?;

    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        return Err(TxError::errno(libc::ENOMEM));
    }

    let (state, journal) = tx.module_state_and_journal::<AllocatorTx>(id)?;
    let cookie = state.record(ptr, size);
    if let Err(error) = journal.inject(Event::new(id, CALL_MALLOC, cookie)) {
        unsafe { dealloc(ptr, layout) };
        return Err(error);
    }
    Ok(ptr)
}

/// Transactionally free a pointer obtained from the global allocator with
/// the given size. The deallocation is deferred to commit.
///
/// # Safety
/// `ptr` must have been allocated with this module's layout for `size`
/// and must not be used after the transaction commits.
pub unsafe fn free(tx: &mut Transaction, ptr: *mut u8, size: usize) -> Result<()> {
    let id = ensure_module(tx)?;
    let (state, journal) = tx.module_state_and_journal::<AllocatorTx>(id)?;
    let cookie = state.record(ptr, size);
    journal.inject(Event::new(id, CALL_FREE, cookie))?;
    Ok(())
}

/// Outstanding operation count, for leak assertions in tests.
pub fn pending_ops(tx: &mut Transaction) -> usize {
    tx.find_module::<AllocatorTx>()
        .and_then(|id| tx.module_mut::<AllocatorTx>(id).ok().map(|m| m.pending_ops()))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_commit_keeps_allocation() {
        let mut tx = Transaction::new();
        let ptr = tx
            .run(|tx| {
                let ptr = malloc(tx, 32)?;
                unsafe { std::ptr::write_bytes(ptr, 0xAA, 32) };
                Ok(ptr as usize)
            })
            .unwrap();

        // Committed allocation is live and holds the written bytes.
        let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, 32) };
        assert!(bytes.iter().all(|&b| b == 0xAA));
        assert_eq!(pending_ops(&mut tx), 0);

        let mut tx2 = Transaction::new();
        tx2.run(|tx| unsafe { free(tx, ptr as *mut u8, 32) }).unwrap();
    }

    #[test]
    fn test_malloc_rolled_back_on_restart() {
        let mut tx = Transaction::new();
        let mut first = true;
        tx.run(|tx| {
            if first {
                first = false;
                let ptr = malloc(tx, 32)?;
                unsafe { std::ptr::write_bytes(ptr, 0xAA, 32) };
                return tx.restart();
            }
            Ok(())
        })
        .unwrap();

        // No allocation attributable to the transaction survives.
        assert_eq!(pending_ops(&mut tx), 0);
    }

    #[test]
    fn test_free_deferred_to_commit() {
        let mut tx = Transaction::new();
        let ptr = tx.run(|tx| Ok(malloc(tx, 64)? as usize)).unwrap();

        // Free inside a transaction that restarts once: the memory must
        // still be valid on the retry.
        let mut first = true;
        tx.run(|tx| {
            // Readable on every attempt; a rolled-back free must not have
            // released it.
            unsafe { std::ptr::read_volatile(ptr as *const u8) };
            unsafe { free(tx, ptr as *mut u8, 64)? };
            if first {
                first = false;
                return tx.restart();
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(pending_ops(&mut tx), 0);
    }

    #[test]
    fn test_zero_size_allocation_rounds_up() {
        let mut tx = Transaction::new();
        let ptr = tx.run(|tx| Ok(malloc(tx, 0)? as usize)).unwrap();
        assert_ne!(ptr, 0);
        let mut tx2 = Transaction::new();
        tx2.run(|tx| unsafe { free(tx, ptr as *mut u8, 0) }).unwrap();
    }

    #[test]
    fn test_round_to_word() {
        let word = std::mem::size_of::<usize>();
        assert_eq!(round_to_word(1), word);
        assert_eq!(round_to_word(word), word);
        assert_eq!(round_to_word(word + 1), 2 * word);
    }
}
