//! Lock-free sharded directory from wide integer keys to shared values.
//!
//! The key space (up to 64 bits) is split into equal-width levels. Each
//! interior node is an array of `2^level_bits` atomic pointers to children;
//! leaves hold the user's values. Lookups walk the levels without locks;
//! missing nodes and values are created on demand and installed with a
//! single compare-and-swap. The loser of an install race destroys its local
//! candidate and adopts the winner, so every key maps to exactly one value
//! for the lifetime of the map.
//!
//! Directories are only reclaimed when the map is dropped. This is the
//! intended behavior for the runtime's resource directories (frame tables,
//! file-identity maps): they grow with the working set and never shrink.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};

use tessera_error::{ErrorCode, Result, TxError};

/// One interior directory level: `2^level_bits` atomic child slots.
///
/// A slot holds either a `Dir` pointer (above leaf depth) or a `T` pointer
/// (at leaf depth); the depth of the walk disambiguates.
struct Dir {
    entries: Box<[AtomicPtr<()>]>,
}

impl Dir {
    fn new(nentries: usize) -> Self {
        let entries = (0..nentries)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { entries }
    }
}

/// Lock-free key→value directory.
///
/// Values are heap-allocated and shared; `find` hands out `&T` references
/// that live as long as the map. Dropping the map drops every value.
pub struct SharedTreemap<T> {
    root: AtomicPtr<()>,
    /// Number of directory levels above the values.
    depth: u32,
    level_bits: u32,
    _values: PhantomData<Box<T>>,
}

// Values are shared across threads through &T.
unsafe impl<T: Send + Sync> Send for SharedTreemap<T> {}
unsafe impl<T: Send + Sync> Sync for SharedTreemap<T> {}

impl<T> std::fmt::Debug for SharedTreemap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTreemap")
            .field("depth", &self.depth)
            .field("level_bits", &self.level_bits)
            .finish_non_exhaustive()
    }
}

impl<T> SharedTreemap<T> {
    /// Create a map for keys of `key_nbits` significant bits, walked in
    /// levels of `level_nbits`.
    ///
    /// A zero-bit key space degenerates to a single root value. Key widths
    /// beyond 64 bits or zero-width levels are rejected.
    pub fn new(key_nbits: u32, level_nbits: u32) -> Result<Self> {
        if key_nbits > 64 || level_nbits == 0 || level_nbits >= usize::BITS {
            return Err(TxError::code(ErrorCode::OutOfBounds)
                .with_description("unsupported treemap geometry"));
        }
        Ok(Self {
            root: AtomicPtr::new(std::ptr::null_mut()),
            depth: key_nbits.div_ceil(level_nbits),
            level_bits: level_nbits,
            _values: PhantomData,
        })
    }

    fn level_nentries(&self) -> usize {
        1 << self.level_bits
    }

    fn entry_index(&self, key: u64, depth: u32) -> usize {
        let mask = (self.level_nentries() - 1) as u64;
        ((key >> (depth * self.level_bits)) & mask) as usize
    }

    /// Load a slot's pointer, or install the result of `make` if the slot
    /// is empty. The CAS loser destroys its candidate via `destroy`.
    fn load_or_install(
        slot: &AtomicPtr<()>,
        make: impl FnOnce() -> Result<*mut ()>,
        destroy: impl FnOnce(*mut ()),
    ) -> Result<*mut ()> {
        let entry = slot.load(Ordering::Acquire);
        if !entry.is_null() {
            return Ok(entry);
        }

        let candidate = make()?;
        match slot.compare_exchange(
            std::ptr::null_mut(),
            candidate,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(candidate),
            Err(winner) => {
                // A concurrent transaction installed the entry first.
                destroy(candidate);
                Ok(winner)
            }
        }
    }

    /// Find the value for `key`, creating it with `create` if absent.
    ///
    /// Concurrent creators race on a single CAS; exactly one candidate
    /// wins and the losers are dropped. Every caller observes the same
    /// winning value.
    pub fn find_or_create(&self, key: u64, create: impl FnOnce(u64) -> Result<T>) -> Result<&T> {
        let mut slot = &self.root;
        let mut depth = self.depth;

        while depth > 0 {
            depth -= 1;
            let nentries = self.level_nentries();
            let dir_ptr = Self::load_or_install(
                slot,
                || Ok(Box::into_raw(Box::new(Dir::new(nentries))).cast::<()>()),
                |ptr| unsafe { drop(Box::from_raw(ptr.cast::<Dir>())) },
            )?;
            let dir = unsafe { &*dir_ptr.cast::<Dir>() };
            slot = &dir.entries[self.entry_index(key, depth)];
        }

        let value_ptr = Self::load_or_install(
            slot,
            || Ok(Box::into_raw(Box::new(create(key)?)).cast::<()>()),
            |ptr| unsafe { drop(Box::from_raw(ptr.cast::<T>())) },
        )?;
        Ok(unsafe { &*value_ptr.cast::<T>() })
    }

    /// Find the value for `key` without creating anything.
    #[must_use]
    pub fn find(&self, key: u64) -> Option<&T> {
        let mut slot = &self.root;
        let mut depth = self.depth;

        while depth > 0 {
            depth -= 1;
            let entry = slot.load(Ordering::Acquire);
            if entry.is_null() {
                return None;
            }
            let dir = unsafe { &*entry.cast::<Dir>() };
            slot = &dir.entries[self.entry_index(key, depth)];
        }

        let entry = slot.load(Ordering::Acquire);
        if entry.is_null() {
            None
        } else {
            Some(unsafe { &*entry.cast::<T>() })
        }
    }

    fn drop_subtree(&self, entry: *mut (), depth: u32) {
        if entry.is_null() {
            return;
        }
        if depth == 0 {
            drop(unsafe { Box::from_raw(entry.cast::<T>()) });
            return;
        }
        let dir = unsafe { Box::from_raw(entry.cast::<Dir>()) };
        for child in &dir.entries {
            self.drop_subtree(child.load(Ordering::Relaxed), depth - 1);
        }
    }
}

impl<T> Drop for SharedTreemap<T> {
    fn drop(&mut self) {
        self.drop_subtree(self.root.load(Ordering::Relaxed), self.depth);
    }
}
