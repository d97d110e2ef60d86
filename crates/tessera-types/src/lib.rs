//! Core type definitions shared by the tessera runtime crates.
//!
//! Block geometry, journal event records, module identifiers, and the
//! transaction mode enums live here so that the engine, the memory
//! substrate, and out-of-tree modules agree on them without depending on
//! each other.

use std::fmt;

use bitflags::bitflags;

// ---------------------------------------------------------------------------
// Block geometry
// ---------------------------------------------------------------------------

/// log2 of the block size.
pub const BLOCK_SIZE_BITS: u32 = 6;

/// Size of a memory block in bytes. Every block has one global frame; a
/// transaction that touches the block gets one private page of this size.
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_BITS;

/// Offset-within-block mask.
pub const BLOCK_OFFSET_MASK: usize = BLOCK_SIZE - 1;

/// Index of a block in the flat (virtual) address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(pub usize);

impl BlockIndex {
    /// The block containing `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: usize) -> Self {
        Self(addr >> BLOCK_SIZE_BITS)
    }

    /// First address of this block.
    #[inline]
    #[must_use]
    pub const fn base_addr(self) -> usize {
        self.0 << BLOCK_SIZE_BITS
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Modules and events
// ---------------------------------------------------------------------------

/// Slot index of a registered module. Dense; at most [`MAX_MODULES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u16);

/// Upper bound on registered modules per transaction.
pub const MAX_MODULES: usize = 16;

/// One journalled operation.
///
/// The cookie indexes into the owning module's side-table, where the
/// concrete arguments and undo data for the call are stored. Events are
/// appended in program order; undo walks them in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Owning module's registry slot.
    pub module: ModuleId,
    /// Module-private call code.
    pub call: u16,
    /// Index into the module's side-table.
    pub cookie: u32,
}

impl Event {
    #[must_use]
    pub const fn new(module: ModuleId, call: u16, cookie: u32) -> Self {
        Self {
            module,
            call,
            cookie,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction modes
// ---------------------------------------------------------------------------

/// Execution mode of the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxMode {
    /// Normal optimistic execution; the attempt may be rolled back.
    #[default]
    Revocable,
    /// Exclusive execution under the process-wide lock. Conflicts are
    /// impossible and modules may bypass journaling.
    Irrevocable,
}

impl TxMode {
    /// Whether modules may skip undo bookkeeping.
    #[inline]
    #[must_use]
    pub const fn is_noundo(self) -> bool {
        matches!(self, Self::Irrevocable)
    }
}

/// How much work `validate` performs for modules with optimistic
/// concurrency control. The built-in memory substrate locks as it goes and
/// ignores this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Validate only the domains an operation touched.
    #[default]
    Op,
    /// Validate whole domains on access.
    Domain,
    /// Validate everything on every operation.
    Full,
}

bitflags! {
    /// Access declaration for a privatized memory region.
    ///
    /// An empty flag set releases the region: its buffered pages are
    /// discarded and raw-pointer access reverts to undeclared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrivatizeFlags: u32 {
        /// The region will be read through raw pointers.
        const LOAD = 1 << 0;
        /// The region will be written through raw pointers.
        const STORE = 1 << 1;
        /// Both directions.
        const LOADSTORE = Self::LOAD.bits() | Self::STORE.bits();
    }
}
