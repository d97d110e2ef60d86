//! Transaction-local pages.
//!
//! A page mirrors one block for the duration of a transaction: a private
//! buffer, the flags describing what the transaction has done to the
//! block, and the lock state it holds on the block's frame. In the default
//! write-back mode, loads and stores go through the buffer and the frame's
//! memory is only touched at commit. After privatization the page turns
//! write-through: accesses go straight to memory and the buffer keeps the
//! first-touch snapshot for rollback.

use bitflags::bitflags;

use tessera_types::{BLOCK_SIZE, BlockIndex};

bitflags! {
    /// Per-page state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// The transaction holds a grant on the block's frame.
        const OWNS_FRAME = 1 << 0;
        /// The grant is the write grant.
        const WRITE_ACQUIRED = 1 << 1;
        /// The transaction wrote to this block.
        const WRITTEN = 1 << 2;
        /// Accesses bypass the buffer; the buffer holds the rollback
        /// snapshot.
        const WRITE_THROUGH = 1 << 3;
    }
}

/// Transaction-local mirror of one block.
pub struct Page {
    block: BlockIndex,
    flags: PageFlags,
    buf: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("block", &self.block)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Page {
    pub fn new(block: BlockIndex) -> Self {
        Self {
            block,
            flags: PageFlags::empty(),
            buf: [0; BLOCK_SIZE],
        }
    }

    /// Reset a recycled page for a new block.
    pub fn reset(&mut self, block: BlockIndex) {
        self.block = block;
        self.flags = PageFlags::empty();
    }

    #[must_use]
    pub const fn block(&self) -> BlockIndex {
        self.block
    }

    #[must_use]
    pub const fn base_addr(&self) -> usize {
        self.block.base_addr()
    }

    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn insert_flags(&mut self, flags: PageFlags) {
        self.flags |= flags;
    }

    pub fn remove_flags(&mut self, flags: PageFlags) {
        self.flags &= !flags;
    }

    /// Copy the block's memory into the page buffer (first-touch load and
    /// rollback snapshot).
    ///
    /// # Safety
    /// The caller must hold a grant on the block's frame, and the block's
    /// memory must be valid for reads.
    pub unsafe fn load_from_memory(&mut self) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_addr() as *const u8,
                self.buf.as_mut_ptr(),
                BLOCK_SIZE,
            );
        }
    }

    /// Copy the page buffer into the block's memory (commit write-back or
    /// rollback snapshot restore).
    ///
    /// # Safety
    /// The caller must hold the frame's write grant, and the block's
    /// memory must be valid for writes.
    pub unsafe fn store_to_memory(&self) {
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buf.as_ptr(),
                self.base_addr() as *mut u8,
                BLOCK_SIZE,
            );
        }
    }

    /// Swap the page buffer with the block's memory. Used when a page with
    /// buffered writes turns write-through: memory receives the buffered
    /// contents and the buffer becomes the pre-transaction snapshot.
    ///
    /// # Safety
    /// The caller must hold the frame's write grant, and the block's
    /// memory must be valid for reads and writes.
    pub unsafe fn exchange_with_memory(&mut self) {
        let mut tmp = [0_u8; BLOCK_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base_addr() as *const u8,
                tmp.as_mut_ptr(),
                BLOCK_SIZE,
            );
            std::ptr::copy_nonoverlapping(
                self.buf.as_ptr(),
                self.base_addr() as *mut u8,
                BLOCK_SIZE,
            );
        }
        self.buf = tmp;
    }

    /// Read `dst.len()` bytes at `offset` within the block, honoring the
    /// page's write-back/write-through mode.
    ///
    /// # Safety
    /// The caller must hold a grant on the frame; in write-through mode
    /// the block's memory must be valid for reads.
    pub unsafe fn read_into(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= BLOCK_SIZE);
        if self.flags.contains(PageFlags::WRITE_THROUGH) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (self.base_addr() + offset) as *const u8,
                    dst.as_mut_ptr(),
                    dst.len(),
                );
            }
        } else {
            dst.copy_from_slice(&self.buf[offset..offset + dst.len()]);
        }
    }

    /// Write `src` at `offset` within the block, honoring the page's mode,
    /// and mark the page written.
    ///
    /// # Safety
    /// The caller must hold the frame's write grant; in write-through mode
    /// the block's memory must be valid for writes.
    pub unsafe fn write_from(&mut self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= BLOCK_SIZE);
        debug_assert!(self.flags.contains(PageFlags::WRITE_ACQUIRED));
        if self.flags.contains(PageFlags::WRITE_THROUGH) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    (self.base_addr() + offset) as *mut u8,
                    src.len(),
                );
            }
        } else {
            self.buf[offset..offset + src.len()].copy_from_slice(src);
        }
        self.flags |= PageFlags::WRITTEN;
    }
}
