//! Per-transaction view of transactional memory.
//!
//! `VmemTx` owns the active pages of one transaction, sorted by block
//! index. Frames are acquired on first touch (read grant for loads, write
//! grant for stores, upgrading when the read grant is already held) and
//! stay locked until `finish`; the sorted page order makes lock
//! acquisition ordered across transactions that touch overlapping block
//! sets.
//!
//! The first write touch of every page records one journal event. Apply
//! and undo dispatch back here through those events: apply writes back
//! written write-back pages, undo restores the snapshots of written
//! write-through pages.

use memchr::memchr;
use smallvec::SmallVec;
use tessera_core::EventLog;
use tessera_error::{ErrorCode, Result, TxError};
use tessera_types::{BLOCK_SIZE, BlockIndex, Event, ModuleId, PrivatizeFlags};

use crate::frame::frame_map;
use crate::page::{Page, PageFlags};

/// Journal call code for a page's first write touch.
pub(crate) const CALL_WRITE_TOUCH: u16 = 0;

/// Per-transaction page set.
#[derive(Debug, Default)]
pub struct VmemTx {
    /// Active pages, sorted by block index.
    pages: SmallVec<[Page; 8]>,
    /// Retired page structs kept for reuse.
    free_pages: Vec<Page>,
    /// Side-table mapping event cookies to blocks.
    touched: Vec<BlockIndex>,
}

impl VmemTx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn page_position(&self, block: BlockIndex) -> std::result::Result<usize, usize> {
        self.pages.binary_search_by_key(&block, Page::block)
    }

    /// Index of the page for `block`, creating it if the transaction has
    /// not touched the block yet.
    fn acquire_page(&mut self, block: BlockIndex) -> usize {
        match self.page_position(block) {
            Ok(index) => index,
            Err(insert_at) => {
                let page = match self.free_pages.pop() {
                    Some(mut page) => {
                        page.reset(block);
                        page
                    }
                    None => Page::new(block),
                };
                self.pages.insert(insert_at, page);
                insert_at
            }
        }
    }

    /// Ensure the page holds at least a read grant and carries the
    /// block's contents.
    unsafe fn ensure_readable(&mut self, index: usize) -> Result<()> {
        let page = &mut self.pages[index];
        if page.flags().contains(PageFlags::OWNS_FRAME) {
            return Ok(());
        }
        let frame = frame_map().frame(page.block())?;
        frame.try_rdlock()?;
        page.insert_flags(PageFlags::OWNS_FRAME);
        unsafe { page.load_from_memory() };
        Ok(())
    }

    /// Ensure the page holds the write grant, upgrading a read grant, and
    /// record the first write touch in the journal.
    unsafe fn ensure_writable(
        &mut self,
        index: usize,
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        let page = &mut self.pages[index];
        if page.flags().contains(PageFlags::WRITE_ACQUIRED) {
            return Ok(());
        }

        let first_touch = !page.flags().contains(PageFlags::OWNS_FRAME);
        let frame = frame_map().frame(page.block())?;
        frame.try_wrlock(!first_touch, std::ptr::from_ref(page) as usize)?;
        page.insert_flags(PageFlags::OWNS_FRAME | PageFlags::WRITE_ACQUIRED);
        if first_touch {
            unsafe { page.load_from_memory() };
        }

        let cookie = self.touched.len() as u32;
        self.touched.push(self.pages[index].block());
        journal.inject(Event::new(module, CALL_WRITE_TOUCH, cookie))?;
        Ok(())
    }

    /// Transactional load: copy `dst.len()` bytes starting at `addr` into
    /// `dst` through the page layer.
    pub unsafe fn load(&mut self, addr: usize, dst: &mut [u8]) -> Result<()> {
        let mut addr = addr;
        let mut copied = 0;
        while copied < dst.len() {
            let block = BlockIndex::containing(addr);
            let index = self.acquire_page(block);
            unsafe { self.ensure_readable(index)? };

            let offset = addr - block.base_addr();
            let chunk = (BLOCK_SIZE - offset).min(dst.len() - copied);
            unsafe {
                self.pages[index].read_into(offset, &mut dst[copied..copied + chunk]);
            }
            addr = checked_advance(addr, chunk)?;
            copied += chunk;
        }
        Ok(())
    }

    /// Transactional store: copy `src` to `addr` through the page layer.
    pub unsafe fn store(
        &mut self,
        addr: usize,
        src: &[u8],
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        let mut addr = addr;
        let mut copied = 0;
        while copied < src.len() {
            let block = BlockIndex::containing(addr);
            let index = self.acquire_page(block);
            unsafe { self.ensure_writable(index, module, journal)? };

            let offset = addr - block.base_addr();
            let chunk = (BLOCK_SIZE - offset).min(src.len() - copied);
            unsafe {
                self.pages[index].write_from(offset, &src[copied..copied + chunk]);
            }
            addr = checked_advance(addr, chunk)?;
            copied += chunk;
        }
        Ok(())
    }

    /// Transactional memcpy: load from `laddr`, store to `saddr`.
    pub unsafe fn load_store(
        &mut self,
        laddr: usize,
        saddr: usize,
        len: usize,
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        let mut laddr = laddr;
        let mut saddr = saddr;
        let mut remaining = len;
        let mut chunk_buf = [0_u8; BLOCK_SIZE];
        while remaining > 0 {
            // Bound the chunk by both block tails so each side stays within
            // one page.
            let l_tail = BLOCK_SIZE - (laddr & (BLOCK_SIZE - 1));
            let s_tail = BLOCK_SIZE - (saddr & (BLOCK_SIZE - 1));
            let chunk = remaining.min(l_tail).min(s_tail);

            unsafe {
                self.load(laddr, &mut chunk_buf[..chunk])?;
                self.store(saddr, &chunk_buf[..chunk], module, journal)?;
            }
            laddr = checked_advance(laddr, chunk)?;
            saddr = checked_advance(saddr, chunk)?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Declare `[addr, addr + len)` for raw-pointer access. Covered pages
    /// turn write-through; an empty flag set discards their buffered
    /// state instead.
    pub unsafe fn privatize(
        &mut self,
        addr: usize,
        len: usize,
        flags: PrivatizeFlags,
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(len)
            .ok_or_else(|| TxError::code(ErrorCode::OutOfBounds))?;
        let mut block = BlockIndex::containing(addr);
        let last = BlockIndex::containing(end - 1);

        while block <= last {
            unsafe { self.privatize_block(block, flags, module, journal)? };
            block = BlockIndex(block.0 + 1);
        }
        Ok(())
    }

    unsafe fn privatize_block(
        &mut self,
        block: BlockIndex,
        flags: PrivatizeFlags,
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        if flags.is_empty() {
            // Release: the caller declares the buffered contents dead.
            if let Ok(index) = self.page_position(block) {
                self.pages[index].remove_flags(PageFlags::WRITTEN | PageFlags::WRITE_THROUGH);
            }
            return Ok(());
        }

        let index = self.acquire_page(block);
        if flags.intersects(PrivatizeFlags::STORE) {
            unsafe { self.ensure_writable(index, module, journal)? };
        } else {
            unsafe { self.ensure_readable(index)? };
        }

        let page = &mut self.pages[index];
        if !page.flags().contains(PageFlags::WRITE_THROUGH) {
            if page.flags().contains(PageFlags::WRITTEN) {
                // Buffered writes exist; publish them to memory and keep
                // the displaced bytes as the rollback snapshot.
                unsafe { page.exchange_with_memory() };
            }
            page.insert_flags(PageFlags::WRITE_THROUGH);
        }
        if flags.intersects(PrivatizeFlags::STORE) {
            // Raw-pointer writes happen behind our back; mark the page so
            // rollback restores the snapshot.
            page.insert_flags(PageFlags::WRITTEN);
        }
        Ok(())
    }

    /// Privatize the C-string-style region starting at `addr` and ending
    /// at the first occurrence of `sentinel` (inclusive).
    pub unsafe fn privatize_c(
        &mut self,
        addr: usize,
        sentinel: u8,
        flags: PrivatizeFlags,
        module: ModuleId,
        journal: &mut EventLog,
    ) -> Result<()> {
        let mut scan = addr;
        loop {
            let block = BlockIndex::containing(scan);
            let block_end = block.base_addr() + BLOCK_SIZE;
            unsafe { self.privatize(scan, block_end - scan, flags, module, journal)? };

            // The block is locked now, so its bytes are stable to scan.
            let bytes = unsafe {
                std::slice::from_raw_parts(scan as *const u8, block_end - scan)
            };
            if memchr(sentinel, bytes).is_some() {
                return Ok(());
            }
            scan = checked_advance(scan, block_end - scan)?;
        }
    }

    // -----------------------------------------------------------------------
    // Commit pipeline
    // -----------------------------------------------------------------------

    /// Apply one write-touch event: publish the page's buffered contents
    /// unless the page went write-through (whose memory is already
    /// current) or was discarded.
    pub unsafe fn apply(&self, cookie: u32) -> Result<()> {
        let block = self.touched_block(cookie)?;
        if let Ok(index) = self.page_position(block) {
            let page = &self.pages[index];
            if page.flags().contains(PageFlags::WRITTEN)
                && !page.flags().contains(PageFlags::WRITE_THROUGH)
            {
                unsafe { page.store_to_memory() };
            }
        }
        Ok(())
    }

    /// Undo one write-touch event: restore the snapshot of a written
    /// write-through page. Buffered writes need no undo; their buffers are
    /// simply dropped.
    pub unsafe fn undo(&self, cookie: u32) -> Result<()> {
        let block = self.touched_block(cookie)?;
        if let Ok(index) = self.page_position(block) {
            let page = &self.pages[index];
            if page
                .flags()
                .contains(PageFlags::WRITTEN | PageFlags::WRITE_THROUGH)
            {
                unsafe { page.store_to_memory() };
            }
        }
        Ok(())
    }

    fn touched_block(&self, cookie: u32) -> Result<BlockIndex> {
        self.touched
            .get(cookie as usize)
            .copied()
            .ok_or_else(|| {
                TxError::code(ErrorCode::OutOfBounds).with_description("stale write-touch cookie")
            })
    }

    /// Release every frame and retire the pages for reuse.
    pub fn finish(&mut self) -> Result<()> {
        for mut page in self.pages.drain(..) {
            if page.flags().contains(PageFlags::OWNS_FRAME) {
                frame_map().frame(page.block())?.unlock();
                page.remove_flags(PageFlags::OWNS_FRAME | PageFlags::WRITE_ACQUIRED);
            }
            self.free_pages.push(page);
        }
        self.touched.clear();
        Ok(())
    }

    /// Number of active pages (blocks touched by the transaction).
    #[must_use]
    pub fn active_pages(&self) -> usize {
        self.pages.len()
    }
}

fn checked_advance(addr: usize, by: usize) -> Result<usize> {
    addr.checked_add(by)
        .ok_or_else(|| TxError::code(ErrorCode::OutOfBounds).with_description("address overflow"))
}
