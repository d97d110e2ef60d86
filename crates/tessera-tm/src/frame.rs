//! Global per-block frames and the lazily-grown frame directory.
//!
//! A frame is the shared, persistent side of one memory block: the lock
//! that arbitrates access and a token naming the page that currently holds
//! the lock in write mode. The authoritative bytes are the block's actual
//! memory; frames carry no payload of their own.
//!
//! The frame lock's counter uses relaxed ordering throughout, so the frame
//! issues the fences that order payload access: an acquire fence after
//! every successful lock acquisition, a release fence before every unlock.
//! A committing writer's page copy-back therefore happens-before any
//! reader that acquires the frame afterwards.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use tessera_error::Result;
use tessera_sync::{SharedTreemap, TxRwLock};
use tessera_types::BlockIndex;

/// log2 of the number of frames per directory leaf.
const FRAME_TBL_BITS: u32 = 10;
const FRAME_TBL_SIZE: usize = 1 << FRAME_TBL_BITS;
const FRAME_TBL_MASK: usize = FRAME_TBL_SIZE - 1;

/// Shared per-block state.
#[derive(Debug, Default)]
pub struct Frame {
    lock: TxRwLock,
    /// Opaque token of the write-lock owner; zero when not write-locked.
    owner: AtomicUsize,
}

impl Frame {
    /// Acquire a read grant on the block.
    pub fn try_rdlock(&self) -> Result<()> {
        self.lock.try_rdlock()?;
        fence(Ordering::Acquire);
        Ok(())
    }

    /// Acquire the write grant, upgrading the caller's sole read grant
    /// when `upgrade` is set. `owner` names the acquiring page.
    pub fn try_wrlock(&self, upgrade: bool, owner: usize) -> Result<()> {
        self.lock.try_wrlock(upgrade)?;
        self.owner.store(owner, Ordering::Relaxed);
        fence(Ordering::Acquire);
        Ok(())
    }

    /// Release the caller's grant, publishing all preceding writes to the
    /// block's memory.
    pub fn unlock(&self) {
        fence(Ordering::Release);
        if self.lock.is_write_locked() {
            self.owner.store(0, Ordering::Relaxed);
        }
        self.lock.unlock();
    }

    /// Token of the current write-lock owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Relaxed) {
            0 => None,
            token => Some(token),
        }
    }
}

/// One directory leaf: a dense table of frames for 2^10 adjacent blocks.
struct FrameTable {
    frames: Box<[Frame]>,
}

impl FrameTable {
    fn new() -> Self {
        let frames = (0..FRAME_TBL_SIZE)
            .map(|_| Frame::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frames }
    }
}

/// Process-global frame directory. Tables are created on first touch of
/// any block they cover and live until process exit; the directory never
/// shrinks.
pub struct FrameMap {
    tables: SharedTreemap<FrameTable>,
}

impl std::fmt::Debug for FrameMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMap").finish_non_exhaustive()
    }
}

impl FrameMap {
    fn new() -> Self {
        // Key = block index without the per-table bits; the remaining
        // address bits determine the directory depth.
        let key_nbits = usize::BITS - tessera_types::BLOCK_SIZE_BITS - FRAME_TBL_BITS;
        let tables = SharedTreemap::new(key_nbits, 10)
            .unwrap_or_else(|_| unreachable!("frame directory geometry is static"));
        Self { tables }
    }

    /// The frame guarding `block`, creating its table on first touch.
    pub fn frame(&self, block: BlockIndex) -> Result<&Frame> {
        let table = self
            .tables
            .find_or_create((block.0 >> FRAME_TBL_BITS) as u64, |_| {
                Ok(FrameTable::new())
            })?;
        Ok(&table.frames[block.0 & FRAME_TBL_MASK])
    }
}

static FRAME_MAP: LazyLock<FrameMap> = LazyLock::new(FrameMap::new);

/// The process-wide frame directory.
pub fn frame_map() -> &'static FrameMap {
    &FRAME_MAP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_block_same_frame() {
        let map = FrameMap::new();
        let a = map.frame(BlockIndex(123)).unwrap();
        let b = map.frame(BlockIndex(123)).unwrap();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn test_adjacent_blocks_distinct_frames() {
        let map = FrameMap::new();
        let a = map.frame(BlockIndex(0)).unwrap();
        let b = map.frame(BlockIndex(1)).unwrap();
        assert!(!std::ptr::eq(a, b));
    }

    #[test]
    fn test_sparse_blocks_resolve() {
        let map = FrameMap::new();
        // Touch blocks spread across the address space; each lands in its
        // own lazily-created table.
        for shift in [0_usize, 12, 20, 30, 40, 50] {
            let block = BlockIndex(1 << shift);
            let frame = map.frame(block).unwrap();
            frame.try_rdlock().unwrap();
            frame.unlock();
        }
    }

    #[test]
    fn test_write_owner_tracked() {
        let map = FrameMap::new();
        let frame = map.frame(BlockIndex(7)).unwrap();
        assert_eq!(frame.owner(), None);
        frame.try_wrlock(false, 0xABCD).unwrap();
        assert_eq!(frame.owner(), Some(0xABCD));
        frame.unlock();
        assert_eq!(frame.owner(), None);
    }

    #[test]
    fn test_read_then_upgrade() {
        let map = FrameMap::new();
        let frame = map.frame(BlockIndex(9)).unwrap();
        frame.try_rdlock().unwrap();
        frame.try_wrlock(true, 1).unwrap();
        frame.unlock();
    }
}
