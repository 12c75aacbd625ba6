//! First-fit allocator carving blocks out of an arena.
//!
//! ```text
//! +------------------+---------------------------+
//! | BlockHeader 32B  | payload (16B aligned) ... |
//! +------------------+---------------------------+
//! ```
//!
//! Free blocks form a singly linked list ordered by address so neighbours can
//! be coalesced on free. Allocations are zeroed before they are handed out.

use crate::region::{align_up, SharedRegion, ShmPtr, ARENA_ALIGNMENT};
use crate::skirmish::{CellCtx, SkirmishCell};
use crate::{FusionError, FusionResult};
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

const BLOCK_HEADER: u64 = size_of::<BlockHeader>() as u64;
const MIN_SPLIT: u64 = BLOCK_HEADER + 2 * ARENA_ALIGNMENT as u64;
const FREE_MAGIC: u64 = 0x4652_4545_424c_4b30;
const USED_MAGIC: u64 = 0x5553_4544_424c_4b31;

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct HeapHeader {
    pub(crate) lock: SkirmishCell,
    free_head: AtomicU64,
    start: AtomicU64,
    end: AtomicU64,
    used: AtomicU64,
    allocations: AtomicU64,
}

#[repr(C, align(16))]
#[derive(Debug, Default)]
struct BlockHeader {
    size: AtomicU64,
    next_free: AtomicU64,
    magic: AtomicU64,
    _reserved: AtomicU64,
}

/// Snapshot of arena heap usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes managed by the heap, headers included.
    pub capacity: u64,
    /// Bytes currently handed out, headers included.
    pub used: u64,
    /// Live allocations.
    pub allocations: u64,
}

/// Borrowed view of a heap inside a mapped arena.
pub(crate) struct Heap<'a> {
    region: &'a SharedRegion,
    header: &'a HeapHeader,
}

impl<'a> Heap<'a> {
    pub(crate) fn new(region: &'a SharedRegion, header: ShmPtr<HeapHeader>) -> FusionResult<Self> {
        Ok(Self {
            region,
            header: region.at(header)?,
        })
    }

    /// Formats `[start, end)` as one free block. Only the arena creator calls
    /// this, before the arena is marked ready.
    pub(crate) fn format(&self, start: u64, end: u64) -> FusionResult<()> {
        let start = align_up(start as usize, ARENA_ALIGNMENT) as u64;
        let end = end & !(ARENA_ALIGNMENT as u64 - 1);
        if end <= start + MIN_SPLIT {
            return Err(FusionError::NoSharedMemory {
                requested: MIN_SPLIT as usize,
            });
        }
        let block = self.block(start)?;
        block.size.store(end - start, Ordering::Relaxed);
        block.next_free.store(0, Ordering::Relaxed);
        block.magic.store(FREE_MAGIC, Ordering::Relaxed);
        self.header.start.store(start, Ordering::Relaxed);
        self.header.end.store(end, Ordering::Relaxed);
        self.header.free_head.store(start, Ordering::Relaxed);
        self.header.used.store(0, Ordering::Relaxed);
        self.header.allocations.store(0, Ordering::Release);
        Ok(())
    }

    fn block(&self, offset: u64) -> FusionResult<&'a BlockHeader> {
        self.region.at(ShmPtr::<BlockHeader>::from_raw(offset))
    }

    /// Allocates `len` zeroed bytes and returns the payload offset.
    pub(crate) fn alloc(&self, ctx: &CellCtx<'_>, len: usize) -> FusionResult<u64> {
        let need = BLOCK_HEADER + align_up(len.max(1), ARENA_ALIGNMENT) as u64;
        let payload = self
            .header
            .lock
            .locked(ctx, || self.alloc_locked(need))
            .map_err(|err| {
            tracing::warn!(requested = len, "arena heap exhausted");
            err
        })?;
        self.region.zero(payload, len)?;
        Ok(payload)
    }

    fn alloc_locked(&self, need: u64) -> FusionResult<u64> {
        let mut prev: Option<&BlockHeader> = None;
        let mut cursor = self.header.free_head.load(Ordering::Relaxed);
        while cursor != 0 {
            let block = self.block(cursor)?;
            if block.magic.load(Ordering::Relaxed) != FREE_MAGIC {
                crate::fusion_bug!("heap free list corrupted");
            }
            let size = block.size.load(Ordering::Relaxed);
            let next = block.next_free.load(Ordering::Relaxed);
            if size >= need {
                let successor = if size - need >= MIN_SPLIT {
                    let rest_at = cursor + need;
                    let rest = self.block(rest_at)?;
                    rest.size.store(size - need, Ordering::Relaxed);
                    rest.next_free.store(next, Ordering::Relaxed);
                    rest.magic.store(FREE_MAGIC, Ordering::Relaxed);
                    block.size.store(need, Ordering::Relaxed);
                    rest_at
                } else {
                    next
                };
                match prev {
                    Some(prev) => prev.next_free.store(successor, Ordering::Relaxed),
                    None => self.header.free_head.store(successor, Ordering::Relaxed),
                }
                block.next_free.store(0, Ordering::Relaxed);
                block.magic.store(USED_MAGIC, Ordering::Relaxed);
                self.header
                    .used
                    .fetch_add(block.size.load(Ordering::Relaxed), Ordering::Relaxed);
                self.header.allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(cursor + BLOCK_HEADER);
            }
            prev = Some(block);
            cursor = next;
        }
        Err(FusionError::NoSharedMemory {
            requested: (need - BLOCK_HEADER) as usize,
        })
    }

    /// Returns the block whose payload starts at `payload` to the free list.
    pub(crate) fn free(&self, ctx: &CellCtx<'_>, payload: u64) -> FusionResult<()> {
        let start = self.header.start.load(Ordering::Relaxed);
        let end = self.header.end.load(Ordering::Relaxed);
        if payload < start + BLOCK_HEADER || payload >= end {
            return Err(FusionError::InvArg("pointer not owned by arena heap"));
        }
        self.header
            .lock
            .locked(ctx, || self.free_locked(payload - BLOCK_HEADER))
    }

    fn free_locked(&self, offset: u64) -> FusionResult<()> {
        let block = self.block(offset)?;
        if block.magic.load(Ordering::Relaxed) != USED_MAGIC {
            crate::fusion_bug!("double free or foreign pointer passed to arena heap");
        }
        let size = block.size.load(Ordering::Relaxed);
        self.header.used.fetch_sub(size, Ordering::Relaxed);
        self.header.allocations.fetch_sub(1, Ordering::Relaxed);
        block.magic.store(FREE_MAGIC, Ordering::Relaxed);

        let mut prev: Option<(u64, &BlockHeader)> = None;
        let mut cursor = self.header.free_head.load(Ordering::Relaxed);
        while cursor != 0 && cursor < offset {
            let current = self.block(cursor)?;
            prev = Some((cursor, current));
            cursor = current.next_free.load(Ordering::Relaxed);
        }

        block.next_free.store(cursor, Ordering::Relaxed);
        if cursor != 0 && offset + size == cursor {
            let next = self.block(cursor)?;
            block
                .size
                .fetch_add(next.size.load(Ordering::Relaxed), Ordering::Relaxed);
            block
                .next_free
                .store(next.next_free.load(Ordering::Relaxed), Ordering::Relaxed);
            next.magic.store(0, Ordering::Relaxed);
        }

        match prev {
            Some((prev_at, prev)) => {
                let prev_size = prev.size.load(Ordering::Relaxed);
                if prev_at + prev_size == offset {
                    prev.size
                        .fetch_add(block.size.load(Ordering::Relaxed), Ordering::Relaxed);
                    prev.next_free
                        .store(block.next_free.load(Ordering::Relaxed), Ordering::Relaxed);
                    block.magic.store(0, Ordering::Relaxed);
                } else {
                    prev.next_free.store(offset, Ordering::Relaxed);
                }
            }
            None => self.header.free_head.store(offset, Ordering::Relaxed),
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let start = self.header.start.load(Ordering::Relaxed);
        let end = self.header.end.load(Ordering::Relaxed);
        HeapStats {
            capacity: end.saturating_sub(start),
            used: self.header.used.load(Ordering::Relaxed),
            allocations: self.header.allocations.load(Ordering::Relaxed),
        }
    }
}
