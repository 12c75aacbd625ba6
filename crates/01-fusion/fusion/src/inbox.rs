//! Per-participant message ring living in the arena.
//!
//! Layout:
//!
//! ```text
//! +----------------------+--------------------------------------------+
//! | InboxHeader (80 B)   | Data region (capacity bytes, 8B aligned)   |
//! +----------------------+--------------------------------------------+
//!                          Record:
//!                          [u32 total_len][u8 tag][u8 ver][u16 flags]
//!                          [payload ...][pad -> 8 bytes]
//!                          Sentinel (wrap): total_len == 0xFFFF_FFFF
//! ```
//!
//! Any participant may produce; producers serialise on the header's skirmish.
//! Only the owning participant's dispatcher consumes, so the tail needs no
//! lock. Producers ring `doorbell` after publishing a record and consumers
//! bump `space` after retiring one, both as process-shared futex words.

use crate::ids::ParticipantId;
use crate::region::{align_up, SharedRegion, ShmPtr};
use crate::skirmish::{CellCtx, SkirmishCell};
use crate::wait::{self, WaitScope};
use crate::{FusionError, FusionResult};
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const ALIGN: usize = 8;
const ENVELOPE_LEN: usize = 8;
const SENTINEL: u32 = u32::MAX;
const SENTINEL_BYTES: usize = 4;
const WIRE_VERSION: u8 = 1;
pub(crate) const MIN_CAPACITY: usize = 256;
pub(crate) const DATA_OFFSET: usize = align_up(size_of::<InboxHeader>(), 16);

#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct InboxHeader {
    lock: SkirmishCell,
    owner: AtomicU32,
    closed: AtomicU32,
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    doorbell: AtomicU32,
    space: AtomicU32,
    _reserved: AtomicU32,
}

/// Bytes an inbox with `capacity` payload bytes occupies in the arena.
pub(crate) fn footprint(capacity: usize) -> usize {
    DATA_OFFSET + align_up(capacity.max(MIN_CAPACITY), ALIGN)
}

/// One record popped from an inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub tag: u8,
    pub flags: u16,
    pub payload: Vec<u8>,
}

/// Borrowed view of an inbox inside a mapped arena.
pub(crate) struct Inbox<'a> {
    region: &'a SharedRegion,
    header: &'a InboxHeader,
    data: u64,
}

impl<'a> Inbox<'a> {
    pub(crate) fn new(region: &'a SharedRegion, at: ShmPtr<InboxHeader>) -> FusionResult<Self> {
        let header = region.at(at)?;
        let inbox = Self {
            region,
            header,
            data: at.raw() + DATA_OFFSET as u64,
        };
        region.bytes_ptr(inbox.data, inbox.capacity())?;
        Ok(inbox)
    }

    fn capacity(&self) -> usize {
        self.header.capacity.load(Ordering::Acquire) as usize
    }

    /// Hands the ring to a new owner, discarding anything left by the last one.
    pub(crate) fn reset(
        &self,
        ctx: &CellCtx<'_>,
        owner: ParticipantId,
        capacity: usize,
    ) -> FusionResult<()> {
        let capacity = align_up(capacity.max(MIN_CAPACITY), ALIGN);
        self.header.lock.locked(ctx, || {
            self.header.capacity.store(capacity as u32, Ordering::Relaxed);
            self.header.head.store(0, Ordering::Relaxed);
            self.header.tail.store(0, Ordering::Relaxed);
            self.header.owner.store(owner.get(), Ordering::Relaxed);
            self.header.closed.store(0, Ordering::Release);
            self.header.space.fetch_add(1, Ordering::Release);
            Ok(())
        })?;
        wait::wake_all(&self.header.space, WaitScope::Shared);
        Ok(())
    }

    /// Refuses further records and wakes anyone blocked on the ring.
    pub(crate) fn close(&self, ctx: &CellCtx<'_>) -> FusionResult<()> {
        self.header.lock.locked(ctx, || {
            self.header.closed.store(1, Ordering::Release);
            self.header.space.fetch_add(1, Ordering::Release);
            self.header.doorbell.fetch_add(1, Ordering::Release);
            Ok(())
        })?;
        wait::wake_all(&self.header.space, WaitScope::Shared);
        wait::wake_all(&self.header.doorbell, WaitScope::Shared);
        Ok(())
    }

    /// Appends a record for `target`, blocking while the ring is full.
    ///
    /// Fails with `Destroyed` once the ring is closed, handed to another
    /// participant, or its owner stops being alive.
    pub(crate) fn post(
        &self,
        ctx: &CellCtx<'_>,
        target: ParticipantId,
        tag: u8,
        payload: &[u8],
    ) -> FusionResult<()> {
        let record_len = align_up(ENVELOPE_LEN + payload.len(), ALIGN);
        if record_len >= self.capacity() {
            return Err(FusionError::Limit("message larger than inbox"));
        }

        loop {
            let hold = self.header.lock.hold(ctx)?;
            if self.header.closed.load(Ordering::Acquire) != 0
                || self.header.owner.load(Ordering::Acquire) != target.get()
            {
                return Err(FusionError::Destroyed);
            }

            let capacity = self.capacity();
            let head = self.header.head.load(Ordering::Relaxed) as usize;
            let tail = self.header.tail.load(Ordering::Acquire) as usize;
            if let Some((offset, new_head)) = self.reserve_offset(head, tail, record_len, capacity)? {
                self.write_record(offset, tag, payload, record_len)?;
                self.header.head.store(new_head as u32, Ordering::Release);
                self.header.doorbell.fetch_add(1, Ordering::Release);
                drop(hold);
                wait::wake_one(&self.header.doorbell, WaitScope::Shared);
                return Ok(());
            }

            let seq = self.header.space.load(Ordering::Acquire);
            drop(hold);
            tracing::trace!(%target, "inbox full; waiting for consumer");
            wait::wait_u32(&self.header.space, seq, WaitScope::Shared, Some(ctx.slice));
            if !(ctx.alive)(target) {
                return Err(FusionError::Destroyed);
            }
        }
    }

    fn reserve_offset(
        &self,
        head: usize,
        tail: usize,
        record_len: usize,
        capacity: usize,
    ) -> FusionResult<Option<(usize, usize)>> {
        if head >= capacity || tail >= capacity {
            crate::fusion_bug!("inbox cursors outside the ring");
        }

        if head >= tail {
            let space_at_end = capacity - head;
            if space_at_end >= record_len {
                let new_head = if head + record_len == capacity {
                    0
                } else {
                    head + record_len
                };
                if new_head == tail {
                    return Ok(None);
                }
                Ok(Some((head, new_head)))
            } else {
                if tail <= record_len || space_at_end < SENTINEL_BYTES {
                    return Ok(None);
                }
                self.region
                    .write_bytes(self.data + head as u64, &SENTINEL.to_le_bytes())?;
                Ok(Some((0, record_len)))
            }
        } else if record_len >= tail - head {
            Ok(None)
        } else {
            Ok(Some((head, head + record_len)))
        }
    }

    fn write_record(
        &self,
        offset: usize,
        tag: u8,
        payload: &[u8],
        record_len: usize,
    ) -> FusionResult<()> {
        let total_len = (ENVELOPE_LEN + payload.len()) as u32;
        let mut envelope = [0u8; ENVELOPE_LEN];
        envelope[..4].copy_from_slice(&total_len.to_le_bytes());
        envelope[4] = tag;
        envelope[5] = WIRE_VERSION;
        let at = self.data + offset as u64;
        self.region.write_bytes(at, &envelope)?;
        self.region.write_bytes(at + ENVELOPE_LEN as u64, payload)?;
        let pad = record_len - ENVELOPE_LEN - payload.len();
        if pad > 0 {
            self.region
                .zero(at + (ENVELOPE_LEN + payload.len()) as u64, pad)?;
        }
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> FusionResult<u32> {
        let bytes = self.region.read_bytes(self.data + offset as u64, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Pops the oldest record. Only the owner's dispatcher may call this.
    pub(crate) fn pop(&self) -> FusionResult<Option<Record>> {
        let capacity = self.capacity();
        let mut tail = self.header.tail.load(Ordering::Relaxed) as usize;
        loop {
            let head = self.header.head.load(Ordering::Acquire) as usize;
            if head == tail {
                return Ok(None);
            }

            let total_len = self.read_u32(tail)?;
            if total_len == SENTINEL {
                tail = 0;
                self.header.tail.store(0, Ordering::Release);
                continue;
            }

            let total_len = total_len as usize;
            if total_len < ENVELOPE_LEN || tail + total_len > capacity {
                crate::fusion_bug!("corrupt inbox record");
            }
            let envelope = self.region.read_bytes(self.data + tail as u64, ENVELOPE_LEN)?;
            if envelope[5] != WIRE_VERSION {
                return Err(FusionError::VersionMismatch {
                    expected: WIRE_VERSION as u32,
                    found: envelope[5] as u32,
                });
            }
            let payload = self.region.read_bytes(
                self.data + (tail + ENVELOPE_LEN) as u64,
                total_len - ENVELOPE_LEN,
            )?;

            let mut new_tail = tail + align_up(total_len, ALIGN);
            if new_tail >= capacity {
                new_tail -= capacity;
            }
            self.header.tail.store(new_tail as u32, Ordering::Release);
            self.header.space.fetch_add(1, Ordering::Release);
            wait::wake_all(&self.header.space, WaitScope::Shared);

            return Ok(Some(Record {
                tag: envelope[4],
                flags: u16::from_le_bytes([envelope[6], envelope[7]]),
                payload,
            }));
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.header.closed.load(Ordering::Acquire) != 0
    }

    /// Parks the consumer until a producer rings the doorbell or `timeout`
    /// passes. Returns immediately when records are already pending.
    pub(crate) fn wait_for_records(&self, timeout: Duration) {
        let seq = self.header.doorbell.load(Ordering::Acquire);
        let head = self.header.head.load(Ordering::Acquire);
        let tail = self.header.tail.load(Ordering::Relaxed);
        if head != tail || self.is_closed() {
            return;
        }
        wait::wait_u32(&self.header.doorbell, seq, WaitScope::Shared, Some(timeout));
    }

    /// Wakes a consumer parked in [`Inbox::wait_for_records`].
    pub(crate) fn ring_doorbell(&self) {
        self.header.doorbell.fetch_add(1, Ordering::Release);
        wait::wake_all(&self.header.doorbell, WaitScope::Shared);
    }
}
