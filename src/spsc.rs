//! SPSC ring over shared memory.
//!
//! ## Region layout (little-endian)
//!
//! | offset | size     | field                                 |
//! |--------|----------|---------------------------------------|
//! | 0      | 8        | magic `FLSHRING`                      |
//! | 8      | 4        | layout version                        |
//! | 12     | 4        | slot size (64)                        |
//! | 16     | 8        | capacity (power of two, >= 2)         |
//! | 64     | 8        | write index (own cache line)          |
//! | 128    | 8        | read index (own cache line)           |
//! | 192    | cap * 64 | slots                                 |
//!
//! Indices only ever grow and are compared with wrapping arithmetic. The
//! capacity divides 2^64, so `index & (capacity - 1)` stays consistent
//! when an index wraps.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RingError, ShmError};
use crate::shm::ShmRegion;
use crate::wire::{Slot, WireMessage, WireRecord, SLOT_SIZE};

pub const RING_MAGIC: [u8; 8] = *b"FLSHRING";
pub const LAYOUT_VERSION: u32 = 1;
pub const WRITE_INDEX_OFFSET: usize = 64;
pub const READ_INDEX_OFFSET: usize = 128;
pub const HEADER_LEN: usize = 192;

/// Bytes needed for a ring of `capacity` slots; `BadCapacity` if that does
/// not fit in `usize`.
#[inline]
pub fn region_len(capacity: usize) -> Result<usize, ShmError> {
    capacity
        .checked_mul(SLOT_SIZE)
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or(ShmError::BadCapacity(capacity as u64))
}

/// How long `push` keeps trying against a full ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    TryOnce,
    /// Busy-spin up to `max_retries` extra attempts
    Spin { max_retries: u32 },
    /// Exponential spinning, `max_steps` rounds
    Backoff { max_steps: u32 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Spin { max_retries: 64 }
    }
}

struct RingShared {
    region: ShmRegion,
    capacity: u64,
    mask: u64,
}

impl RingShared {
    #[inline]
    fn write_index(&self) -> &AtomicU64 {
        self.region.atomic_u64(WRITE_INDEX_OFFSET)
    }

    #[inline]
    fn read_index(&self) -> &AtomicU64 {
        self.region.atomic_u64(READ_INDEX_OFFSET)
    }

    #[inline]
    fn slot_ptr(&self, index: u64) -> *mut Slot {
        let offset = HEADER_LEN + (index & self.mask) as usize * SLOT_SIZE;
        self.region.ptr_at(offset) as *mut Slot
    }
}

/// A mapped ring, before it is split into its two ends.
pub struct SpscRing {
    shared: Arc<RingShared>,
}

impl SpscRing {
    /// Create a file-backed ring and write a fresh header.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self, ShmError> {
        check_capacity(capacity as u64)?;
        let region = ShmRegion::create(path, region_len(capacity)?)?;
        Self::init(region, capacity, 0)
    }

    /// Attach to a ring created by the other process.
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let region = ShmRegion::open(path)?;
        region.require_len(HEADER_LEN)?;
        let header = read_header(&region);
        if header[0..8] != RING_MAGIC {
            return Err(ShmError::BadHeader("magic"));
        }
        if LittleEndian::read_u32(&header[8..12]) != LAYOUT_VERSION {
            return Err(ShmError::BadHeader("layout version"));
        }
        if LittleEndian::read_u32(&header[12..16]) as usize != SLOT_SIZE {
            return Err(ShmError::BadHeader("slot size"));
        }
        let capacity = LittleEndian::read_u64(&header[16..24]);
        check_capacity(capacity)?;
        let capacity_slots = usize::try_from(capacity).map_err(|_| ShmError::BadCapacity(capacity))?;
        region.require_len(region_len(capacity_slots)?)?;
        info!(path = ?region.path(), capacity, "attached spsc ring");
        Ok(Self {
            shared: Arc::new(RingShared {
                region,
                capacity,
                mask: capacity - 1,
            }),
        })
    }

    /// Ring in private memory (both ends in one process).
    pub fn anonymous(capacity: usize) -> Result<Self, ShmError> {
        check_capacity(capacity as u64)?;
        let region = ShmRegion::anonymous(region_len(capacity)?)?;
        Self::init(region, capacity, 0)
    }

    /// Anonymous ring whose indices start at `start` (wrap-around tests).
    #[doc(hidden)]
    pub fn anonymous_at(capacity: usize, start: u64) -> Result<Self, ShmError> {
        check_capacity(capacity as u64)?;
        let region = ShmRegion::anonymous(region_len(capacity)?)?;
        Self::init(region, capacity, start)
    }

    fn init(region: ShmRegion, capacity: usize, start: u64) -> Result<Self, ShmError> {
        region.require_len(region_len(capacity)?)?;
        let mut header = [0u8; 24];
        header[0..8].copy_from_slice(&RING_MAGIC);
        LittleEndian::write_u32(&mut header[8..12], LAYOUT_VERSION);
        LittleEndian::write_u32(&mut header[12..16], SLOT_SIZE as u32);
        LittleEndian::write_u64(&mut header[16..24], capacity as u64);
        // SAFETY: no other handle exists yet; the header is within the region
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), region.ptr_at(0), header.len());
        }
        region.atomic_u64(WRITE_INDEX_OFFSET).store(start, Ordering::Release);
        region.atomic_u64(READ_INDEX_OFFSET).store(start, Ordering::Release);
        info!(path = ?region.path(), capacity, "initialized spsc ring");
        Ok(Self {
            shared: Arc::new(RingShared {
                region,
                capacity: capacity as u64,
                mask: capacity as u64 - 1,
            }),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Producer end. Use in exactly one process/thread.
    pub fn into_producer(self) -> Producer {
        Producer::new(self.shared)
    }

    /// Consumer end. Use in exactly one process/thread.
    pub fn into_consumer(self) -> Consumer {
        Consumer::new(self.shared)
    }

    /// Both ends, for in-process use.
    pub fn split(self) -> (Producer, Consumer) {
        (Producer::new(Arc::clone(&self.shared)), Consumer::new(self.shared))
    }
}

fn check_capacity(capacity: u64) -> Result<(), ShmError> {
    if capacity < 2 || !capacity.is_power_of_two() {
        return Err(ShmError::BadCapacity(capacity));
    }
    Ok(())
}

fn read_header(region: &ShmRegion) -> [u8; 24] {
    let mut header = [0u8; 24];
    // SAFETY: the region holds at least HEADER_LEN bytes (checked by callers)
    unsafe {
        std::ptr::copy_nonoverlapping(region.ptr_at(0), header.as_mut_ptr(), header.len());
    }
    header
}

/// Writing end.
pub struct Producer {
    shared: Arc<RingShared>,
    /// Next index to write (mirrors the shared write index)
    write: u64,
    /// Last read index observed; refreshed only when the ring looks full
    cached_read: u64,
}

impl Producer {
    fn new(shared: Arc<RingShared>) -> Self {
        let write = shared.write_index().load(Ordering::Acquire);
        let cached_read = shared.read_index().load(Ordering::Acquire);
        Self {
            shared,
            write,
            cached_read,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Fill the next slot in place. Returns `false` if the ring is full.
    #[inline]
    pub fn try_write_with(&mut self, fill: impl FnOnce(&mut Slot)) -> bool {
        if self.write.wrapping_sub(self.cached_read) >= self.shared.capacity {
            self.cached_read = self.shared.read_index().load(Ordering::Acquire);
            if self.write.wrapping_sub(self.cached_read) >= self.shared.capacity {
                return false;
            }
        }
        // SAFETY: the slot is between read and write index, so the consumer does not touch it
        let slot = unsafe { &mut *self.shared.slot_ptr(self.write) };
        fill(slot);
        self.write = self.write.wrapping_add(1);
        self.shared.write_index().store(self.write, Ordering::Release);
        true
    }

    /// Encode and write one record under `policy`.
    pub fn push<R: WireRecord>(&mut self, record: &R, policy: RetryPolicy) -> Result<(), RingError> {
        self.push_with(policy, |slot| record.encode(slot))
    }

    /// Write any known message under `policy`.
    pub fn push_message(&mut self, message: &WireMessage, policy: RetryPolicy) -> Result<(), RingError> {
        self.push_with(policy, |slot| message.encode(slot))
    }

    fn push_with(&mut self, policy: RetryPolicy, fill: impl Fn(&mut Slot)) -> Result<(), RingError> {
        let mut attempts = 1u32;
        if self.try_write_with(&fill) {
            return Ok(());
        }
        match policy {
            RetryPolicy::TryOnce => {}
            RetryPolicy::Spin { max_retries } => {
                for _ in 0..max_retries {
                    std::hint::spin_loop();
                    attempts += 1;
                    if self.try_write_with(&fill) {
                        return Ok(());
                    }
                }
            }
            RetryPolicy::Backoff { max_steps } => {
                let backoff = Backoff::new();
                for _ in 0..max_steps {
                    backoff.spin();
                    attempts += 1;
                    if self.try_write_with(&fill) {
                        return Ok(());
                    }
                }
            }
        }
        Err(RingError::Contention { attempts })
    }

    /// Slots written but not yet consumed (as last observed).
    pub fn len(&self) -> usize {
        let read = self.shared.read_index().load(Ordering::Acquire);
        self.write.wrapping_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reading end.
pub struct Consumer {
    shared: Arc<RingShared>,
    read: u64,
    /// Last write index observed; refreshed only when the ring looks empty
    cached_write: u64,
}

impl Consumer {
    fn new(shared: Arc<RingShared>) -> Self {
        let read = shared.read_index().load(Ordering::Acquire);
        let cached_write = shared.write_index().load(Ordering::Acquire);
        Self {
            shared,
            read,
            cached_write,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Read the next slot in place. Returns `None` if the ring is empty.
    #[inline]
    pub fn try_read_with<T>(&mut self, read: impl FnOnce(&Slot) -> T) -> Option<T> {
        if self.read == self.cached_write {
            self.cached_write = self.shared.write_index().load(Ordering::Acquire);
            if self.read == self.cached_write {
                return None;
            }
        }
        // SAFETY: the slot was published by the Release store of the write index
        let slot = unsafe { &*self.shared.slot_ptr(self.read) };
        let value = read(slot);
        self.read = self.read.wrapping_add(1);
        self.shared.read_index().store(self.read, Ordering::Release);
        Some(value)
    }

    /// Next record of a known type. An undecodable slot is consumed and reported.
    pub fn pop<R: WireRecord>(&mut self) -> Result<Option<R>, RingError> {
        match self.try_read_with(|slot| R::decode(slot)) {
            None => Ok(None),
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// Next record of any known kind.
    pub fn pop_message(&mut self) -> Result<Option<WireMessage>, RingError> {
        match self.try_read_with(WireMessage::decode) {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
        }
    }

    pub fn len(&self) -> usize {
        let write = self.shared.write_index().load(Ordering::Acquire);
        write.wrapping_sub(self.read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
