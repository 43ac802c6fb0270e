//! Topic - lock-free, pre-allocated multi-producer broadcast ring.
//!
//! Every topic owns a power-of-two slot array and a fixed table of
//! subscriber cursors. Producers claim positions from an atomic head
//! cursor; each slot carries a seqlock stamp so readers detect torn reads
//! and being lapped.
//!
//! # Stamp protocol
//!
//! | stamp        | meaning                                  |
//! |--------------|------------------------------------------|
//! | `0`          | never written                            |
//! | `2 * p + 1`  | position `p` being written               |
//! | `2 * p + 2`  | position `p` committed                   |
//!
//! A reader at position `r` sees `2 * r + 2` (ready), something smaller
//! (not yet published) or something larger (overwritten by a later lap).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BusError, ConfigError};

/// Values carried by a topic: plain data, copied in and out of slots.
pub trait BusMessage: Copy + Send + 'static {
    /// Structural check applied by subscribers; ill-formed values are skipped.
    fn is_well_formed(&self) -> bool {
        true
    }
}

/// What a producer does when the slowest subscriber is a full ring behind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Overwrite the oldest event and count it if someone had not read it
    DropOldest,
    /// Spin until a slot frees up, then give up with `BusError::Full`
    BlockWithTimeout { timeout_us: u64 },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::DropOldest
    }
}

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Cursor value of a slot that is free or still being attached.
const UNCLAIMED: u64 = u64::MAX;

struct CursorSlot {
    active: AtomicBool,
    /// Next position this subscriber will read, `UNCLAIMED` until attached
    next: AtomicU64,
}

/// Topic counters snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub published: u64,
    /// Events evicted before the slowest subscriber read them
    pub dropped: u64,
    /// Publishes that timed out under `BlockWithTimeout`
    pub full: u64,
}

pub struct Topic<T: BusMessage> {
    name: &'static str,
    slots: Box<[Slot<T>]>,
    mask: u64,
    policy: BackpressurePolicy,
    head: CachePadded<AtomicU64>,
    cursors: Box<[CachePadded<CursorSlot>]>,
    published: CachePadded<AtomicU64>,
    dropped: AtomicU64,
    full: AtomicU64,
}

// SAFETY: slot contents are only accessed through the stamp protocol; T is plain Copy data
unsafe impl<T: BusMessage> Sync for Topic<T> {}
unsafe impl<T: BusMessage> Send for Topic<T> {}

impl<T: BusMessage> Topic<T> {
    /// Create a topic. `capacity` must be a power of two and at least 2.
    pub fn new(
        name: &'static str,
        capacity: usize,
        policy: BackpressurePolicy,
        max_subscribers: usize,
    ) -> Result<Self, ConfigError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "topic `{name}` capacity {capacity} must be a power of two >= 2"
            )));
        }
        if max_subscribers == 0 {
            return Err(ConfigError::Invalid(format!("topic `{name}` needs at least one subscriber slot")));
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                stamp: AtomicU64::new(0),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        let cursors = (0..max_subscribers)
            .map(|_| {
                CachePadded::new(CursorSlot {
                    active: AtomicBool::new(false),
                    next: AtomicU64::new(UNCLAIMED),
                })
            })
            .collect();
        Ok(Self {
            name,
            slots,
            mask: capacity as u64 - 1,
            policy,
            head: CachePadded::new(AtomicU64::new(0)),
            cursors,
            published: CachePadded::new(AtomicU64::new(0)),
            dropped: AtomicU64::new(0),
            full: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Position the next publish will claim.
    #[inline]
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
        }
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.cursors
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .count()
    }

    /// Cursor of the slowest subscriber (`None` without subscribers).
    /// Slots still being attached are skipped.
    fn min_cursor(&self) -> Option<u64> {
        self.cursors
            .iter()
            .filter(|c| c.active.load(Ordering::Acquire))
            .map(|c| c.next.load(Ordering::Acquire))
            .filter(|&next| next != UNCLAIMED)
            .min()
    }

    /// Publish one event.
    ///
    /// Never allocates. Under `DropOldest` this never fails.
    pub fn publish(&self, value: T) -> Result<(), BusError> {
        let cap = self.capacity() as u64;
        let pos = match self.policy {
            BackpressurePolicy::DropOldest => {
                let pos = self.head.fetch_add(1, Ordering::AcqRel);
                if pos >= cap {
                    self.count_eviction(pos - cap);
                }
                pos
            }
            BackpressurePolicy::BlockWithTimeout { timeout_us } => self.claim_blocking(timeout_us)?,
        };
        self.write_slot(pos, value);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[inline]
    fn count_eviction(&self, evicted: u64) {
        if self.min_cursor().map_or(true, |min| min <= evicted) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn claim_blocking(&self, timeout_us: u64) -> Result<u64, BusError> {
        let cap = self.capacity() as u64;
        let mut deadline: Option<Instant> = None;
        loop {
            let pos = self.head.load(Ordering::Acquire);
            if pos >= cap {
                let evicted = pos - cap;
                match self.min_cursor() {
                    Some(min) if min <= evicted => {
                        let now = Instant::now();
                        let deadline = *deadline.get_or_insert(now + Duration::from_micros(timeout_us));
                        if now >= deadline {
                            self.full.fetch_add(1, Ordering::Relaxed);
                            return Err(BusError::Full { topic: self.name });
                        }
                        std::hint::spin_loop();
                        continue;
                    }
                    Some(_) => {}
                    // Nobody to wait for
                    None => {
                        if self
                            .head
                            .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                        {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            return Ok(pos);
                        }
                        continue;
                    }
                }
            }
            if self
                .head
                .compare_exchange_weak(pos, pos + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(pos);
            }
        }
    }

    fn write_slot(&self, pos: u64, value: T) {
        let cap = self.capacity() as u64;
        let slot = &self.slots[(pos & self.mask) as usize];
        let expected = if pos >= cap { 2 * (pos - cap) + 2 } else { 0 };
        let writing = 2 * pos + 1;
        loop {
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == expected {
                if slot
                    .stamp
                    .compare_exchange_weak(expected, writing, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            } else if stamp > writing {
                // A later lap already owns the slot; this event is the oldest one
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            // Previous lap still being written
            std::hint::spin_loop();
        }
        fence(Ordering::Release);
        // SAFETY: the odd stamp gives this producer exclusive write access
        unsafe {
            std::ptr::write_volatile(slot.value.get(), MaybeUninit::new(value));
        }
        slot.stamp.store(writing + 1, Ordering::Release);
    }

    /// Attach a subscriber that sees events published from now on.
    pub fn subscribe(self: &Arc<Self>) -> Result<Subscription<T>, BusError> {
        let start = self.head();
        self.attach(start)
    }

    /// Attach a subscriber that starts at the oldest retained event.
    pub fn subscribe_from_oldest(self: &Arc<Self>) -> Result<Subscription<T>, BusError> {
        let start = self.head().saturating_sub(self.capacity() as u64);
        self.attach(start)
    }

    fn attach(self: &Arc<Self>, start: u64) -> Result<Subscription<T>, BusError> {
        for (index, cursor) in self.cursors.iter().enumerate() {
            // A claimed slot reads as `UNCLAIMED` until the position is stored
            if cursor
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                cursor.next.store(start, Ordering::Release);
                return Ok(Subscription {
                    topic: Arc::clone(self),
                    index,
                    next: start,
                    lag: 0,
                    malformed: 0,
                });
            }
        }
        Err(BusError::TooManySubscribers { topic: self.name })
    }
}

/// Outcome of one read attempt.
enum Read<T> {
    Ready(T),
    Empty,
    Lapped,
}

/// A subscriber's view of a topic. Dropping it frees the cursor slot.
pub struct Subscription<T: BusMessage> {
    topic: Arc<Topic<T>>,
    index: usize,
    next: u64,
    lag: u64,
    malformed: u64,
}

impl<T: BusMessage> Subscription<T> {
    #[inline]
    pub fn topic(&self) -> &Topic<T> {
        &self.topic
    }

    /// Events skipped because producers lapped this subscriber.
    #[inline]
    pub fn lag(&self) -> u64 {
        self.lag
    }

    /// Ill-formed events skipped.
    #[inline]
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Events published but not yet read (may exceed capacity when lapped).
    #[inline]
    pub fn pending(&self) -> u64 {
        self.topic.head().saturating_sub(self.next)
    }

    fn read(&self, pos: u64) -> Read<T> {
        let slot = &self.topic.slots[(pos & self.topic.mask) as usize];
        let ready = 2 * pos + 2;
        let before = slot.stamp.load(Ordering::Acquire);
        if before < ready {
            return Read::Empty;
        }
        if before > ready {
            return Read::Lapped;
        }
        // SAFETY: read into MaybeUninit; only trusted once the stamp is re-validated
        let value = unsafe { std::ptr::read_volatile(slot.value.get()) };
        fence(Ordering::Acquire);
        let after = slot.stamp.load(Ordering::Relaxed);
        if after != before {
            return Read::Lapped;
        }
        // SAFETY: stamp unchanged across the copy, so it holds the committed value
        Read::Ready(unsafe { value.assume_init() })
    }

    fn advance(&mut self, next: u64) {
        self.next = next;
        self.topic.cursors[self.index].next.store(next, Ordering::Release);
    }

    /// Next well-formed event, if any. Never blocks.
    pub fn poll(&mut self) -> Option<T> {
        loop {
            match self.read(self.next) {
                Read::Empty => return None,
                Read::Ready(value) => {
                    let next = self.next + 1;
                    self.advance(next);
                    if value.is_well_formed() {
                        return Some(value);
                    }
                    self.malformed += 1;
                    warn!(topic = self.topic.name, position = next - 1, "skipping ill-formed event");
                }
                Read::Lapped => {
                    let oldest = self.topic.head().saturating_sub(self.topic.capacity() as u64);
                    let resume = oldest.max(self.next + 1);
                    let skipped = resume - self.next;
                    self.lag += skipped;
                    warn!(topic = self.topic.name, skipped, total_lag = self.lag, "subscriber overrun");
                    self.advance(resume);
                }
            }
        }
    }

    /// Hand up to `max` events to `f`; returns how many were delivered.
    pub fn drain(&mut self, max: usize, mut f: impl FnMut(T)) -> usize {
        let mut n = 0;
        while n < max {
            match self.poll() {
                Some(value) => {
                    f(value);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

impl<T: BusMessage> Drop for Subscription<T> {
    fn drop(&mut self) {
        let cursor = &self.topic.cursors[self.index];
        cursor.next.store(UNCLAIMED, Ordering::Release);
        cursor.active.store(false, Ordering::Release);
    }
}
