//! Sliding-window order rate limiter.

use std::collections::VecDeque;

/// Admits at most `max_events` within any `window_ns` span.
///
/// Timestamps of admitted events are kept in a ring sized at construction,
/// so checks and records do not allocate.
#[derive(Clone, Debug)]
pub struct SlidingWindow {
    stamps: VecDeque<i64>,
    max_events: usize,
    window_ns: i64,
}

impl SlidingWindow {
    pub fn new(max_events: u32, window_ns: i64) -> Self {
        let max_events = max_events as usize;
        Self {
            stamps: VecDeque::with_capacity(max_events),
            max_events,
            window_ns,
        }
    }

    #[inline]
    pub fn max_events(&self) -> usize {
        self.max_events
    }

    #[inline]
    pub fn window_ns(&self) -> i64 {
        self.window_ns
    }

    /// Events recorded inside the current window.
    #[inline]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    #[inline]
    fn expire(&mut self, now_ns: i64) {
        while let Some(&oldest) = self.stamps.front() {
            if now_ns.saturating_sub(oldest) >= self.window_ns {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// True if one more event at `now_ns` stays within the limit.
    #[inline]
    pub fn would_admit(&mut self, now_ns: i64) -> bool {
        self.expire(now_ns);
        self.stamps.len() < self.max_events
    }

    /// Record an admitted event. Call only after `would_admit` returned true.
    #[inline]
    pub fn record(&mut self, now_ns: i64) {
        if self.stamps.len() == self.max_events {
            self.stamps.pop_front();
        }
        self.stamps.push_back(now_ns);
    }

    /// Change the limit. Grows the ring if needed (control path only).
    pub fn set_limit(&mut self, max_events: u32, window_ns: i64) {
        let max_events = max_events as usize;
        if max_events > self.stamps.capacity() {
            self.stamps.reserve(max_events - self.stamps.len());
        }
        while self.stamps.len() > max_events {
            self.stamps.pop_front();
        }
        self.max_events = max_events;
        self.window_ns = window_ns;
    }
}
