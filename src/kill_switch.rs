//! Kill switch - one atomic word in shared memory.
//!
//! Layout: a 64-byte region; offset 0 holds a little-endian `u64` state
//! word. Bit 0 set = engaged. Other bits are reserved and zero. Any process
//! that maps the file can engage; only an operator resets.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::error::ShmError;
use crate::shm::ShmRegion;

/// Size of the kill-switch region in bytes.
pub const KILL_SWITCH_LEN: usize = 64;

/// Engaged bit of the state word.
pub const ENGAGED: u64 = 1;

/// Handle to a kill-switch word. Clones share the same word.
#[derive(Clone, Debug)]
pub struct KillSwitch {
    region: Arc<ShmRegion>,
}

impl KillSwitch {
    /// Create (or reinitialize) a file-backed switch in the given state.
    pub fn create(path: impl AsRef<Path>, engaged: bool) -> Result<Self, ShmError> {
        let switch = Self {
            region: Arc::new(ShmRegion::create(path, KILL_SWITCH_LEN)?),
        };
        switch.word().store(if engaged { ENGAGED } else { 0 }, Ordering::Release);
        Ok(switch)
    }

    /// Attach to an existing switch without changing its state.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let region = ShmRegion::open(path)?;
        region.require_len(KILL_SWITCH_LEN)?;
        Ok(Self {
            region: Arc::new(region),
        })
    }

    /// Attach to the switch at `path`, creating it if missing.
    ///
    /// An existing flag is never cleared here: `engaged` can only raise it.
    /// Clearing stays an explicit operator `reset`.
    pub fn open_or_create(path: impl AsRef<Path>, engaged: bool) -> Result<Self, ShmError> {
        let path = path.as_ref();
        if !path.exists() {
            return Self::create(path, engaged);
        }
        let switch = Self::open(path)?;
        if engaged {
            switch.engage();
        } else if switch.is_engaged() {
            warn!(?path, "kill switch already engaged at startup");
        }
        Ok(switch)
    }

    /// Process-local switch (tests, single-process setups).
    pub fn in_memory(engaged: bool) -> Result<Self, ShmError> {
        let switch = Self {
            region: Arc::new(ShmRegion::anonymous(KILL_SWITCH_LEN)?),
        };
        switch.word().store(if engaged { ENGAGED } else { 0 }, Ordering::Release);
        Ok(switch)
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        self.region.atomic_u64(0)
    }

    /// Acquire load of the engaged bit. Called on every risk check.
    #[inline]
    pub fn is_engaged(&self) -> bool {
        self.word().load(Ordering::Acquire) & ENGAGED != 0
    }

    /// Engage. Idempotent; returns `true` if this call flipped the bit.
    pub fn engage(&self) -> bool {
        let prev = self.word().fetch_or(ENGAGED, Ordering::AcqRel);
        let flipped = prev & ENGAGED == 0;
        if flipped {
            warn!(path = ?self.region.path(), "kill switch engaged");
        }
        flipped
    }

    /// Operator reset.
    pub fn reset(&self) {
        self.word().store(0, Ordering::Release);
        warn!(path = ?self.region.path(), "kill switch reset");
    }

    /// Raw state word.
    #[inline]
    pub fn state_word(&self) -> u64 {
        self.word().load(Ordering::Acquire)
    }
}
