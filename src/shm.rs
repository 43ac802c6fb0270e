//! Shared-memory regions backed by `memmap2`.
//!
//! A region is either file-backed (usually under `/dev/shm`, visible to
//! other processes) or anonymous (in-process only, used by tests).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;

use memmap2::{MmapMut, MmapOptions};
use tracing::info;

use crate::error::ShmError;

/// `name` -> `/dev/shm/<name>`; absolute paths are kept as they are.
pub fn shm_path(name: &str) -> PathBuf {
    if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        Path::new("/dev/shm").join(name)
    }
}

/// A mapped region with a stable base address.
pub struct ShmRegion {
    // Keeps the mapping alive; all access goes through `base`
    _map: MmapMut,
    base: *mut u8,
    len: usize,
    path: Option<PathBuf>,
}

// SAFETY: the mapping lives as long as the region; concurrent access goes through atomics
// or through protocols (ring cursors) that hand out exclusive slot ownership
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or resize) a file-backed region of `len` bytes. Contents of a
    /// freshly created file are zero.
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self, ShmError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(len as u64)?;
        // SAFETY: the file stays open for the duration of the map call; size fixed above
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        info!(path = %path.display(), len, "mapped shared memory region");
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            len,
            path: Some(path.to_path_buf()),
        })
    }

    /// Map an existing file-backed region at its current size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShmError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(ShmError::SizeMismatch { expected: 1, actual: 0 });
        }
        // SAFETY: see `create`
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        info!(path = %path.display(), len, "attached shared memory region");
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            len,
            path: Some(path.to_path_buf()),
        })
    }

    /// Zeroed private region (in-process only).
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        let mut map = MmapMut::map_anon(len)?;
        let base = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            base,
            len,
            path: None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fail unless the region holds at least `expected` bytes.
    pub fn require_len(&self, expected: usize) -> Result<(), ShmError> {
        if self.len < expected {
            return Err(ShmError::SizeMismatch {
                expected,
                actual: self.len,
            });
        }
        Ok(())
    }

    /// Atomic view of the 8 bytes at `offset`.
    ///
    /// # Panics
    /// If `offset` is unaligned or out of bounds. Offsets are layout constants.
    #[inline]
    pub fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "bad atomic offset {offset}");
        // SAFETY: in bounds, 8-byte aligned (mappings are page aligned), lives as long as &self
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// Raw pointer to `offset`. Callers own the synchronization.
    #[inline]
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // SAFETY: within the mapping
        unsafe { self.base.add(offset) }
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("len", &self.len)
            .field("path", &self.path)
            .finish()
    }
}
