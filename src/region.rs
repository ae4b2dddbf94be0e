//! Virtual region manager: a reserved address range with on-demand paging.
//!
//! A [`Region`] reserves a large span of virtual address space up front
//! (`mmap` with no access permissions and `MAP_NORESERVE`) and commits or
//! decommits physical backing within it on demand. The start address and
//! reserved length never change after [`Region::reserve`], which is what
//! makes zero-copy growth of the ring buffer possible: offsets into the
//! region stay valid across every resize.
//!
//! Commit prefers a high-performance paging mode (transparent huge pages
//! via `madvise(MADV_HUGEPAGE)`, fewer and larger physical pages for large
//! streaming transfers) and falls back to standard pages when the kernel
//! refuses the hint. Decommit releases backing with `madvise(MADV_DONTNEED)`
//! and drops access permissions so stale reads fault instead of returning
//! garbage.

use std::ffi::c_void;
use std::ptr::{NonNull, null_mut};

use rustix::io::Errno;
use rustix::mm::{Advice, MapFlags, MprotectFlags, ProtFlags, madvise, mmap_anonymous, mprotect, munmap};

use crate::trace::{debug, trace};

/// Huge page size assumed for granularity rounding (x86-64 / aarch64 THP).
const HUGE_PAGE_SIZE: usize = 2 << 20;

/// Errors from reserving or committing region memory.
///
/// Both are fatal at startup; a commit failure during a resize is treated
/// as transient backpressure by the caller instead.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// The platform could not reserve the requested address range.
    #[error("failed to reserve {size} bytes of address space: {source}")]
    Reserve { size: usize, source: Errno },
    /// Physical backing could not be committed, even with standard pages.
    #[error("failed to commit {size} bytes at offset {offset}: {source}")]
    Commit {
        offset: usize,
        size: usize,
        source: Errno,
    },
}

/// A reserved virtual address range with a committed prefix.
///
/// The committed watermark only tracks what has been requested through
/// [`commit`](Region::commit) and [`decommit`](Region::decommit); callers
/// that share the region across threads are responsible for publishing the
/// watermark themselves (see [`crate::ring::ElasticRing`]).
pub struct Region {
    base: NonNull<u8>,
    reserved: usize,
    committed: usize,
    granularity: usize,
    huge: bool,
}

// SAFETY: Region owns its mapping exclusively; the raw pointer is not
// aliased by any other Rust object and the mapping lives until Drop.
unsafe impl Send for Region {}

impl Region {
    /// Reserves `max_capacity` bytes of address space without physical
    /// backing. The size is rounded up to the paging granularity.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Reserve`] if the platform cannot reserve the
    /// range; the caller should treat this as fatal.
    pub fn reserve(max_capacity: usize) -> Result<Self, RegionError> {
        let granularity = rustix::param::page_size().max(HUGE_PAGE_SIZE);
        let reserved = round_up(max_capacity.max(1), granularity);

        // SAFETY: fresh anonymous mapping at a kernel-chosen address; it
        // cannot alias existing memory. No access permissions are granted
        // until commit, and NORESERVE keeps swap accounting out of the
        // reservation.
        let ptr = unsafe {
            mmap_anonymous(
                null_mut(),
                reserved,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        }
        .map_err(|source| RegionError::Reserve {
            size: reserved,
            source,
        })?;

        // SAFETY: mmap never returns null on success.
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };

        // Ask for huge pages across the whole reservation up front. If the
        // kernel refuses, every later commit uses standard pages.
        // SAFETY: [base, base+reserved) is our own mapping.
        let huge = unsafe { madvise(ptr, reserved, Advice::LinuxHugepage) }.is_ok();
        debug!(reserved, granularity, huge, "reserved region");

        Ok(Self {
            base,
            reserved,
            committed: 0,
            granularity,
            huge,
        })
    }

    /// Ensures the first `size` bytes of the region are backed by physical
    /// memory. No-op when `size` is within the committed prefix.
    ///
    /// Attempts the huge-page mode first; on failure retries with standard
    /// paging. Fails only if both attempts fail.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Commit`] when the delta cannot be committed.
    pub fn commit(&mut self, size: usize) -> Result<(), RegionError> {
        let size = round_up(size, self.granularity).min(self.reserved);
        if size <= self.committed {
            return Ok(());
        }

        let offset = self.committed;
        let len = size - offset;
        // SAFETY: [base+offset, base+offset+len) lies within our reserved
        // mapping; granting read/write to pages nobody else references.
        let ptr = unsafe { self.base.as_ptr().add(offset) }.cast::<c_void>();
        unsafe { mprotect(ptr, len, MprotectFlags::READ | MprotectFlags::WRITE) }.map_err(
            |source| RegionError::Commit {
                offset,
                size: len,
                source,
            },
        )?;

        if self.huge {
            // SAFETY: same range as above.
            if let Err(_e) = unsafe { madvise(ptr, len, Advice::LinuxHugepage) } {
                trace!(error = %_e, "huge page mode unavailable, staying on standard pages");
                self.huge = false;
            }
        }

        self.committed = size;
        trace!(committed = self.committed, "committed region prefix");
        Ok(())
    }

    /// Releases physical backing for `[from, from + size)`.
    ///
    /// Always succeeds or degrades to a no-op; the pages fault-in as zeroes
    /// if committed again later.
    pub fn decommit(&mut self, from: usize, size: usize) {
        let from = round_up(from, self.granularity);
        if from >= self.committed || size == 0 {
            return;
        }
        let len = size.min(self.committed - from);

        // SAFETY: [base+from, base+from+len) lies within our mapping. The
        // caller guarantees no live data in the range (the ring only
        // shrinks while empty), so discarding the pages is sound.
        let ptr = unsafe { self.base.as_ptr().add(from) }.cast::<c_void>();
        let _ = unsafe { madvise(ptr, len, Advice::LinuxDontNeed) };
        let _ = unsafe { mprotect(ptr, len, MprotectFlags::empty()) };

        self.committed = from;
        trace!(committed = self.committed, "decommitted region tail");
    }

    /// Base address of the reservation. Never changes.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Total reserved address-space size.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Current committed watermark.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Paging granularity all commit sizes are rounded to.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    /// Rounds `size` up to the paging granularity.
    pub fn round_up(&self, size: usize) -> usize {
        round_up(size, self.granularity)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in reserve() and is released
        // exactly once here.
        let _ = unsafe { munmap(self.base.as_ptr().cast::<c_void>(), self.reserved) };
    }
}

fn round_up(size: usize, granularity: usize) -> usize {
    debug_assert!(granularity.is_power_of_two());
    size.checked_add(granularity - 1)
        .map_or(usize::MAX & !(granularity - 1), |n| n & !(granularity - 1))
}
