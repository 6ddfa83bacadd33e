use std::ptr::{self, NonNull};

use crate::{
  align::{ALIGNMENT, is_aligned},
  error::SegmentError,
};

/// Fixed heap segment with a bump cursor.
///
/// ```text
///   base                      base + top              base + capacity
///    │                            │                          │
///    ▼                            ▼                          ▼
///    ┌────────────────────────────┬──────────────────────────┐
///    │   blocks (in-use region)   │    not yet reserved      │
///    └────────────────────────────┴──────────────────────────┘
///                                 ──── reserve(n) ────►
/// ```
///
/// `top` only ever moves forward and never passes `capacity`. Every other
/// component addresses the segment by byte offset from `base`, and every
/// header access goes through the bounds-checked accessors below, so a
/// corrupted size field can never make the allocator read or write outside
/// the reserved region.
pub struct Segment {
  base: NonNull<u8>,
  top: usize,
  capacity: usize,
  mapped: bool,
}

impl Segment {
  /// Maps `capacity` bytes of zeroed, private memory to serve as the heap
  /// segment. The mapping is returned to the kernel when the segment is
  /// dropped.
  pub fn map(capacity: usize) -> Result<Self, SegmentError> {
    if capacity == 0 {
      return Err(SegmentError::Empty);
    }

    let protection = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let address = unsafe { libc::mmap(ptr::null_mut(), capacity, protection, flags, -1, 0) };

    if address == libc::MAP_FAILED {
      let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
      return Err(SegmentError::MapFailed { capacity, errno });
    }

    let base = NonNull::new(address as *mut u8).ok_or(SegmentError::NullStart)?;

    log::debug!("mapped heap segment {:p} ({} bytes)", base, capacity);

    Ok(Self {
      base,
      top: 0,
      capacity,
      mapped: true,
    })
  }

  /// Wraps the memory between `start` and `end`, typically the
  /// `__heap_start` / `__heap_max` pair provided by a linker script.
  ///
  /// # Safety
  ///
  /// `[start, end)` must be valid for reads and writes for as long as the
  /// segment lives and must not be used by anything else.
  pub unsafe fn from_raw_parts(
    start: *mut u8,
    end: *mut u8,
  ) -> Result<Self, SegmentError> {
    let base = NonNull::new(start).ok_or(SegmentError::NullStart)?;

    if !is_aligned(start as usize) {
      return Err(SegmentError::Misaligned {
        start: start as usize,
        alignment: ALIGNMENT,
      });
    }

    let capacity = (end as usize).saturating_sub(start as usize);
    if capacity == 0 {
      return Err(SegmentError::Empty);
    }

    Ok(Self {
      base,
      top: 0,
      capacity,
      mapped: false,
    })
  }

  /// Extends the in-use region by `nbytes` and returns the offset where the
  /// new region starts, or `None` if the segment is not big enough. With
  /// `nbytes == 0` this is a pure query for the current top.
  pub fn reserve(
    &mut self,
    nbytes: usize,
  ) -> Option<usize> {
    let new_top = self.top.checked_add(nbytes)?;

    if new_top > self.capacity {
      return None;
    }

    let previous_top = self.top;
    self.top = new_top;

    Some(previous_top)
  }

  /// Offset one past the last reserved byte.
  pub fn top(&self) -> usize {
    self.top
  }

  /// Static upper bound of the segment in bytes.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Address of the first byte of the segment.
  pub fn start(&self) -> *const u8 {
    self.base.as_ptr()
  }

  /// Address of the current top.
  pub fn end(&self) -> *const u8 {
    self.address_of(self.top)
  }

  /// Converts an offset into an address inside the segment.
  pub fn address_of(
    &self,
    offset: usize,
  ) -> *mut u8 {
    self.base.as_ptr().wrapping_add(offset)
  }

  /// Converts an address back into an offset. `None` if the address lies
  /// outside the reserved region.
  pub fn offset_of(
    &self,
    address: *const u8,
  ) -> Option<usize> {
    let offset = (address as usize).checked_sub(self.base.as_ptr() as usize)?;
    (offset < self.top).then_some(offset)
  }

  fn check(
    &self,
    offset: usize,
    len: usize,
  ) -> Option<*mut u8> {
    let end = offset.checked_add(len)?;
    (end <= self.top).then(|| self.address_of(offset))
  }

  pub(crate) fn read_u32(
    &self,
    offset: usize,
  ) -> Option<u32> {
    let address = self.check(offset, size_of::<u32>())?;
    Some(unsafe { ptr::read_unaligned(address as *const u32) })
  }

  pub(crate) fn read_u64(
    &self,
    offset: usize,
  ) -> Option<u64> {
    let address = self.check(offset, size_of::<u64>())?;
    Some(unsafe { ptr::read_unaligned(address as *const u64) })
  }

  pub(crate) fn write_u32(
    &mut self,
    offset: usize,
    value: u32,
  ) -> Option<()> {
    let address = self.check(offset, size_of::<u32>())?;
    unsafe { ptr::write_unaligned(address as *mut u32, value) };
    Some(())
  }

  pub(crate) fn write_u64(
    &mut self,
    offset: usize,
    value: u64,
  ) -> Option<()> {
    let address = self.check(offset, size_of::<u64>())?;
    unsafe { ptr::write_unaligned(address as *mut u64, value) };
    Some(())
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    if !self.mapped {
      return;
    }

    let result = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.capacity) };
    if result != 0 {
      log::warn!("failed to unmap heap segment {:p}", self.base);
    }
  }
}

impl std::fmt::Debug for Segment {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>,
  ) -> std::fmt::Result {
    f.debug_struct("Segment")
      .field("start", &self.start())
      .field("top", &self.top)
      .field("capacity", &self.capacity)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reserve() {
    let mut segment = Segment::map(64).unwrap();

    assert_eq!(segment.reserve(0), Some(0));
    assert_eq!(segment.top(), 0);

    assert_eq!(segment.reserve(16), Some(0));
    assert_eq!(segment.reserve(40), Some(16));
    assert_eq!(segment.top(), 56);

    // Would cross the upper bound, top must not move.
    assert_eq!(segment.reserve(9), None);
    assert_eq!(segment.top(), 56);

    assert_eq!(segment.reserve(8), Some(56));
    assert_eq!(segment.reserve(0), Some(64));
    assert_eq!(segment.reserve(1), None);
    assert_eq!(segment.reserve(usize::MAX), None);
  }

  #[test]
  fn test_bounds_checked_access() {
    let mut segment = Segment::map(32).unwrap();

    // Nothing reserved yet, so nothing is accessible.
    assert_eq!(segment.read_u32(0), None);
    assert_eq!(segment.write_u64(0, 1), None);

    segment.reserve(16).unwrap();

    // Mapped memory starts out zeroed.
    assert_eq!(segment.read_u64(8), Some(0));

    segment.write_u32(4, 0xDEADBEEF).unwrap();
    assert_eq!(segment.read_u32(4), Some(0xDEADBEEF));

    segment.write_u64(8, 0x1122334455667788).unwrap();
    assert_eq!(segment.read_u64(8), Some(0x1122334455667788));

    assert_eq!(segment.read_u32(13), None);
    assert_eq!(segment.read_u64(usize::MAX), None);
  }

  #[test]
  fn test_offsets() {
    let mut segment = Segment::map(32).unwrap();
    segment.reserve(24).unwrap();

    let address = segment.address_of(8);
    assert_eq!(segment.offset_of(address), Some(8));
    assert_eq!(segment.offset_of(segment.end()), None);
    assert_eq!(segment.offset_of(ptr::null()), None);
    assert!(is_aligned(segment.start() as usize));
  }

  #[test]
  fn test_from_raw_parts() {
    let mut memory = [0u64; 8];
    let start = memory.as_mut_ptr() as *mut u8;
    let end = start.wrapping_add(size_of_val(&memory));

    let segment = unsafe { Segment::from_raw_parts(start, end) }.unwrap();
    assert_eq!(segment.capacity(), 64);

    let misaligned = unsafe { Segment::from_raw_parts(start.wrapping_add(1), end) };
    assert!(matches!(misaligned, Err(SegmentError::Misaligned { .. })));

    let empty = unsafe { Segment::from_raw_parts(start, start) };
    assert_eq!(empty.unwrap_err(), SegmentError::Empty);

    let null = unsafe { Segment::from_raw_parts(ptr::null_mut(), end) };
    assert_eq!(null.unwrap_err(), SegmentError::NullStart);
  }

  #[test]
  fn test_map_empty() {
    assert_eq!(Segment::map(0).unwrap_err(), SegmentError::Empty);
  }
}
