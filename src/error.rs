use thiserror::Error;

/// Reasons a [`crate::Segment`] could not be set up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
  #[error("heap segment start is null")]
  NullStart,

  #[error("heap segment start {start:#x} is not aligned to {alignment} bytes")]
  Misaligned { start: usize, alignment: usize },

  #[error("heap segment is empty")]
  Empty,

  #[error("failed to map {capacity} bytes for the heap segment (errno {errno})")]
  MapFailed { capacity: usize, errno: i32 },
}

/// Reasons [`crate::Heap::release`] refused to release a pointer. In every
/// case the heap is left exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReleaseError {
  /// The pointer does not point at a payload inside the in-use part of the
  /// heap segment.
  #[error("address {address:#x} was not handed out by this heap")]
  Foreign { address: usize },

  /// One or both guards around the payload were overwritten. `trail` is
  /// `None` when the leading size field is damaged badly enough that the
  /// trailing header falls outside the heap.
  #[error("address {address:#x} has damaged guards [{lead:#x}] [{}]", guard_text(.trail))]
  Corrupted {
    address: usize,
    lead: u32,
    trail: Option<u32>,
    size: u32,
  },

  /// The block is already free.
  #[error("address {address:#x} is already free")]
  DoubleRelease { address: usize },
}

fn guard_text(guard: &Option<u32>) -> String {
  match guard {
    Some(value) => format!("{value:#x}"),
    None => "?".to_string(),
  }
}
