use crate::{
  align::ALIGNMENT,
  bump::Segment,
  capture::{CAPTURE_DEPTH, CallPath},
};

/// Pattern written on both sides of every payload.
pub const SENTINEL: u32 = 0x9999_9999;

/// Size of the header that precedes the payload.
pub const LEADING_SIZE: usize = 8;

/// Size of the header that follows the payload.
pub const TRAILING_SIZE: usize = 8 + 8 * CAPTURE_DEPTH;

/// Bytes of metadata per block.
pub const OVERHEAD: usize = LEADING_SIZE + TRAILING_SIZE;

/// Largest payload a single block can describe. Bounded by the `u32` size
/// field, and on 32-bit targets by the room left for the headers.
pub const MAX_PAYLOAD: usize = {
  let limit = if (u32::MAX as usize) < usize::MAX - OVERHEAD {
    u32::MAX as usize
  } else {
    usize::MAX - OVERHEAD
  };
  limit & !(ALIGNMENT - 1)
};

// Leading header fields.
const SIZE_FIELD: usize = 0;
const LEAD_GUARD_FIELD: usize = 4;

// Trailing header fields.
const TRAIL_GUARD_FIELD: usize = 0;
const STATUS_FIELD: usize = 4;
const FRAMES_FIELD: usize = 8;

const _: () = assert!(LEADING_SIZE % ALIGNMENT == 0 && TRAILING_SIZE % ALIGNMENT == 0);

/// Allocation status stored in the trailing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
  InUse = 0,
  Free = 1,
}

impl Status {
  pub fn from_raw(raw: u32) -> Option<Self> {
    match raw {
      0 => Some(Self::InUse),
      1 => Some(Self::Free),
      _ => None,
    }
  }
}

impl std::fmt::Display for Status {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>,
  ) -> std::fmt::Result {
    match self {
      Self::InUse => f.write_str("IN_USE"),
      Self::Free => f.write_str("FREE"),
    }
  }
}

/// A block as laid out in the segment. Offsets are relative to the segment
/// start:
///
/// ```text
///   offset                                        trailing()
///     │                                                │
///     ▼                                                ▼
///     ┌──────────┬─────────┬───────────────────────────┬──────────┬──────────┬─────────────────┐
///     │ size u32 │ guard   │        payload            │ guard    │ status   │ call path       │
///     │          │ u32     │   (size bytes, 8-aligned) │ u32      │ u32      │ 3 x u64         │
///     └──────────┴─────────┴───────────────────────────┴──────────┴──────────┴─────────────────┘
///     ◄── leading (8) ────►▲                           ◄──────── trailing (32) ──────────────►
///                          │
///                     payload()
/// ```
///
/// The leading header is exactly 8 bytes, so the payload keeps the alignment
/// of the block start. The trailing header is a multiple of 8 bytes too, so
/// the next block starts aligned as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
  pub offset: usize,
  pub payload_size: u32,
  pub lead_guard: u32,
  pub trail_guard: u32,
  /// Raw status word. Anything other than [`Status`] values means the
  /// trailing header has been overwritten.
  pub status: u32,
  pub call_path: CallPath,
}

impl Block {
  /// Decodes the block whose leading header starts at `offset`. `None` when
  /// either header does not fit below the segment top.
  pub fn read(
    segment: &Segment,
    offset: usize,
  ) -> Option<Self> {
    let payload_size = segment.read_u32(offset + SIZE_FIELD)?;
    let lead_guard = segment.read_u32(offset + LEAD_GUARD_FIELD)?;

    let trailing = trailing_of(segment, offset)?;
    let trail_guard = segment.read_u32(trailing + TRAIL_GUARD_FIELD)?;
    let status = segment.read_u32(trailing + STATUS_FIELD)?;

    let mut slots = [0u64; CAPTURE_DEPTH];
    for (i, slot) in slots.iter_mut().enumerate() {
      *slot = segment.read_u64(trailing + FRAMES_FIELD + 8 * i)?;
    }

    Some(Self {
      offset,
      payload_size,
      lead_guard,
      trail_guard,
      status,
      call_path: CallPath::from_slots(slots),
    })
  }

  pub fn payload(&self) -> usize {
    self.offset + LEADING_SIZE
  }

  /// Offset of the trailing header. Only meaningful for blocks produced by
  /// [`Block::read`], which checked that it lies below the segment top.
  pub fn trailing(&self) -> usize {
    self.payload() + self.payload_size as usize
  }

  /// Offset of the leading header of the following block.
  pub fn next(&self) -> usize {
    next_of(self.trailing())
  }

  /// Whole span of the block, headers included.
  pub fn span(&self) -> usize {
    OVERHEAD + self.payload_size as usize
  }

  pub fn status(&self) -> Option<Status> {
    Status::from_raw(self.status)
  }

  pub fn is_free(&self) -> bool {
    self.status() == Some(Status::Free)
  }

  pub fn guards_intact(&self) -> bool {
    self.lead_guard == SENTINEL && self.trail_guard == SENTINEL
  }
}

/// Payload size and guard stored in the leading header at `leading`.
pub fn read_leading(
  segment: &Segment,
  leading: usize,
) -> Option<(u32, u32)> {
  Some((
    segment.read_u32(leading + SIZE_FIELD)?,
    segment.read_u32(leading + LEAD_GUARD_FIELD)?,
  ))
}

/// Offset of the trailing header of the block at `leading`, computed from the
/// payload size stored in its leading header.
pub fn trailing_of(
  segment: &Segment,
  leading: usize,
) -> Option<usize> {
  let payload_size = segment.read_u32(leading + SIZE_FIELD)?;
  leading.checked_add(LEADING_SIZE)?.checked_add(payload_size as usize)
}

/// Offset of the leading header that follows the trailing header at
/// `trailing`.
pub fn next_of(trailing: usize) -> usize {
  trailing + TRAILING_SIZE
}

/// Stamps a complete block at `offset`: size, fresh guards on both sides,
/// status and call path.
pub fn write_block(
  segment: &mut Segment,
  offset: usize,
  payload_size: usize,
  status: Status,
  call_path: &CallPath,
) -> Option<()> {
  let payload_size = u32::try_from(payload_size).ok()?;

  segment.write_u32(offset + SIZE_FIELD, payload_size)?;
  segment.write_u32(offset + LEAD_GUARD_FIELD, SENTINEL)?;

  let trailing = offset.checked_add(LEADING_SIZE)?.checked_add(payload_size as usize)?;
  segment.write_u32(trailing + TRAIL_GUARD_FIELD, SENTINEL)?;
  set_status(segment, trailing, status)?;
  set_call_path(segment, trailing, call_path)
}

/// Rewrites the payload size of the block at `offset`. Its trailing header
/// moves with it, the caller is responsible for what lies there.
pub fn set_payload_size(
  segment: &mut Segment,
  offset: usize,
  payload_size: usize,
) -> Option<()> {
  let payload_size = u32::try_from(payload_size).ok()?;
  segment.write_u32(offset + SIZE_FIELD, payload_size)
}

pub fn set_status(
  segment: &mut Segment,
  trailing: usize,
  status: Status,
) -> Option<()> {
  segment.write_u32(trailing + STATUS_FIELD, status as u32)
}

pub fn set_call_path(
  segment: &mut Segment,
  trailing: usize,
  call_path: &CallPath,
) -> Option<()> {
  for (i, &slot) in call_path.slots().iter().enumerate() {
    segment.write_u64(trailing + FRAMES_FIELD + 8 * i, slot)?;
  }
  Some(())
}

/// Walks every block from the segment start to its top.
pub struct Blocks<'a> {
  segment: &'a Segment,
  offset: usize,
}

impl<'a> Blocks<'a> {
  pub fn new(segment: &'a Segment) -> Self {
    Self { segment, offset: 0 }
  }
}

impl Iterator for Blocks<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let top = self.segment.top();
    if self.offset >= top {
      return None;
    }

    match Block::read(self.segment, self.offset) {
      Some(block) => {
        log::trace!("block at {:#x}: {} bytes, status {}", block.offset, block.payload_size, block.status);
        self.offset = block.next();
        Some(block)
      }
      None => {
        log::error!("block at {:#x} runs past heap top {:#x}, stopping traversal", self.offset, top);
        self.offset = top;
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn segment_with(reserved: usize) -> Segment {
    let mut segment = Segment::map(4096).unwrap();
    segment.reserve(reserved).unwrap();
    segment
  }

  #[test]
  fn test_header_sizes() {
    assert_eq!(LEADING_SIZE, 8);
    assert_eq!(TRAILING_SIZE, 32);
    assert_eq!(OVERHEAD, 40);
    assert_eq!(MAX_PAYLOAD % ALIGNMENT, 0);
  }

  #[test]
  fn test_write_and_read_block() {
    let mut segment = segment_with(OVERHEAD + 16);
    let path = CallPath::from_slots([0xAA, 0xBB, 0]);

    write_block(&mut segment, 0, 16, Status::InUse, &path).unwrap();

    let block = Block::read(&segment, 0).unwrap();
    assert_eq!(block.payload_size, 16);
    assert_eq!(block.payload(), LEADING_SIZE);
    assert_eq!(block.trailing(), LEADING_SIZE + 16);
    assert_eq!(block.next(), OVERHEAD + 16);
    assert_eq!(block.status(), Some(Status::InUse));
    assert!(block.guards_intact());
    assert_eq!(block.call_path, path);

    // Guards sit right next to the payload.
    assert_eq!(segment.read_u32(4), Some(SENTINEL));
    assert_eq!(segment.read_u32(LEADING_SIZE + 16), Some(SENTINEL));
  }

  #[test]
  fn test_navigation() {
    let mut segment = segment_with(2 * OVERHEAD + 24 + 8);

    write_block(&mut segment, 0, 24, Status::Free, &CallPath::EMPTY).unwrap();
    let second = next_of(trailing_of(&segment, 0).unwrap());
    assert_eq!(second, OVERHEAD + 24);

    write_block(&mut segment, second, 8, Status::InUse, &CallPath::EMPTY).unwrap();

    let blocks: Vec<_> = Blocks::new(&segment).collect();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[0].is_free());
    assert_eq!(blocks[1].offset, second);
    assert_eq!(blocks[1].next(), segment.top());
  }

  #[test]
  fn test_damaged_size_stops_traversal() {
    let mut segment = segment_with(OVERHEAD + 8);

    write_block(&mut segment, 0, 8, Status::InUse, &CallPath::EMPTY).unwrap();
    set_payload_size(&mut segment, 0, 4096).unwrap();

    assert_eq!(Block::read(&segment, 0), None);
    assert_eq!(Blocks::new(&segment).count(), 0);
  }

  #[test]
  fn test_largest_size_field() {
    let mut segment = segment_with(OVERHEAD + 8);

    write_block(&mut segment, 0, 8, Status::InUse, &CallPath::EMPTY).unwrap();
    segment.write_u32(0, u32::MAX).unwrap();

    assert_eq!(Block::read(&segment, 0), None);
    assert_eq!(trailing_of(&segment, 0), LEADING_SIZE.checked_add(u32::MAX as usize));
    assert_eq!(Blocks::new(&segment).count(), 0);
  }

  #[test]
  fn test_max_payload_leaves_room_for_headers() {
    assert!(MAX_PAYLOAD.checked_add(OVERHEAD).is_some());
    assert!(MAX_PAYLOAD <= u32::MAX as usize);
  }

  #[test]
  fn test_status_from_raw() {
    assert_eq!(Status::from_raw(0), Some(Status::InUse));
    assert_eq!(Status::from_raw(1), Some(Status::Free));
    assert_eq!(Status::from_raw(0x99), None);
    assert_eq!(Status::Free.to_string(), "FREE");
  }
}
