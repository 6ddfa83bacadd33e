use std::{fmt, ptr};

use crate::{
  align::{ALIGNMENT, align_up, is_aligned},
  block::{
    Block, Blocks, LEADING_SIZE, MAX_PAYLOAD, OVERHEAD, Status, read_leading, set_payload_size, set_status,
    write_block,
  },
  bump::Segment,
  capture::{self, CAPTURE_DEPTH, CallPath, Symbolize},
  error::ReleaseError,
  report::Console,
};

/// Running totals kept by the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
  /// Successful allocations.
  pub allocs: usize,
  /// Successful releases.
  pub frees: usize,
  /// Sum of all successful requests, before rounding.
  pub bytes_requested: usize,
}

impl Stats {
  pub fn in_use(&self) -> usize {
    self.allocs.saturating_sub(self.frees)
  }
}

/// Read-only view of one block, as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Address of the payload.
  pub address: *const u8,
  /// Payload size in bytes.
  pub size: usize,
  /// `None` when the status word has been overwritten.
  pub status: Option<Status>,
  pub guards_intact: bool,
  pub call_path: CallPath,
}

/// First-fit heap allocator over a fixed [`Segment`].
///
/// Blocks tile the segment from its start to its top with no gaps. Allocation
/// scans them in address order and takes the first free block that is large
/// enough, splitting off the excess when it can hold a block of its own.
/// When nothing fits, a new block is carved at the top of the segment.
///
/// ```text
///   ┌────────┬────────┬──────────────┬────────┬────────────────────────┐
///   │ IN_USE │  FREE  │    IN_USE    │  FREE  │   not yet reserved     │
///   └────────┴────────┴──────────────┴────────┴────────────────────────┘
///   start                                     top                 capacity
/// ```
///
/// Releasing a block checks its guards, marks it free and merges it with the
/// free blocks directly after and before it, so two free blocks are never
/// adjacent once a release has completed.
///
/// Diagnostics (dumps, leak reports and alerts about refused releases) are
/// written to `console`.
pub struct Heap<C: fmt::Write = Console> {
  pub(crate) segment: Segment,
  pub(crate) stats: Stats,
  pub(crate) console: C,
  pub(crate) symbols: &'static dyn Symbolize,
}

impl Heap<Console> {
  /// Creates a heap printing its diagnostics to stdout.
  pub fn new(segment: Segment) -> Self {
    Self::with_console(segment, Console)
  }
}

impl<C: fmt::Write> Heap<C> {
  pub fn with_console(
    segment: Segment,
    console: C,
  ) -> Self {
    Self {
      segment,
      stats: Stats::default(),
      console,
      symbols: capture::platform_symbols(),
    }
  }

  /// Replaces the symbol service used to label call paths.
  pub fn with_symbols(
    mut self,
    symbols: &'static dyn Symbolize,
  ) -> Self {
    self.symbols = symbols;
    self
  }

  pub fn segment(&self) -> &Segment {
    &self.segment
  }

  pub fn stats(&self) -> Stats {
    self.stats
  }

  pub fn console(&self) -> &C {
    &self.console
  }

  pub fn console_mut(&mut self) -> &mut C {
    &mut self.console
  }

  pub fn into_console(self) -> C {
    self.console
  }

  /// Every block from the segment start to its top.
  pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    Blocks::new(&self.segment).map(|block| BlockInfo {
      address: self.segment.address_of(block.payload()),
      size: block.payload_size as usize,
      status: block.status(),
      guards_intact: block.guards_intact(),
      call_path: block.call_path,
    })
  }

  /// Returns a pointer to at least `size` bytes, aligned to
  /// [`ALIGNMENT`], or null if `size` is zero or the segment cannot hold the
  /// request. The payload is not zeroed. The block remembers the call path
  /// of the function that called `allocate`.
  #[inline(never)]
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }

    let mut slots = [0u64; CAPTURE_DEPTH];
    capture::gather(&mut slots);
    let call_path = CallPath::from_slots(slots);

    let Some(needed) = align_up(size).filter(|&needed| needed <= MAX_PAYLOAD) else {
      log::warn!("allocate({}) is larger than any block can be", size);
      return ptr::null_mut();
    };

    let offset = match self.find_fit(needed) {
      Some(block) => self.claim(block, needed, &call_path),
      None => self.extend(needed, &call_path),
    };

    let Some(offset) = offset else {
      log::warn!(
        "allocate({}) failed, heap top {:#x} of {:#x}",
        size,
        self.segment.top(),
        self.segment.capacity()
      );
      return ptr::null_mut();
    };

    self.stats.allocs += 1;
    self.stats.bytes_requested = self.stats.bytes_requested.saturating_add(size);

    self.segment.address_of(offset + LEADING_SIZE)
  }

  /// Releases a pointer previously returned by [`Self::allocate`]. Null is
  /// accepted and ignored.
  ///
  /// The release is refused, with an alert on the console, when the pointer
  /// was not handed out by this heap, when the block is already free, or when
  /// the guards around the payload have been overwritten. A refused release
  /// leaves the heap untouched; in particular a damaged block stays in use.
  pub fn release(
    &mut self,
    ptr: *mut u8,
  ) -> Result<(), ReleaseError> {
    if ptr.is_null() {
      return Ok(());
    }

    let address = ptr as usize;

    let Some(offset) = self.owning_block(ptr) else {
      self.report_foreign(address);
      return Err(ReleaseError::Foreign { address });
    };

    let Some(block) = Block::read(&self.segment, offset) else {
      // The size field points past the top, the trailing header is gone.
      let (size, lead) = read_leading(&self.segment, offset).unwrap_or_default();
      self.report_damaged(address, lead, None, size, &CallPath::EMPTY);
      return Err(ReleaseError::Corrupted {
        address,
        lead,
        trail: None,
        size,
      });
    };

    if !block.guards_intact() || block.status().is_none() {
      self.report_damaged(
        address,
        block.lead_guard,
        Some(block.trail_guard),
        block.payload_size,
        &block.call_path,
      );
      return Err(ReleaseError::Corrupted {
        address,
        lead: block.lead_guard,
        trail: Some(block.trail_guard),
        size: block.payload_size,
      });
    }

    if block.is_free() {
      self.report_double_release(address, block.payload_size);
      return Err(ReleaseError::DoubleRelease { address });
    }

    let marked = set_status(&mut self.segment, block.trailing(), Status::Free);
    debug_assert!(marked.is_some(), "status of block at {:#x} out of bounds", block.offset);
    self.stats.frees += 1;

    self.coalesce(block);

    Ok(())
  }

  /// Runs `program` and prints the leak report once it returns.
  pub fn with_leak_report<R>(
    &mut self,
    program: impl FnOnce(&mut Self) -> R,
  ) -> R {
    let result = program(self);
    self.leak_report();
    result
  }

  /// Offset of the block whose payload starts at `ptr`.
  fn owning_block(
    &self,
    ptr: *const u8,
  ) -> Option<usize> {
    let payload = self.segment.offset_of(ptr)?;

    if !is_aligned(payload) {
      return None;
    }

    payload.checked_sub(LEADING_SIZE)
  }

  /// First free block with at least `needed` bytes of payload.
  fn find_fit(
    &self,
    needed: usize,
  ) -> Option<Block> {
    Blocks::new(&self.segment).find(|block| {
      if !block.is_free() || (block.payload_size as usize) < needed {
        return false;
      }

      if !block.guards_intact() {
        log::warn!("skipping free block at {:#x} with damaged guards", block.offset);
        return false;
      }

      true
    })
  }

  /// Turns the free `block` into an in-use block of `needed` bytes. The
  /// excess becomes a new free block when it has room for its own headers
  /// and a minimal payload.
  fn claim(
    &mut self,
    block: Block,
    needed: usize,
    call_path: &CallPath,
  ) -> Option<usize> {
    let excess = block.payload_size as usize - needed;

    if excess >= OVERHEAD + ALIGNMENT {
      let remainder = block.offset + OVERHEAD + needed;

      write_block(&mut self.segment, block.offset, needed, Status::InUse, call_path)?;
      write_block(&mut self.segment, remainder, excess - OVERHEAD, Status::Free, &CallPath::EMPTY)?;

      log::debug!(
        "split block at {:#x}: {} bytes in use, {} bytes free at {:#x}",
        block.offset,
        needed,
        excess - OVERHEAD,
        remainder
      );
    } else {
      write_block(
        &mut self.segment,
        block.offset,
        block.payload_size as usize,
        Status::InUse,
        call_path,
      )?;

      log::debug!("reused block at {:#x} ({} bytes)", block.offset, block.payload_size);
    }

    Some(block.offset)
  }

  /// Carves a new in-use block at the top of the segment.
  fn extend(
    &mut self,
    needed: usize,
    call_path: &CallPath,
  ) -> Option<usize> {
    let offset = self.segment.reserve(OVERHEAD.checked_add(needed)?)?;
    write_block(&mut self.segment, offset, needed, Status::InUse, call_path)?;

    log::debug!("heap grew to {:#x} for a {} byte block", self.segment.top(), needed);

    Some(offset)
  }

  /// Merges the freshly released `block` with the free blocks that follow it,
  /// then merges the result into the block before it if that one is free.
  fn coalesce(
    &mut self,
    block: Block,
  ) {
    let mut size = block.payload_size as usize;
    let mut next = block.next();

    while next < self.segment.top() {
      let Some(neighbor) = Block::read(&self.segment, next) else {
        break;
      };

      if !neighbor.is_free() || !neighbor.guards_intact() {
        break;
      }

      let Some(grown) = size.checked_add(neighbor.span()).filter(|&grown| grown <= MAX_PAYLOAD) else {
        break;
      };

      log::debug!("absorbing free block at {:#x} into {:#x}", neighbor.offset, block.offset);

      size = grown;
      next = neighbor.next();
    }

    if size != block.payload_size as usize {
      let resized = set_payload_size(&mut self.segment, block.offset, size);
      debug_assert!(resized.is_some(), "size of block at {:#x} out of bounds", block.offset);
    }

    let Some(previous) = self.predecessor(block.offset) else {
      return;
    };

    if !previous.is_free() || !previous.guards_intact() {
      return;
    }

    let merged = (previous.payload_size as usize)
      .checked_add(OVERHEAD)
      .and_then(|merged| merged.checked_add(size))
      .filter(|&merged| merged <= MAX_PAYLOAD);

    if let Some(merged) = merged {
      log::debug!("absorbing free block at {:#x} into {:#x}", block.offset, previous.offset);
      let resized = set_payload_size(&mut self.segment, previous.offset, merged);
      debug_assert!(resized.is_some(), "size of block at {:#x} out of bounds", previous.offset);
    }
  }

  /// The block that ends right where the block at `offset` starts.
  fn predecessor(
    &self,
    offset: usize,
  ) -> Option<Block> {
    let mut previous = None;

    for block in Blocks::new(&self.segment) {
      if block.offset >= offset {
        return previous.filter(|_| block.offset == offset);
      }
      previous = Some(block);
    }

    None
  }
}

impl<C: fmt::Write> fmt::Debug for Heap<C> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("Heap")
      .field("segment", &self.segment)
      .field("stats", &self.stats)
      .finish()
  }
}
