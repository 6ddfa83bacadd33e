//! Human-readable heap diagnostics: dumps, the leak report printed at
//! shutdown, and the alerts raised when a release is refused.

use std::{
  fmt,
  io::{self, Write as _},
};

use crate::{
  block::{Block, Blocks, Status},
  bump::Segment,
  capture::{self, CallPath, Symbolize},
  heap::{Heap, Stats},
};

const RULE: &str = "=============================================";

/// Diagnostic sink writing to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console;

impl fmt::Write for Console {
  fn write_str(
    &mut self,
    s: &str,
  ) -> fmt::Result {
    io::stdout().write_all(s.as_bytes()).map_err(|_| fmt::Error)
  }
}

impl<C: fmt::Write> Heap<C> {
  /// Prints every block between the segment start and its top, followed by
  /// the running totals.
  pub fn dump(
    &mut self,
    label: &str,
  ) {
    let Self {
      segment,
      stats,
      console,
      symbols,
    } = self;

    let result = write_dump(console, label, segment, stats, *symbols);
    warn_on_failure("heap dump", result);
  }

  /// Prints every block that is still in use together with the call path
  /// that allocated it. Meant to run once, when the program is done.
  pub fn leak_report(&mut self) {
    let Self {
      segment,
      stats,
      console,
      symbols,
    } = self;

    let result = write_leak_report(console, segment, stats, *symbols);
    warn_on_failure("leak report", result);
  }

  pub(crate) fn report_damaged(
    &mut self,
    address: usize,
    lead: u32,
    trail: Option<u32>,
    size: u32,
    call_path: &CallPath,
  ) {
    log::error!("release of {:#x} refused, guards damaged", address);

    let symbols = self.symbols;
    let result = write_damage_alert(&mut self.console, address, lead, trail, size, call_path, symbols);
    warn_on_failure("corruption alert", result);
  }

  pub(crate) fn report_double_release(
    &mut self,
    address: usize,
    size: u32,
  ) {
    log::warn!("release of {:#x} refused, block already free", address);

    let result = write_alert_banner(&mut self.console).and_then(|_| {
      writeln!(
        self.console,
        "Attempt to release address {:#x}, block of size {} bytes is already free",
        address, size
      )
    });

    warn_on_failure("double release alert", result);
  }

  pub(crate) fn report_foreign(
    &mut self,
    address: usize,
  ) {
    log::warn!("release of {:#x} refused, not a block of this heap", address);

    let (start, end) = (self.segment.start(), self.segment.end());
    let result = write_alert_banner(&mut self.console).and_then(|_| {
      writeln!(
        self.console,
        "Attempt to release address {:#x}, not a block of the heap at {:p} - {:p}",
        address, start, end
      )
    });

    warn_on_failure("foreign pointer alert", result);
  }
}

fn warn_on_failure(
  what: &str,
  result: fmt::Result,
) {
  if result.is_err() {
    log::warn!("failed to write {} to the console", what);
  }
}

fn write_alert_banner<W: fmt::Write>(out: &mut W) -> fmt::Result {
  writeln!(out)?;
  writeln!(out, "{}", RULE)?;
  writeln!(out, " ***********  Heap Guard Alert  ************ ")?;
  writeln!(out, "{}", RULE)
}

fn write_damage_alert<W: fmt::Write>(
  out: &mut W,
  address: usize,
  lead: u32,
  trail: Option<u32>,
  size: u32,
  call_path: &CallPath,
  symbols: &dyn Symbolize,
) -> fmt::Result {
  write_alert_banner(out)?;
  write!(out, "Attempt to release address {:#x} with damaged guard(s): [{:#x}] ", address, lead)?;
  match trail {
    Some(trail) => writeln!(out, "[{:#x}]", trail)?,
    None => writeln!(out, "[unreadable]")?,
  }
  writeln!(out, "Block of size {} bytes, allocated by", size)?;
  capture::render(out, call_path.frames(), symbols)
}

fn write_status<W: fmt::Write>(
  out: &mut W,
  block: &Block,
) -> fmt::Result {
  match block.status() {
    Some(status) => write!(out, "{}", status),
    None => write!(out, "CORRUPT({:#x})", block.status),
  }
}

fn write_dump<W: fmt::Write>(
  out: &mut W,
  label: &str,
  segment: &Segment,
  stats: &Stats,
  symbols: &dyn Symbolize,
) -> fmt::Result {
  writeln!(out)?;
  writeln!(out, "---------- HEAP DUMP ({}) ----------", label)?;
  writeln!(out, "Heap segment at {:p} - {:p}", segment.start(), segment.end())?;

  for block in Blocks::new(segment) {
    write!(
      out,
      "{:p}: {} bytes, ",
      segment.address_of(block.payload()),
      block.payload_size
    )?;
    write_status(out, &block)?;
    if !block.guards_intact() {
      write!(out, ", guards [{:#x}] [{:#x}]", block.lead_guard, block.trail_guard)?;
    }
    writeln!(out)?;

    if block.status() == Some(Status::InUse) {
      capture::render(out, block.call_path.frames(), symbols)?;
    }
  }

  writeln!(out, "----------  END DUMP ({}) ----------", label)?;
  writeln!(
    out,
    "Stats: {} in-use ({} allocs, {} frees), {} total bytes requested",
    stats.in_use(),
    stats.allocs,
    stats.frees,
    stats.bytes_requested
  )?;
  writeln!(out)
}

fn write_leak_report<W: fmt::Write>(
  out: &mut W,
  segment: &Segment,
  stats: &Stats,
  symbols: &dyn Symbolize,
) -> fmt::Result {
  writeln!(out)?;
  writeln!(out, "{}", RULE)?;
  writeln!(out, "              Heap Leak Report               ")?;
  writeln!(out, "{}", RULE)?;
  writeln!(
    out,
    "final stats: {} allocs, {} frees, {} total bytes requested",
    stats.allocs, stats.frees, stats.bytes_requested
  )?;
  writeln!(out)?;

  let mut lost_blocks = 0;
  let mut lost_bytes = 0;

  for block in Blocks::new(segment).filter(|block| block.status() == Some(Status::InUse)) {
    writeln!(out, "{} bytes are lost, allocated by", block.payload_size)?;
    capture::render(out, block.call_path.frames(), symbols)?;
    writeln!(out)?;

    lost_blocks += 1;
    lost_bytes += block.payload_size as usize;
  }

  writeln!(out, "leak summary: {} bytes in {} blocks", lost_bytes, lost_blocks)
}
