//! Call-path capture by walking the frame-pointer chain.
//!
//! Every non-leaf function compiled with frame pointers leaves a two-word
//! record on the stack: the caller's frame pointer and the address execution
//! resumes at once the function returns. Following the saved frame pointers
//! yields the return addresses of all the active calls:
//!
//! ```text
//!   x86_64 / aarch64                      riscv64
//!
//!   fp + 8 │ return address │             fp - 8  │ return address │
//!   fp     │ saved fp       │ ──┐         fp - 16 │ saved fp       │ ──┐
//!          └────────────────┘   │                 └────────────────┘   │
//!                               ▼                                      ▼
//!                        caller's record                        caller's record
//! ```
//!
//! The walk only reads the stack and writes into the buffer it is given, so it
//! is safe to run in the middle of an allocation.

use std::{fmt, hint, ptr};

use crate::report::Console;

/// Number of return addresses kept per block.
pub const CAPTURE_DEPTH: usize = 3;

/// Frames printed by [`print_backtrace`].
const BACKTRACE_DEPTH: usize = 50;

/// Upper bound on the distance between two consecutive frame records. Links
/// going further than this are treated as the end of the chain.
const MAX_FRAME_DISTANCE: usize = 1 << 20;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod record {
  pub const SAVED_FP: isize = 0;
  pub const RETURN_ADDRESS: isize = 1;
}

#[cfg(target_arch = "riscv64")]
mod record {
  pub const SAVED_FP: isize = -2;
  pub const RETURN_ADDRESS: isize = -1;
}

/// Reads the frame pointer of the function the macro is expanded in. Zero on
/// targets without a known frame record layout.
macro_rules! frame_pointer {
  () => {{
    let fp: usize;

    #[cfg(target_arch = "x86_64")]
    unsafe {
      std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags))
    };

    #[cfg(target_arch = "aarch64")]
    unsafe {
      std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags))
    };

    #[cfg(target_arch = "riscv64")]
    unsafe {
      std::arch::asm!("mv {}, s0", out(reg) fp, options(nomem, nostack, preserves_flags))
    };

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    {
      fp = 0;
    }

    fp
  }};
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
unsafe fn read_word(
  fp: usize,
  word: isize,
) -> usize {
  unsafe { ptr::read((fp as *const usize).offset(word)) }
}

/// Follows the saved frame pointer of the record at `fp`. Returns `None` once
/// the link stops looking like a frame further up the same stack.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
unsafe fn parent(fp: usize) -> Option<usize> {
  let next = unsafe { read_word(fp, record::SAVED_FP) };

  let plausible = next != 0
    && next % size_of::<usize>() == 0
    && next > fp
    && next - fp <= MAX_FRAME_DISTANCE;

  plausible.then_some(next)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
unsafe fn return_address(fp: usize) -> usize {
  unsafe { read_word(fp, record::RETURN_ADDRESS) }
}

/// Fills `frames` with the return addresses of the active calls, most recent
/// first, and returns how many were written.
///
/// The walk skips `gather` itself and its caller: when an allocator calls
/// `gather`, the first address recorded lies inside the function that called
/// the allocator. Fewer than `frames.len()` addresses are written when the
/// chain ends early.
#[inline(never)]
pub fn gather(frames: &mut [u64]) -> usize {
  let fp: usize = frame_pointer!();

  #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
  {
    if fp == 0 {
      return 0;
    }

    let mut current = unsafe { parent(fp) };
    let mut count = 0;

    while count < frames.len() {
      let Some(frame) = current else {
        break;
      };

      let resume = unsafe { return_address(frame) };
      if resume == 0 {
        break;
      }

      frames[count] = resume as u64;
      count += 1;
      current = unsafe { parent(frame) };
    }

    hint::black_box(count)
  }

  #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
  {
    let _ = (fp, frames);
    hint::black_box(0)
  }
}

/// Return addresses recorded when a block was allocated, most recent caller
/// first. Unused slots are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallPath {
  slots: [u64; CAPTURE_DEPTH],
}

impl CallPath {
  pub const EMPTY: Self = Self {
    slots: [0; CAPTURE_DEPTH],
  };

  /// Builds a call path from raw slots. Everything after the first empty slot
  /// is dropped.
  pub fn from_slots(slots: [u64; CAPTURE_DEPTH]) -> Self {
    let mut path = Self::EMPTY;

    for (i, &slot) in slots.iter().enumerate() {
      if slot == 0 {
        break;
      }
      path.slots[i] = slot;
    }

    path
  }

  pub fn slots(&self) -> &[u64; CAPTURE_DEPTH] {
    &self.slots
  }

  /// The recorded addresses, without the empty slots.
  pub fn frames(&self) -> &[u64] {
    &self.slots[..self.len()]
  }

  pub fn len(&self) -> usize {
    self.slots.iter().take_while(|&&slot| slot != 0).count()
  }

  pub fn is_empty(&self) -> bool {
    self.slots[0] == 0
  }
}

/// Function name and byte offset that an address resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
  pub name: String,
  pub offset: usize,
}

/// Symbol lookup service used when rendering call paths.
pub trait Symbolize {
  fn label(
    &self,
    address: u64,
  ) -> Option<Symbol>;
}

/// Renders bare addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl Symbolize for NoSymbols {
  fn label(
    &self,
    _address: u64,
  ) -> Option<Symbol> {
    None
  }
}

/// Resolves addresses through the dynamic linker (`dladdr`). Only symbols
/// visible in the dynamic symbol table can be found; link with
/// `-rdynamic` to expose the executable's own functions.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicSymbols;

#[cfg(unix)]
impl Symbolize for DynamicSymbols {
  fn label(
    &self,
    address: u64,
  ) -> Option<Symbol> {
    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();

    let found = unsafe { libc::dladdr(address as usize as *const libc::c_void, info.as_mut_ptr()) };
    if found == 0 {
      return None;
    }

    let info = unsafe { info.assume_init() };
    if info.dli_sname.is_null() || info.dli_saddr.is_null() {
      return None;
    }

    let name = unsafe { std::ffi::CStr::from_ptr(info.dli_sname) };

    Some(Symbol {
      name: name.to_string_lossy().into_owned(),
      offset: (address as usize).wrapping_sub(info.dli_saddr as usize),
    })
  }
}

/// The symbol service available on the current platform.
pub fn platform_symbols() -> &'static dyn Symbolize {
  #[cfg(unix)]
  {
    &DynamicSymbols
  }

  #[cfg(not(unix))]
  {
    &NoSymbols
  }
}

/// Writes one line per frame: the address and, when `symbols` knows it,
/// `name+offset`.
pub fn render<W: fmt::Write>(
  out: &mut W,
  frames: &[u64],
  symbols: &dyn Symbolize,
) -> fmt::Result {
  for (i, &frame) in frames.iter().enumerate() {
    match symbols.label(frame) {
      Some(symbol) => writeln!(out, "#{} {:#x} at {}+{}", i, frame, symbol.name, symbol.offset)?,
      None => writeln!(out, "#{} {:#x}", i, frame)?,
    }
  }

  Ok(())
}

/// Writes the active calls of the caller to `out`, starting with the caller
/// itself.
#[inline(never)]
pub fn write_backtrace<W: fmt::Write>(
  out: &mut W,
  symbols: &dyn Symbolize,
) -> fmt::Result {
  let mut frames = [0u64; BACKTRACE_DEPTH];
  let count = gather(&mut frames);

  render(out, &frames[..count], symbols)
}

/// Same as [`write_backtrace`], to stdout.
#[inline(never)]
pub fn print_backtrace(symbols: &dyn Symbolize) {
  let mut frames = [0u64; BACKTRACE_DEPTH];
  let count = gather(&mut frames);

  if let Err(error) = render(&mut Console, &frames[..count], symbols) {
    log::warn!("failed to print backtrace: {}", error);
  }
}
