//! # redzone - A Guarded First-Fit Heap Allocator
//!
//! This crate provides a heap allocator for a single, fixed memory segment
//! with no operating system underneath: a bare-metal board, a boot loader or
//! any other environment where the linker hands out one region for the heap
//! and nothing ever hands out more.
//!
//! ## Overview
//!
//! Every allocation is a block. Blocks tile the segment from its start up to
//! a bump cursor (the heap top) that only moves forward:
//!
//! ```text
//!   Heap Segment:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                                                                      │
//!   │   ┌────────┬──────┬────────────┬──────┬────────────────────────────┐ │
//!   │   │   B1   │  B2  │     B3     │  B4  │      not yet reserved      │ │
//!   │   │ IN_USE │ FREE │   IN_USE   │IN_USE│                            │ │
//!   │   └────────┴──────┴────────────┴──────┴────────────────────────────┘ │
//!   │   ▲                                   ▲                            ▲ │
//!   │   │                                   │                            │ │
//!   │ __heap_start                       heap top                 __heap_max
//!   │                                                                      │
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Allocation walks the blocks in address order and takes the first free one
//! that is big enough, splitting it when the excess can stand on its own. If
//! none fits, a new block is carved at the heap top. Release merges the block
//! with its free neighbours.
//!
//! ## Crate Structure
//!
//! ```text
//!   redzone
//!   ├── align      - Allocation granularity (align!, align_up)
//!   ├── bump       - Segment: fixed memory range with a bump cursor
//!   ├── block      - Block layout: headers, guards, traversal
//!   ├── capture    - Call-path capture and rendering
//!   ├── heap       - Heap: allocate / release
//!   ├── report     - Heap dump, leak report, alerts
//!   └── error      - Error types
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redzone::{Heap, Segment};
//!
//! let segment = Segment::map(64 * 1024).expect("heap segment");
//! let mut heap = Heap::new(segment);
//!
//! heap.with_leak_report(|heap| {
//!   let ptr = heap.allocate(64) as *mut u64;
//!   assert!(!ptr.is_null());
//!
//!   unsafe { *ptr = 42 };
//!   heap.dump("after allocate(64)");
//!
//!   heap.release(ptr as *mut u8).expect("release");
//! });
//! ```
//!
//! On a board, build the segment from the linker symbols instead:
//!
//! ```rust,ignore
//! unsafe extern "C" {
//!   static mut __heap_start: u8;
//!   static mut __heap_max: u8;
//! }
//!
//! let segment = unsafe {
//!   Segment::from_raw_parts(&raw mut __heap_start, &raw mut __heap_max)
//! }?;
//! ```
//!
//! ## Blocks
//!
//! Each payload is bracketed by two headers. The guards on both sides of the
//! payload hold a fixed pattern that is checked on release, so writing past
//! either end of a payload is caught instead of silently corrupting the next
//! block:
//!
//! ```text
//!   Single Allocation:
//!   ┌──────────────────┬──────────────────────┬────────────────────────────┐
//!   │  Leading Header  │      User Data       │      Trailing Header       │
//!   │ ┌──────────────┐ │                      │ ┌────────────────────────┐ │
//!   │ │ size: N      │ │  ┌────────────────┐  │ │ guard: 0x99999999      │ │
//!   │ │ guard:       │ │  │  N bytes usable│  │ │ status: IN_USE / FREE  │ │
//!   │ │  0x99999999  │ │  │  (8 aligned)   │  │ │ call path: 3 addresses │ │
//!   │ └──────────────┘ │  └────────────────┘  │ └────────────────────────┘ │
//!   │     8 bytes      │                      │         32 bytes           │
//!   └──────────────────┴──────────────────────┴────────────────────────────┘
//!                      ▲
//!                      └── Pointer returned to user
//! ```
//!
//! The call path holds the return addresses of the code that requested the
//! block. It is only used for diagnostics: [`Heap::dump`] prints it for every
//! block in use and [`Heap::leak_report`] prints it for every block that was
//! never released.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization, never call it from an
//!   interrupt handler.
//! - **Fixed size**: The heap never grows past the segment.
//! - **Frame pointers**: Call paths need code compiled with frame pointers;
//!   this repository forces them in `.cargo/config.toml`.
//!
//! ## Safety
//!
//! Allocation and release are safe to call: every header access is bounds
//! checked against the heap top and a bogus pointer given to
//! [`Heap::release`] is refused. Using the returned memory is up to the
//! caller, through raw pointers, like any other allocator.

pub mod align;
pub mod block;
mod bump;
pub mod capture;
mod error;
mod heap;
mod report;

pub use block::{SENTINEL, Status};
pub use bump::Segment;
pub use capture::{CallPath, NoSymbols, Symbol, Symbolize, print_backtrace, write_backtrace};
#[cfg(unix)]
pub use capture::DynamicSymbols;
pub use error::{ReleaseError, SegmentError};
pub use heap::{BlockInfo, Heap, Stats};
pub use report::Console;
