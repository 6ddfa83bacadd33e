use std::ptr;

use redzone::{Heap, Segment, capture::platform_symbols, print_backtrace};

/// Size of the demo heap segment.
const HEAP_SIZE: usize = 16 * 1024;

/// Fills a payload with a byte pattern to show it's usable.
unsafe fn fill(
  ptr: *mut u8,
  len: usize,
  byte: u8,
) {
  unsafe { ptr::write_bytes(ptr, byte, len) };
}

fn main() {
  // RUST_LOG=debug shows splits, coalescing and heap growth as they happen.
  env_logger::init();

  let segment = match Segment::map(HEAP_SIZE) {
    Ok(segment) => segment,
    Err(error) => {
      eprintln!("cannot set up the heap: {error}");
      std::process::exit(1);
    }
  };

  let mut heap = Heap::new(segment);

  // The leak report runs once the closure returns, like a program epilogue.
  heap.with_leak_report(|heap| {
    heap.dump("empty");

    // --------------------------------------------------------------------
    // 1) Two allocations carved at the heap top.
    // --------------------------------------------------------------------
    let first = heap.allocate(64);
    unsafe { fill(first, 64, 0xAB) };

    let second = heap.allocate(4);
    unsafe { fill(second, 4, 0xCD) };

    heap.dump("after allocate(64), allocate(4)");

    // --------------------------------------------------------------------
    // 2) Releasing the first block and asking for a small one again reuses
    //    the front of the freed block and leaves the rest free.
    // --------------------------------------------------------------------
    if let Err(error) = heap.release(first) {
      eprintln!("release failed: {error}");
    }

    let third = heap.allocate(4);
    println!(
      "third == first? {}",
      if third == first {
        "Yes, it reused the freed block"
      } else {
        "No, it allocated somewhere else"
      }
    );

    heap.dump("after release(first), allocate(4)");

    // --------------------------------------------------------------------
    // 3) Writing one byte past the end of a payload damages the guard, and
    //    the release is refused with an alert.
    // --------------------------------------------------------------------
    let victim = heap.allocate(16);
    unsafe { *victim.add(16) = 0x41 };

    if let Err(error) = heap.release(victim) {
      println!("release refused: {error}");
    }

    // --------------------------------------------------------------------
    // 4) Requests bigger than the segment fail without touching the heap.
    // --------------------------------------------------------------------
    let huge = heap.allocate(HEAP_SIZE + 1);
    println!("allocate({}) returned null? {}", HEAP_SIZE + 1, huge.is_null());

    println!("\nCurrent backtrace:");
    print_backtrace(platform_symbols());

    // `second`, `third` and `victim` are never released and show up in the
    // leak report.
  });
}
