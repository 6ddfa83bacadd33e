/// Allocation granularity. Every payload size is a multiple of this value and
/// every payload address returned to the client is aligned to it, on 32 and
/// 64 bit targets alike.
pub const ALIGNMENT: usize = 8;

/// Rounds `value` up to the next multiple of [`ALIGNMENT`].
///
/// Meant for constant expressions such as header sizes; it wraps around on
/// overflow, use [`align_up`] for untrusted sizes.
///
/// # Examples
///
/// ```rust
/// use redzone::align;
///
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(16), 16);
/// assert_eq!(align!(0), 0);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    ($value + $crate::align::ALIGNMENT - 1) & !($crate::align::ALIGNMENT - 1)
  };
}

/// Checked version of [`align!`] for client requests. Returns `None` when
/// rounding up would overflow `usize`.
pub const fn align_up(value: usize) -> Option<usize> {
  match value.checked_add(ALIGNMENT - 1) {
    Some(padded) => Some(padded & !(ALIGNMENT - 1)),
    None => None,
  }
}

/// Whether `value` is a multiple of [`ALIGNMENT`].
pub const fn is_aligned(value: usize) -> bool {
  value & (ALIGNMENT - 1) == 0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align() {
    let mut alignments = Vec::new();

    for i in 0..10 {
      let sizes = (ALIGNMENT * i + 1)..=(ALIGNMENT * (i + 1));

      let expected_alignment = ALIGNMENT * (i + 1);

      alignments.push((sizes, expected_alignment));
    }

    for (sizes, expected) in alignments {
      for size in sizes {
        assert_eq!(expected, align!(size));
        assert_eq!(Some(expected), align_up(size));
        assert!(is_aligned(expected));
      }
    }
  }

  #[test]
  fn test_align_up_overflow() {
    assert_eq!(align_up(usize::MAX), None);
    assert_eq!(align_up(usize::MAX - (ALIGNMENT - 2)), None);
    assert!(align_up(usize::MAX - ALIGNMENT).is_some());
    assert_eq!(align_up(0), Some(0));
    assert!(!is_aligned(ALIGNMENT + 1));
  }
}
