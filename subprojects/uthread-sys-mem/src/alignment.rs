//! Memory alignment utilities for page-aligned operations.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fallback page size used if the host refuses to report one.
const FALLBACK_PAGE_SIZE: usize = 0x1000;

/// Cached result of `sysconf(_SC_PAGESIZE)`; zero until first queried.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the page size of the host, in bytes.
///
/// The value is queried once and cached. It is always a power of two.
#[inline]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    // SAFETY: `sysconf` has no preconditions.
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = match usize::try_from(queried) {
        Ok(size) if size.is_power_of_two() => size,
        _ => FALLBACK_PAGE_SIZE,
    };

    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Rounds up a size to the next page boundary.
///
/// If the size is already page-aligned, it returns the same value. Returns
/// `None` if rounding overflows.
#[inline]
pub fn round_up_to_page(size: usize) -> Option<usize> {
    let mask = page_size() - 1;
    size.checked_add(mask).map(|s| s & !mask)
}

/// Calculates the number of pages needed to hold `size` bytes.
///
/// This rounds up to ensure all bytes are covered.
#[inline]
pub fn pages_needed(size: usize) -> usize {
    size.div_ceil(page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 0x1000);
    }

    #[test]
    fn rounding_helpers_agree() {
        let page = page_size();

        assert_eq!(pages_needed(0), 0);
        assert_eq!(pages_needed(1), 1);
        assert_eq!(pages_needed(page), 1);
        assert_eq!(pages_needed(page + 1), 2);

        assert_eq!(round_up_to_page(1), Some(page));
        assert_eq!(round_up_to_page(page), Some(page));
        assert_eq!(round_up_to_page(usize::MAX), None);
    }
}
