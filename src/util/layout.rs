//! Layout utilities.

/// Align a size up to the given power-of-two alignment.
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round up to the next power of two, never below one.
///
/// Values past the largest representable power of two saturate to it.
#[inline]
pub fn next_power_of_two(value: usize) -> usize {
    value
        .max(1)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(24, 8), 24);
        assert_eq!(align_up(25, 16), 32);
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(64), 64);
        assert_eq!(next_power_of_two(usize::MAX), 1 << (usize::BITS - 1));
    }
}
