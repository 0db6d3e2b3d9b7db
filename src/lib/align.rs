//! Power-of-two offset alignment.

/// Rounds `offset` up to the next multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; anything else yields an
/// unspecified result.
#[inline]
pub const fn align_up(offset: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_align_examples() {
        assert_eq!(align_up(3, 4), 4);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(5, 1), 5);
    }

    proptest! {
        #[test]
        fn prop_align_up_bounds(offset in 0usize..1 << 20, shift in 0u32..12) {
            let alignment = 1usize << shift;
            let aligned = align_up(offset, alignment);
            prop_assert!(aligned >= offset);
            prop_assert_eq!(aligned % alignment, 0);
            prop_assert!(aligned < offset + alignment);
        }
    }
}
