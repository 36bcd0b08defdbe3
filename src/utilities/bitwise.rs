//! Convenience bitwise operations for NOR style storage.

use core::ops::BitOr;

/// Value of every byte in a freshly erased page.
pub const ERASED_BYTE: u8 = 0xFF;

/// Checks that every '1' bit is a '1' on the
/// right hand side.
pub trait BitSubset: Copy {
    fn is_subset_of(self, rhs: Self) -> bool;
}

/// Variant of the BitSubset trait for slices.
pub trait SliceBitSubset {
    /// Checks that every '1' in self is '1' in rhs. A write of `self`
    /// over `rhs` can only succeed without an erase if this holds.
    fn is_subset_of(self, rhs: Self) -> bool;
}

/// Whether a region reads back as erased storage.
pub trait Erased {
    fn is_erased(&self) -> bool;
}

impl<U: Copy + BitOr<Output = Self> + PartialEq> BitSubset for U {
    fn is_subset_of(self, rhs: Self) -> bool { (self | rhs) == rhs }
}

impl<T: BitSubset> SliceBitSubset for &[T] {
    fn is_subset_of(self, rhs: Self) -> bool {
        self.len() <= rhs.len() && self.iter().zip(rhs.iter()).all(|(a, b)| a.is_subset_of(*b))
    }
}

impl Erased for [u8] {
    fn is_erased(&self) -> bool { self.iter().all(|b| *b == ERASED_BYTE) }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn programmed_bits_are_subsets_of_erased_bytes() {
        assert!(0x5Au8.is_subset_of(ERASED_BYTE));
        assert!(!ERASED_BYTE.is_subset_of(0x5Au8));
        assert!(0b0100u8.is_subset_of(0b0101));
    }

    #[test]
    fn slices_compare_bytewise() {
        let programmed = [0x12u8, 0x34, 0x56];
        let erased = [ERASED_BYTE; 3];
        assert!(programmed[..].is_subset_of(&erased[..]));
        assert!(!erased[..].is_subset_of(&programmed[..]));

        let longer = [ERASED_BYTE; 4];
        assert!(!longer[..].is_subset_of(&erased[..]));
    }

    #[test]
    fn erased_regions_are_all_ones() {
        assert!([ERASED_BYTE; 8][..].is_erased());
        assert!(![ERASED_BYTE, 0xFE][..].is_erased());
        assert!([0u8; 0][..].is_erased());
    }
}
