//! Utilities to reason about address ranges.

#[macro_export]
macro_rules! kb {
    ($val:expr) => {
        $val * 1024
    };
}

/// Abstract region that can contain addresses
pub trait Region {
    fn contains(&self, address: u32) -> bool;

    /// Whether every address in `[start, start + length)` lies in the
    /// region. Ranges that wrap around the address space never do.
    fn contains_range(&self, start: u32, length: u32) -> bool {
        match length {
            0 => self.contains(start),
            _ => match start.checked_add(length - 1) {
                Some(last) => self.contains(start) && self.contains(last),
                None => false,
            },
        }
    }
}

/// Contiguous span of addresses, `[start, start + length)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub length: u32,
}

impl Span {
    pub const fn new(start: u32, length: u32) -> Self { Self { start, length } }

    /// One past the last address, if representable.
    pub fn end(&self) -> Option<u32> { self.start.checked_add(self.length) }

    pub fn overlaps(&self, other: &Span) -> bool {
        let (self_end, other_end) = (self.start as u64 + self.length as u64, other.start as u64 + other.length as u64);
        self.length > 0
            && other.length > 0
            && (self.start as u64) < other_end
            && (other.start as u64) < self_end
    }
}

impl Region for Span {
    fn contains(&self, address: u32) -> bool {
        address >= self.start && ((address - self.start) < self.length)
    }
}

/// Rounds `value` down to a multiple of `granularity`.
pub fn align_down(value: u32, granularity: u32) -> u32 { value - (value % granularity) }

/// Rounds `value` up to a multiple of `granularity`, if representable.
pub fn align_up(value: u32, granularity: u32) -> Option<u32> {
    match value % granularity {
        0 => Some(value),
        remainder => value.checked_add(granularity - remainder),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spans_contain_their_own_addresses_only() {
        let span = Span::new(0x1000, kb!(4));
        assert!(span.contains(0x1000));
        assert!(span.contains(0x1FFF));
        assert!(!span.contains(0x2000));
        assert!(!span.contains(0x0FFF));
    }

    #[test]
    fn range_containment_rejects_wraparound_and_overhang() {
        let span = Span::new(0x1000, kb!(4));
        assert!(span.contains_range(0x1000, kb!(4)));
        assert!(span.contains_range(0x1800, 0x10));
        assert!(!span.contains_range(0x1800, kb!(4)));
        assert!(!span.contains_range(0xFFFF_FFF0, 0x20));
        assert!(!Span::new(0, u32::MAX).contains_range(u32::MAX, 2));
    }

    #[test]
    fn overlap_requires_shared_addresses() {
        let a = Span::new(0, 0x100);
        assert!(a.overlaps(&Span::new(0xFF, 1)));
        assert!(!a.overlaps(&Span::new(0x100, 0x100)));
        assert!(!a.overlaps(&Span::new(0x10, 0)));
    }

    #[test]
    fn alignment_rounds_to_granularity() {
        assert_eq!(align_down(2049, 2048), 2048);
        assert_eq!(align_down(2048, 2048), 2048);
        assert_eq!(align_up(2049, 2048), Some(4096));
        assert_eq!(align_up(0, 2048), Some(0));
        assert_eq!(align_up(u32::MAX, 2048), None);
    }
}
