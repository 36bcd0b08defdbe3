//! The untrusted side's address space, as seen from the secure side.
//!
//! Addresses handed over by the untrusted side are only allegations
//! ([`NsSlice`]). They become usable ([`Claim`]) once
//! [`NonSecureMemory::claim`] has checked that the whole range lies in
//! memory the untrusted side owns, and only a claim gives access to the
//! bytes behind it.
use crate::utilities::memory::{Region, Span};
use core::ops::Range;

/// Size of an encoded [`SecureCallArgument`].
pub const ARGUMENT_SIZE: u32 = 8;

/// Buffer descriptor crossing the boundary: a base address and a length,
/// both little-endian words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureCallArgument {
    pub base: u32,
    pub length: u32,
}

impl SecureCallArgument {
    pub fn decode(bytes: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self { base: word(0), length: word(4) }
    }

    pub fn encode(&self) -> [u8; ARGUMENT_SIZE as usize] {
        let mut bytes = [0u8; ARGUMENT_SIZE as usize];
        bytes[..4].copy_from_slice(&self.base.to_le_bytes());
        bytes[4..].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    /// The range this descriptor alleges.
    pub fn slice(&self) -> Option<NsSlice> { NsSlice::from_raw(self.base, self.length) }
}

/// Address range alleged by the untrusted side. Carries no proof that
/// the caller owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NsSlice {
    span: Span,
}

impl NsSlice {
    /// Fails for ranges that wrap around the address space.
    pub fn from_raw(base: u32, length: u32) -> Option<Self> {
        base.checked_add(length)?;
        Some(Self { span: Span::new(base, length) })
    }

    pub fn base(&self) -> u32 { self.span.start }

    pub fn length(&self) -> u32 { self.span.length }
}

/// Validated range of untrusted memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claim {
    area: usize,
    range: Range<usize>,
    base: u32,
}

impl Claim {
    pub fn base(&self) -> u32 { self.base }

    pub fn len(&self) -> usize { self.range.len() }

    pub fn is_empty(&self) -> bool { self.range.is_empty() }
}

struct Area {
    span: Span,
    bytes: Vec<u8>,
}

/// Memory owned by the untrusted side: a set of disjoint areas.
#[derive(Default)]
pub struct NonSecureMemory {
    areas: Vec<Area>,
}

impl NonSecureMemory {
    pub fn new() -> Self { Self::default() }

    /// Adds a zeroed area of untrusted memory. Areas overlapping one
    /// already present are ignored.
    pub fn with_area(mut self, base: u32, length: u32) -> Self {
        let span = Span::new(base, length);
        if span.end().is_some() && !self.areas.iter().any(|a| a.span.overlaps(&span)) {
            self.areas.push(Area { span, bytes: vec![0; length as usize] });
        }
        self
    }

    /// Checks that the whole of `slice` lies in a single owned area.
    pub fn claim(&self, slice: NsSlice) -> Option<Claim> {
        self.areas.iter().enumerate().find_map(|(index, area)| {
            area.span.contains_range(slice.base(), slice.length()).then(|| {
                let start = (slice.base() - area.span.start) as usize;
                Claim { area: index, range: start..start + slice.length() as usize, base: slice.base() }
            })
        })
    }

    pub fn bytes(&self, claim: &Claim) -> &[u8] { &self.areas[claim.area].bytes[claim.range.clone()] }

    pub fn bytes_mut(&mut self, claim: &Claim) -> &mut [u8] {
        &mut self.areas[claim.area].bytes[claim.range.clone()]
    }
}
