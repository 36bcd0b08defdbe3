//! Clock interface used to bound busy waits.
use core::ops::{Add, Sub};

/// Point in time on a monotonic clock. Two instants are a
/// [`Milliseconds`] span apart, and an instant plus a span is a later
/// instant. Clocks may wrap; only differences are meaningful.
pub trait Instant: Copy + Sub<Output = Milliseconds> + Add<Milliseconds, Output = Self> {}

/// Source of the current time.
pub trait Now {
    type I: Instant;
    fn now(&self) -> Self::I;
}

/// Span of time, in milliseconds. A zero span means "don't wait".
#[derive(Clone, Copy, Debug, Default, PartialOrd, Ord, PartialEq, Eq)]
pub struct Milliseconds(pub u32);

impl Milliseconds {
    pub fn is_zero(&self) -> bool { self.0 == 0 }
}

/// Adds `.ms()` to plain integers.
pub trait U32Ext {
    fn ms(self) -> Milliseconds;
}

impl U32Ext for u32 {
    fn ms(self) -> Milliseconds { Milliseconds(self) }
}
