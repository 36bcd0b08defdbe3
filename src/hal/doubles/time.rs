use crate::hal::time::{self, Milliseconds};
use core::cell::Cell;

/// Instant reported by [`MockSysTick`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MockInstant(pub u32);

/// Clock that moves forward by a fixed step every time it is read,
/// so busy-wait loops terminate deterministically.
pub struct MockSysTick {
    ticks: Cell<u32>,
    step: u32,
}

impl MockSysTick {
    pub fn new(step: Milliseconds) -> Self { Self { ticks: Cell::new(0), step: step.0 } }

    pub fn elapsed(&self) -> Milliseconds { Milliseconds(self.ticks.get()) }
}

impl Default for MockSysTick {
    fn default() -> Self { Self::new(Milliseconds(1)) }
}

impl time::Instant for MockInstant {}

impl time::Now for MockSysTick {
    type I = MockInstant;
    fn now(&self) -> MockInstant {
        let now = self.ticks.get();
        self.ticks.set(now.wrapping_add(self.step));
        MockInstant(now)
    }
}

impl core::ops::Sub for MockInstant {
    type Output = Milliseconds;
    fn sub(self, rhs: Self) -> Milliseconds { Milliseconds(self.0.wrapping_sub(rhs.0)) }
}

impl core::ops::Add<Milliseconds> for MockInstant {
    type Output = Self;
    fn add(self, rhs: Milliseconds) -> Self { MockInstant(self.0.wrapping_add(rhs.0)) }
}
