//! DMA engine interface for byte streams.
//!
//! A receive channel writes incoming line data straight into memory
//! owned by the driver, one armed window at a time. A transmit channel
//! streams a prepared buffer out to the line and reports completion.
//! Both run concurrently with the CPU; the driver only ever observes
//! their progress by polling.

/// Receive half of a DMA engine.
pub trait RxChannel {
    /// Moves whatever has arrived on the line into `window`, from its
    /// start, and returns how many bytes were written. The engine never
    /// writes past the end of `window`.
    fn transfer(&mut self, window: &mut [u8]) -> usize;

    /// Abandons any transfer in flight.
    fn abort_receive(&mut self);
}

/// Transmit half of a DMA engine.
pub trait TxChannel {
    /// Starts streaming `data` to the line.
    fn start(&mut self, data: &[u8]);

    /// Whether the last started transfer has fully drained.
    fn is_complete(&mut self) -> bool;

    /// Abandons the transfer in flight. Any number of its bytes may
    /// already have reached the line.
    fn abort_transmit(&mut self);
}
