//! Buffered byte stream transport interface.
use super::time::Milliseconds;
use crate::error::Error;

/// Outcome of a receive. Bytes may have been copied even when the
/// receive as a whole failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the caller's buffer.
    pub count: usize,
    pub status: Result<(), Error>,
}

impl Received {
    pub fn complete(count: usize) -> Self { Self { count, status: Ok(()) } }

    /// Nothing was copied.
    pub fn failed(error: Error) -> Self { Self { count: 0, status: Err(error) } }

    /// The count if the receive succeeded, discarding it otherwise.
    pub fn result(self) -> Result<usize, Error> { self.status.map(|_| self.count) }
}

/// Byte stream transport decoupled from its line by buffering, such as
/// a DMA backed serial port.
pub trait BufferedTransport {
    /// Bytes received and not yet consumed.
    fn available(&mut self) -> usize;

    /// Copies up to `buffer.len()` received bytes into `buffer`.
    ///
    /// When `blocking` and `timeout` is non zero, waits up to `timeout`
    /// for the full length to arrive. Whatever did arrive is copied
    /// either way, and a short count after the wait is reported as
    /// [`Error::Timeout`] alongside it. In any other mode a short count
    /// is not an error.
    fn receive(&mut self, buffer: &mut [u8], blocking: bool, timeout: Milliseconds) -> Received;

    /// Queues `data` for transmission, waiting for it to drain if
    /// `blocking`. Fails with [`Error::Busy`] while a previous
    /// transfer is in flight.
    fn send(&mut self, data: &[u8], blocking: bool) -> Result<(), Error>;

    /// Abandons in-flight transfers in the selected directions.
    fn flush(&mut self, transmit: bool, receive: bool);

    /// Whether a transmission is still in flight.
    fn is_busy(&mut self) -> bool;
}
