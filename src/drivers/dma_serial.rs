//! Double buffered, DMA backed serial transport.
//!
//! The receive ring is split in two halves. The DMA engine fills one
//! armed half at a time while the consumer drains the other; a half is
//! only handed back to the engine once the consumer has read past its
//! end. When the engine finishes a half and the next one has not been
//! drained yet it stalls, and resumes as soon as the consumer releases
//! that half.
//!
//! ```text
//!        half 0          half 1
//!  [ ........|...... ][ .............. ]
//!            ^ consumer       ^ producer (armed on half 1)
//! ```
use crate::{
    error::Error,
    hal::{
        dma::{RxChannel, TxChannel},
        serial::{BufferedTransport, Received},
        time::{Milliseconds, Now},
    },
};
use ufmt::uWrite;

pub struct BufferedSerial<D, T, const RX: usize, const TX: usize>
where
    D: RxChannel + TxChannel,
    T: Now,
{
    dma: D,
    clock: T,
    rx: [u8; RX],
    /// Next ring index the engine writes.
    producer: usize,
    /// Next ring index the consumer reads.
    consumer: usize,
    /// Halves the engine may be armed on.
    half_available: [bool; 2],
    /// Half the engine is filling. `None` while stalled.
    armed: Option<usize>,
    tx: [u8; TX],
    transmitting: bool,
}

impl<D, T, const RX: usize, const TX: usize> BufferedSerial<D, T, RX, TX>
where
    D: RxChannel + TxChannel,
    T: Now,
{
    const HALF: usize = RX / 2;

    /// Takes over the DMA engine and arms it on the first half.
    pub fn new(dma: D, clock: T) -> Self {
        assert!(RX >= 2 && RX % 2 == 0, "Receive ring must split in two equal halves");
        assert!(TX >= 2, "Transmit buffer too small");
        Self {
            dma,
            clock,
            rx: [0; RX],
            producer: 0,
            consumer: 0,
            half_available: [false, true],
            armed: Some(0),
            tx: [0; TX],
            transmitting: false,
        }
    }

    pub fn capacity(&self) -> usize { RX }

    /// Bytes received and not yet consumed, after collecting whatever
    /// the engine has moved since the last call.
    pub fn available_bytes(&mut self) -> usize {
        self.pump();
        self.buffered()
    }

    pub fn dma(&self) -> &D { &self.dma }

    pub fn dma_mut(&mut self) -> &mut D { &mut self.dma }

    fn reset_ring(&mut self) {
        self.producer = 0;
        self.consumer = 0;
        self.half_available = [false, true];
        self.armed = Some(0);
    }

    fn buffered(&self) -> usize {
        match (self.producer == self.consumer, self.armed) {
            // Stalled right on the consumer: every byte of the ring is unread.
            (true, None) => RX,
            (true, Some(_)) => 0,
            _ => (self.producer + RX - self.consumer) % RX,
        }
    }

    /// Lets the engine fill the armed half, moving on to the next half
    /// when it is available.
    fn pump(&mut self) {
        loop {
            let half = match self.armed {
                Some(half) => half,
                None => {
                    let next = self.producer / Self::HALF;
                    if !self.half_available[next] {
                        return;
                    }
                    self.half_available[next] = false;
                    self.armed = Some(next);
                    next
                }
            };

            let end = (half + 1) * Self::HALF;
            let moved = self.dma.transfer(&mut self.rx[self.producer..end]);
            self.producer += moved;
            if self.producer != end {
                return;
            }
            self.producer %= RX;
            self.armed = None;
        }
    }

    fn consume(&mut self, buffer: &mut [u8]) {
        let mut copied = 0;
        while copied < buffer.len() {
            let half_end = (self.consumer / Self::HALF + 1) * Self::HALF;
            let length = (half_end - self.consumer).min(buffer.len() - copied);
            buffer[copied..copied + length]
                .copy_from_slice(&self.rx[self.consumer..self.consumer + length]);
            copied += length;
            self.consumer += length;
            if self.consumer == half_end {
                self.half_available[half_end / Self::HALF - 1] = true;
                self.consumer %= RX;
            }
        }
    }

    fn wait_for(&mut self, length: usize, timeout: Milliseconds) -> Result<(), Error> {
        let start = self.clock.now();
        while self.available_bytes() < length {
            if self.clock.now() - start > timeout {
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }
}

impl<D, T, const RX: usize, const TX: usize> BufferedTransport for BufferedSerial<D, T, RX, TX>
where
    D: RxChannel + TxChannel,
    T: Now,
{
    fn available(&mut self) -> usize { self.available_bytes() }

    fn receive(
        &mut self,
        buffer: &mut [u8],
        blocking: bool,
        timeout: Milliseconds,
    ) -> Received {
        let status =
            if blocking && !timeout.is_zero() { self.wait_for(buffer.len(), timeout) } else { Ok(()) };
        let count = buffer.len().min(self.available_bytes());
        self.consume(&mut buffer[..count]);
        self.pump();
        Received { count, status }
    }

    fn send(&mut self, data: &[u8], blocking: bool) -> Result<(), Error> {
        if data.len() >= TX {
            return Err(Error::InvalidArgument("Transfer does not fit the transmit buffer"));
        }
        if self.is_busy() {
            return Err(Error::Busy);
        }
        self.tx[..data.len()].copy_from_slice(data);
        self.dma.start(&self.tx[..data.len()]);
        self.transmitting = true;
        if blocking {
            // Bounded by the engine draining the buffer.
            while self.is_busy() {
                core::hint::spin_loop();
            }
        }
        Ok(())
    }

    fn flush(&mut self, transmit: bool, receive: bool) {
        if transmit {
            self.dma.abort_transmit();
            self.transmitting = false;
        }
        if receive {
            self.dma.abort_receive();
            self.reset_ring();
        }
    }

    fn is_busy(&mut self) -> bool {
        if self.transmitting && self.dma.is_complete() {
            self.transmitting = false;
        }
        self.transmitting
    }
}

impl<D, T, const RX: usize, const TX: usize> uWrite for BufferedSerial<D, T, RX, TX>
where
    D: RxChannel + TxChannel,
    T: Now,
{
    type Error = Error;

    fn write_str(&mut self, s: &str) -> Result<(), Self::Error> {
        while self.is_busy() {
            core::hint::spin_loop();
        }
        for chunk in s.as_bytes().chunks(TX - 1) {
            self.send(chunk, true)?;
        }
        Ok(())
    }
}
