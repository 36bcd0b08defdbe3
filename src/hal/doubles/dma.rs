use crate::hal::dma::{RxChannel, TxChannel};
use std::collections::VecDeque;

/// Simulated DMA engine attached to a serial line.
///
/// Bytes queued with [`FakeDma::arrive`] are moved into the driver's
/// receive window on each poll, at most `burst` at a time. Transmitted
/// bytes land in [`FakeDma::line`], and are looped back into the receive
/// queue when loopback is enabled.
pub struct FakeDma {
    incoming: VecDeque<u8>,
    burst: usize,
    loopback: bool,
    /// Everything that reached the line through the transmit channel.
    pub line: Vec<u8>,
    pending_transmit: Option<Vec<u8>>,
    polls_per_transmit: usize,
    polls_left: usize,
}

impl Default for FakeDma {
    fn default() -> Self { Self::new() }
}

impl FakeDma {
    pub fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            burst: usize::MAX,
            loopback: false,
            line: Vec::new(),
            pending_transmit: None,
            polls_per_transmit: 0,
            polls_left: 0,
        }
    }

    /// Transmitted bytes are fed back to the receive side.
    pub fn with_loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Limits how many bytes each receive poll can move.
    pub fn with_burst(mut self, burst: usize) -> Self {
        self.burst = burst.max(1);
        self
    }

    /// Transmissions need this many completion polls to drain.
    pub fn with_transmit_latency(mut self, polls: usize) -> Self {
        self.polls_per_transmit = polls;
        self
    }

    /// Queues bytes as if they just arrived on the line.
    pub fn arrive(&mut self, bytes: &[u8]) { self.incoming.extend(bytes.iter().copied()); }

    /// Bytes waiting on the line that the engine has not moved yet.
    pub fn pending(&self) -> usize { self.incoming.len() }

    fn drain_transmit(&mut self) {
        if let Some(data) = self.pending_transmit.take() {
            if self.loopback {
                self.incoming.extend(data.iter().copied());
            }
            self.line.extend(data);
        }
    }
}

impl RxChannel for FakeDma {
    fn transfer(&mut self, window: &mut [u8]) -> usize {
        let count = window.len().min(self.burst).min(self.incoming.len());
        window.iter_mut().zip(self.incoming.drain(..count)).for_each(|(o, i)| *o = i);
        count
    }

    fn abort_receive(&mut self) {}
}

impl TxChannel for FakeDma {
    fn start(&mut self, data: &[u8]) {
        self.pending_transmit = Some(data.to_vec());
        self.polls_left = self.polls_per_transmit;
        if self.polls_left == 0 {
            self.drain_transmit();
        }
    }

    fn is_complete(&mut self) -> bool {
        if self.pending_transmit.is_some() {
            self.polls_left = self.polls_left.saturating_sub(1);
            if self.polls_left == 0 {
                self.drain_transmit();
            }
        }
        self.pending_transmit.is_none()
    }

    fn abort_transmit(&mut self) { self.pending_transmit = None; }
}
