//! Raw storage device interface.
//!
//! Addresses are absolute device addresses. Operations may yield with
//! `nb::Error::WouldBlock` while the device is busy; callers drive them
//! to completion with `nb::block!`.
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Operations a storage device supports.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const ERASE = 1 << 2;
        /// The device sits behind a communication bus (e.g. SPI) rather
        /// than being memory mapped.
        const COMMUNICATION = 1 << 3;
    }
}

impl Default for Capabilities {
    fn default() -> Self { Capabilities::empty() }
}

/// Static description of a raw device, as reported by the device itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    /// Erase granularity in bytes.
    pub page_size: u32,
    /// Minimum write granularity in bytes.
    pub word_size: u32,
    /// Total addressable bytes.
    pub capacity: u32,
    pub capabilities: Capabilities,
}

/// Page erasable storage with NOR semantics: erased bytes read as `0xFF`
/// and writes can only clear bits.
pub trait RawStorage {
    type Error: Clone + Copy + fmt::Debug;

    /// Geometry of the device, or `None` if it can't be reached.
    fn geometry(&mut self) -> Option<Geometry>;
    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;
    fn write(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error>;
    /// Erases `length` bytes from `address`. Both must be page aligned.
    fn erase(&mut self, address: u32, length: u32) -> nb::Result<(), Self::Error>;
    fn is_busy(&mut self) -> bool;
}
