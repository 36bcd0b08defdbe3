use crate::{
    error::{Convertible, Error, StorageFault},
    hal::flash::{Capabilities, Geometry, RawStorage},
    utilities::bitwise::{SliceBitSubset, ERASED_BYTE},
};

/// In-memory NOR flash. Starts fully erased, only allows writes that
/// clear bits, and erases whole pages.
pub struct FakeFlash {
    data: Vec<u8>,
    geometry: Geometry,
    reachable: bool,
    busy_polls: usize,
    /// Base address of every page erased so far, in order.
    pub erased_pages: Vec<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FakeFlashError {
    OutOfBounds,
    Misaligned,
    BitsNotErased,
    Unreachable,
}

impl Convertible for FakeFlashError {
    fn into(self) -> Error { Error::Storage(StorageFault(self as u32 + 1)) }
}

impl FakeFlash {
    pub fn new(page_size: u32, capacity: u32) -> Self {
        assert!(page_size > 0 && capacity % page_size == 0);
        Self {
            data: vec![ERASED_BYTE; capacity as usize],
            geometry: Geometry {
                page_size,
                word_size: 4,
                capacity,
                capabilities: Capabilities::READ | Capabilities::WRITE | Capabilities::ERASE,
            },
            reachable: true,
            busy_polls: 0,
            erased_pages: Vec::new(),
        }
    }

    /// Simulates a device that has dropped off its bus.
    pub fn disconnect(&mut self) { self.reachable = false; }

    /// The next `polls` operations yield `WouldBlock` before going through.
    pub fn stay_busy_for(&mut self, polls: usize) { self.busy_polls = polls; }

    /// Raw view of the whole device.
    pub fn contents(&self) -> &[u8] { &self.data }

    /// Overwrites raw contents, bypassing NOR semantics. For staging
    /// fixtures only.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        let start = address as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, address: u32, length: usize) -> Result<core::ops::Range<usize>, FakeFlashError> {
        if !self.reachable {
            return Err(FakeFlashError::Unreachable);
        }
        let start = address as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(start..end),
            _ => Err(FakeFlashError::OutOfBounds),
        }
    }

    fn poll(&mut self) -> nb::Result<(), FakeFlashError> {
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }
}

impl RawStorage for FakeFlash {
    type Error = FakeFlashError;

    fn geometry(&mut self) -> Option<Geometry> { self.reachable.then_some(self.geometry) }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        self.poll()?;
        let range = self.range(address, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        self.poll()?;
        let range = self.range(address, bytes.len())?;
        if !bytes.is_subset_of(&self.data[range.clone()]) {
            return Err(nb::Error::Other(FakeFlashError::BitsNotErased));
        }
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn erase(&mut self, address: u32, length: u32) -> nb::Result<(), Self::Error> {
        self.poll()?;
        let page_size = self.geometry.page_size;
        if address % page_size != 0 || length % page_size != 0 {
            return Err(nb::Error::Other(FakeFlashError::Misaligned));
        }
        let range = self.range(address, length as usize)?;
        self.data[range].fill(ERASED_BYTE);
        self.erased_pages.extend((address..address + length).step_by(page_size as usize));
        Ok(())
    }

    fn is_busy(&mut self) -> bool { self.busy_polls > 0 }
}

#[cfg(test)]
mod test {
    use super::*;
    use nb::block;

    #[test]
    fn writes_can_only_clear_bits() {
        // Given
        let mut flash = FakeFlash::new(256, 1024);
        block!(flash.write(0, &[0x0F])).unwrap();

        // Then
        assert_eq!(block!(flash.write(0, &[0x0E])), Ok(()));
        assert_eq!(block!(flash.write(0, &[0xF0])), Err(FakeFlashError::BitsNotErased));
    }

    #[test]
    fn erase_requires_whole_pages_and_restores_ones() {
        // Given
        let mut flash = FakeFlash::new(256, 1024);
        block!(flash.write(300, &[0u8; 4])).unwrap();

        // Then
        assert_eq!(block!(flash.erase(300, 256)), Err(FakeFlashError::Misaligned));

        // When
        block!(flash.erase(256, 256)).unwrap();

        // Then
        assert_eq!(&flash.contents()[300..304], &[ERASED_BYTE; 4]);
        assert_eq!(flash.erased_pages, vec![256]);
    }

    #[test]
    fn busy_device_yields_before_completing() {
        // Given
        let mut flash = FakeFlash::new(256, 1024);
        flash.stay_busy_for(2);
        let mut byte = [0u8];

        // Then
        assert!(flash.is_busy());
        assert_eq!(flash.read(0, &mut byte), Err(nb::Error::WouldBlock));
        assert_eq!(flash.read(0, &mut byte), Err(nb::Error::WouldBlock));
        assert_eq!(flash.read(0, &mut byte), Ok(()));
        assert!(!flash.is_busy());
    }

    #[test]
    fn disconnected_device_reports_no_geometry() {
        let mut flash = FakeFlash::new(256, 1024);
        flash.disconnect();
        assert!(flash.geometry().is_none());
        assert_eq!(block!(flash.read(0, &mut [0u8; 1])), Err(FakeFlashError::Unreachable));
    }
}
