//! Storage slot abstraction.
//!
//! Partitions a raw page erasable device into fixed slots, each able
//! to hold one firmware image, and provides page respecting erase and
//! write operations addressed by slot and slot-relative offset.
//!
//! Slots start on page boundaries but their length need not be a whole
//! number of pages. Erases never reach past a slot's declared length, so
//! the sub-page tail of such a slot is never erased by this module.
use super::{boot_order::RECORD_SIZE, traits::Flash, Progress};
use crate::{
    error::Error,
    hal::flash::{Capabilities, Geometry},
    utilities::memory::{align_down, align_up, Region, Span},
};
use log::{debug, warn};
use nb::block;

/// Maximum number of slots a device can be partitioned into.
pub const MAX_SLOTS: usize = 8;

/// Static description of the backing store.
///
/// A zeroed value (see [`StorageDeviceInfo::is_valid`]) means the device
/// could not be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageDeviceInfo {
    /// Erase granularity in bytes.
    pub page_size: u32,
    /// Minimum write granularity in bytes.
    pub word_size: u32,
    /// Total bytes in the device.
    pub capacity: u32,
    pub capabilities: Capabilities,
    pub slot_count: u32,
}

impl StorageDeviceInfo {
    pub fn is_valid(&self) -> bool { self.page_size != 0 }
}

/// Contiguous range of the device that holds at most one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageSlot {
    /// Absolute device address of the start of the slot.
    pub address: u32,
    pub length: u32,
}

impl StorageSlot {
    pub fn span(&self) -> Span { Span::new(self.address, self.length) }
}

/// Progress of a resumable slot erase. Created by
/// [`Storage::chunked_erase_init`] and advanced, one page per call, by
/// [`Storage::chunked_erase_step`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EraseStatus {
    slot: u32,
    cursor: u32,
    end: u32,
    page_size: u32,
}

impl EraseStatus {
    pub fn slot(&self) -> u32 { self.slot }
    /// Bytes still to be erased.
    pub fn remaining(&self) -> u32 { self.end - self.cursor }
}

/// Raw device partitioned into slots, plus the page reserved for the
/// boot order record.
pub struct Storage<F: Flash> {
    device: F,
    geometry: Geometry,
    slots: Vec<StorageSlot>,
    boot_info_address: u32,
}

impl<F: Flash> Storage<F> {
    /// Binds a device to a slot layout, checking that slots start on
    /// page boundaries, stay inside the device, don't overlap, and leave
    /// the boot record page alone.
    pub fn new(mut device: F, slots: &[StorageSlot], boot_info_address: u32) -> Result<Self, Error> {
        let geometry = device.geometry().ok_or(Error::NotInitialized)?;
        let page_size = geometry.page_size;
        if page_size == 0 {
            return Err(Error::InvalidArgument("Device reports a zero page size"));
        }
        if slots.len() > MAX_SLOTS {
            return Err(Error::InvalidArgument("Too many slots"));
        }

        let device_span = Span::new(0, geometry.capacity);
        for (index, slot) in slots.iter().enumerate() {
            if slot.address % page_size != 0 {
                return Err(Error::InvalidArgument("Slot does not start on a page boundary"));
            }
            if !device_span.contains_range(slot.address, slot.length) {
                return Err(Error::InvalidArgument("Slot exceeds device capacity"));
            }
            if slots[..index].iter().any(|other| other.span().overlaps(&slot.span())) {
                return Err(Error::InvalidArgument("Slots overlap"));
            }
        }

        let boot_info = Span::new(boot_info_address, page_size);
        if boot_info_address % page_size != 0
            || !device_span.contains_range(boot_info.start, boot_info.length)
            || (page_size as usize) < RECORD_SIZE
        {
            return Err(Error::InvalidArgument("Boot record page is invalid"));
        }
        if slots.iter().any(|slot| slot.span().overlaps(&boot_info)) {
            return Err(Error::InvalidArgument("Boot record page overlaps a slot"));
        }

        debug!("Storage bound: {} slots, {} byte pages", slots.len(), page_size);
        Ok(Self { device, geometry, slots: slots.to_vec(), boot_info_address })
    }

    /// Description of the device. Zeroed if the device can't be reached.
    pub fn storage_info(&mut self) -> StorageDeviceInfo {
        match self.device.geometry() {
            Some(geometry) => StorageDeviceInfo {
                page_size: geometry.page_size,
                word_size: geometry.word_size,
                capacity: geometry.capacity,
                capabilities: geometry.capabilities,
                slot_count: self.slot_count(),
            },
            None => StorageDeviceInfo::default(),
        }
    }

    pub fn slot_count(&self) -> u32 { self.slots.len() as u32 }

    pub fn slots(&self) -> impl Iterator<Item = StorageSlot> + '_ { self.slots.iter().copied() }

    pub fn slot_info(&self, slot: u32) -> Result<StorageSlot, Error> {
        self.slots.get(slot as usize).copied().ok_or(Error::InvalidArgument("Slot does not exist"))
    }

    /// Reads `buffer.len()` bytes from `offset` into the slot.
    pub fn read(&mut self, slot: u32, offset: u32, buffer: &mut [u8]) -> Result<(), Error> {
        let address = self.bounded(slot, offset, buffer.len())?;
        Ok(block!(self.device.read(address, buffer))?)
    }

    /// Writes `data` at `offset` into the slot without erasing first. The
    /// target bytes must already be erased.
    pub fn write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error> {
        let address = self.bounded(slot, offset, data.len())?;
        Ok(block!(self.device.write(address, data))?)
    }

    /// Erases exactly the whole pages covering `[offset, offset + data.len())`
    /// and then writes `data` there.
    ///
    /// Fails with [`Error::InvalidRange`] if the range exceeds the slot, or
    /// if covering it would need the page holding the slot's sub-page tail,
    /// as that page extends past the slot.
    pub fn erase_and_write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error> {
        let address = self.bounded(slot, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        let info = self.slot_info(slot)?;
        let page_size = self.geometry.page_size;
        let end = offset + data.len() as u32;
        let (erase_start, erase_end) =
            page_span(offset, end, page_size).ok_or(Error::InvalidRange)?;
        if erase_end > align_down(info.length, page_size) {
            warn!("Slot {} write reaches its partial last page, which is never erased", slot);
            return Err(Error::InvalidRange);
        }

        debug!("Slot {}: erasing [{:#x}, {:#x})", slot, erase_start, erase_end);
        block!(self.device.erase(info.address + erase_start, erase_end - erase_start))?;
        Ok(block!(self.device.write(address, data))?)
    }

    /// Erases every whole page of the slot.
    pub fn erase_slot(&mut self, slot: u32) -> Result<(), Error> {
        let info = self.slot_info(slot)?;
        let erasable = self.erasable_length(slot, &info);
        if erasable > 0 {
            block!(self.device.erase(info.address, erasable))?;
        }
        Ok(())
    }

    /// Starts a resumable erase of every whole page of the slot.
    pub fn chunked_erase_init(&self, slot: u32) -> Result<EraseStatus, Error> {
        let info = self.slot_info(slot)?;
        let erasable = self.erasable_length(slot, &info);
        Ok(EraseStatus {
            slot,
            cursor: info.address,
            end: info.address + erasable,
            page_size: self.geometry.page_size,
        })
    }

    /// Erases the next page of a resumable erase.
    pub fn chunked_erase_step(&mut self, status: &mut EraseStatus) -> Result<Progress, Error> {
        if status.cursor < status.end {
            block!(self.device.erase(status.cursor, status.page_size))?;
            status.cursor += status.page_size;
        }
        Ok(if status.cursor >= status.end { Progress::Done } else { Progress::Continue })
    }

    pub fn is_busy(&mut self) -> bool { self.device.is_busy() }

    pub fn device(&self) -> &F { &self.device }

    pub fn device_mut(&mut self) -> &mut F { &mut self.device }

    pub(crate) fn read_boot_record(&mut self, bytes: &mut [u8]) -> Result<(), Error> {
        Ok(block!(self.device.read(self.boot_info_address, bytes))?)
    }

    pub(crate) fn write_boot_record(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.erase_boot_record()?;
        Ok(block!(self.device.write(self.boot_info_address, bytes))?)
    }

    pub(crate) fn erase_boot_record(&mut self) -> Result<(), Error> {
        Ok(block!(self.device.erase(self.boot_info_address, self.geometry.page_size))?)
    }

    fn erasable_length(&self, slot: u32, info: &StorageSlot) -> u32 {
        let erasable = align_down(info.length, self.geometry.page_size);
        if erasable != info.length {
            warn!(
                "Slot {} is not a whole number of pages: its last {} bytes are not erased",
                slot,
                info.length - erasable
            );
        }
        erasable
    }

    /// Absolute address of `[offset, offset + length)` in the slot, if it
    /// fits in it.
    fn bounded(&self, slot: u32, offset: u32, length: usize) -> Result<u32, Error> {
        let info = self.slot_info(slot)?;
        let length = u32::try_from(length).map_err(|_| Error::InvalidRange)?;
        match offset.checked_add(length) {
            Some(end) if end <= info.length => Ok(info.address + offset),
            _ => Err(Error::InvalidRange),
        }
    }
}

/// Whole-page super-range of `[start, end)`, relative to a page aligned
/// origin.
fn page_span(start: u32, end: u32, page_size: u32) -> Option<(u32, u32)> {
    let start_aligned = start % page_size == 0;
    let end_aligned = end % page_size == 0;
    match (start_aligned, end_aligned) {
        (true, true) => Some((start, end)),
        (false, true) => Some((align_down(start, page_size), end)),
        (true, false) => Some((start, align_up(end, page_size)?)),
        (false, false) => Some((align_down(start, page_size), align_up(end, page_size)?)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{hal::doubles::flash::FakeFlash, utilities::bitwise::ERASED_BYTE};
    use proptest::prelude::*;

    const PAGE: u32 = 2048;
    const BOOT_INFO: u32 = 15 * PAGE;
    const SLOTS: [StorageSlot; 3] = [
        StorageSlot { address: 0, length: 4 * PAGE },
        StorageSlot { address: 4 * PAGE, length: 4 * PAGE },
        StorageSlot { address: 8 * PAGE, length: 2 * PAGE + 1904 },
    ];

    fn storage() -> Storage<FakeFlash> {
        Storage::new(FakeFlash::new(PAGE, 16 * PAGE), &SLOTS, BOOT_INFO).unwrap()
    }

    fn storage_filled_with(pattern: u8) -> Storage<FakeFlash> {
        let mut storage = storage();
        storage.device_mut().load(0, &[pattern; (15 * PAGE) as usize]);
        storage
    }

    #[test]
    fn slots_are_disjoint_and_inside_the_device() {
        // Given
        let mut storage = storage();
        let info = storage.storage_info();

        // Then
        assert_eq!(info.slot_count, 3);
        let slots: Vec<_> = (0..info.slot_count).map(|i| storage.slot_info(i).unwrap()).collect();
        for (i, a) in slots.iter().enumerate() {
            assert!(a.address + a.length <= info.capacity);
            for b in &slots[i + 1..] {
                assert!(!a.span().overlaps(&b.span()));
            }
        }
        assert_eq!(storage.slot_info(3), Err(Error::InvalidArgument("Slot does not exist")));
    }

    #[test]
    fn invalid_layouts_are_rejected() {
        let flash = || FakeFlash::new(PAGE, 16 * PAGE);
        let overlapping = [SLOTS[0], StorageSlot { address: 2 * PAGE, length: PAGE }];
        let misaligned = [StorageSlot { address: 10, length: PAGE }];
        let oversized = [StorageSlot { address: 0, length: 17 * PAGE }];

        assert!(Storage::new(flash(), &overlapping, BOOT_INFO).is_err());
        assert!(Storage::new(flash(), &misaligned, BOOT_INFO).is_err());
        assert!(Storage::new(flash(), &oversized, BOOT_INFO).is_err());
        assert!(Storage::new(flash(), &SLOTS, 0).is_err());
        assert!(Storage::new(flash(), &SLOTS, 16 * PAGE).is_err());
        assert!(Storage::new(flash(), &[SLOTS[0]; MAX_SLOTS + 1], BOOT_INFO).is_err());
    }

    #[test]
    fn unreachable_device_reports_zeroed_info() {
        // Given
        let mut storage = storage();

        // When
        storage.device_mut().disconnect();

        // Then
        let info = storage.storage_info();
        assert!(!info.is_valid());
        assert_eq!(info, StorageDeviceInfo::default());
    }

    #[test]
    fn small_write_erases_only_its_own_page() {
        // Given
        let mut storage = storage();
        let data: Vec<u8> = (0..100u8).collect();

        // When
        storage.erase_and_write(0, 10, &data).unwrap();

        // Then
        assert_eq!(storage.device().erased_pages, vec![0]);
        let mut readback = [0u8; 100];
        storage.read(0, 10, &mut readback).unwrap();
        assert_eq!(&readback[..], &data[..]);
        assert!(storage.device().contents()[2048..8192].iter().all(|b| *b == ERASED_BYTE));
    }

    #[test]
    fn erase_and_write_covers_every_alignment_combination() {
        // (offset, length, expected erased pages relative to the slot)
        let cases = [
            (PAGE, PAGE, vec![PAGE]),
            (PAGE + 16, PAGE - 16, vec![PAGE]),
            (PAGE, 100, vec![PAGE]),
            (PAGE + 16, PAGE, vec![PAGE, 2 * PAGE]),
        ];

        for (offset, length, pages) in cases {
            // Given
            let slot_base = SLOTS[1].address;
            let mut storage = storage_filled_with(0x00);
            let data: Vec<u8> = (0..length).map(|i| (i % 251) as u8).collect();

            // When
            storage.erase_and_write(1, offset, &data).unwrap();

            // Then
            let erased: Vec<u32> = pages.iter().map(|p| slot_base + p).collect();
            assert_eq!(storage.device().erased_pages, erased);

            let mut readback = vec![0u8; length as usize];
            storage.read(1, offset, &mut readback).unwrap();
            assert_eq!(readback, data);

            let contents = storage.device().contents();
            let super_start = (slot_base + pages[0]) as usize;
            let super_end = (slot_base + pages[pages.len() - 1] + PAGE) as usize;
            assert_eq!(contents[super_start - 1], 0x00);
            assert_eq!(contents[super_end], 0x00);
        }
    }

    #[test]
    fn erase_and_write_rejects_ranges_past_the_slot() {
        let mut storage = storage();
        assert_eq!(storage.erase_and_write(0, 4 * PAGE - 4, &[0u8; 8]), Err(Error::InvalidRange));
        assert_eq!(storage.erase_and_write(0, u32::MAX, &[0u8; 8]), Err(Error::InvalidRange));
        assert_eq!(storage.read(0, 4 * PAGE, &mut [0u8; 1]), Err(Error::InvalidRange));
        assert!(storage.device().erased_pages.is_empty());
    }

    #[test]
    fn erase_and_write_never_touches_a_partial_last_page() {
        // Given
        let mut storage = storage();

        // Then
        assert_eq!(storage.erase_and_write(2, 2 * PAGE + 10, &[0u8; 4]), Err(Error::InvalidRange));
        assert!(storage.device().erased_pages.is_empty());
        assert_eq!(storage.erase_and_write(2, PAGE, &[0u8; 4]), Ok(()));
    }

    #[test]
    fn erasing_a_slot_twice_matches_erasing_once() {
        // Given
        let mut storage = storage_filled_with(0x3C);

        // When
        storage.erase_slot(0).unwrap();
        let once = storage.device().contents().to_vec();
        storage.erase_slot(0).unwrap();

        // Then
        assert_eq!(storage.device().contents(), &once[..]);
        assert!(once[..(4 * PAGE) as usize].iter().all(|b| *b == ERASED_BYTE));
        assert_eq!(once[(4 * PAGE) as usize], 0x3C);
    }

    #[test]
    fn erasing_a_slot_leaves_its_sub_page_tail() {
        // Given
        let mut storage = storage_filled_with(0x00);
        let tail_start = (SLOTS[2].address + 2 * PAGE) as usize;
        let slot_end = (SLOTS[2].address + SLOTS[2].length) as usize;

        // When
        storage.erase_slot(2).unwrap();

        // Then
        let contents = storage.device().contents();
        assert!(contents[SLOTS[2].address as usize..tail_start].iter().all(|b| *b == ERASED_BYTE));
        assert!(contents[tail_start..slot_end].iter().all(|b| *b == 0x00));
    }

    #[test]
    fn chunked_erase_advances_one_page_per_step() {
        // Given
        let mut storage = storage_filled_with(0x00);
        let mut status = storage.chunked_erase_init(1).unwrap();

        // When
        let steps: Vec<Progress> =
            (0..4).map(|_| storage.chunked_erase_step(&mut status).unwrap()).collect();

        // Then
        assert_eq!(steps, [Progress::Continue, Progress::Continue, Progress::Continue, Progress::Done]);
        assert_eq!(status.remaining(), 0);
        let base = SLOTS[1].address;
        assert_eq!(storage.device().erased_pages, vec![base, base + PAGE, base + 2 * PAGE, base + 3 * PAGE]);
        assert_eq!(storage.chunked_erase_step(&mut status), Ok(Progress::Done));
        assert_eq!(storage.device().erased_pages.len(), 4);
    }

    #[test]
    fn busy_device_is_waited_on() {
        // Given
        let mut storage = storage();
        storage.device_mut().stay_busy_for(3);

        // Then
        assert!(storage.is_busy());
        assert_eq!(storage.erase_and_write(0, 0, &[1, 2, 3]), Ok(()));
        assert!(!storage.is_busy());
    }

    proptest! {
        #[test]
        fn erase_and_write_round_trips_and_preserves_neighbours(
            offset in 0u32..(4 * PAGE),
            data in proptest::collection::vec(any::<u8>(), 1..(2 * PAGE as usize)),
        ) {
            let end = offset + data.len() as u32;
            prop_assume!(end <= 4 * PAGE);

            // Given
            let mut storage = storage_filled_with(0x00);

            // When
            storage.erase_and_write(1, offset, &data).unwrap();

            // Then
            let mut readback = vec![0u8; data.len()];
            storage.read(1, offset, &mut readback).unwrap();
            prop_assert_eq!(&readback, &data);

            let base = SLOTS[1].address as usize;
            let super_start = base + align_down(offset, PAGE) as usize;
            let super_end = base + align_up(end, PAGE).unwrap() as usize;
            let contents = storage.device().contents();
            prop_assert!(contents[..super_start].iter().all(|b| *b == 0x00));
            prop_assert!(contents[super_end..(15 * PAGE) as usize].iter().all(|b| *b == 0x00));
        }
    }
}
