//! Boot slot selector.
//!
//! The boot order is the ordered list of slots the bootloader tries
//! after a reset, first entry first. It lives in a dedicated page of
//! the storage device, outside every slot, as a fixed size record:
//!
//! | Field   | Size              | Contents                              |
//! |---------|-------------------|---------------------------------------|
//! | magic   | 4                 | [`BOOT_ORDER_MAGIC`]                  |
//! | count   | 4                 | Number of slots the table was sized to|
//! | entries | 4 × [`MAX_SLOTS`] | Slot ids, `-1` for unused entries     |
//! | crc     | 4                 | CRC32 of all of the above             |
//!
//! An erased, foreign or corrupt record reads as "missing", which is
//! distinct from a recorded empty order.
use super::{
    storage::{Storage, MAX_SLOTS},
    traits::Flash,
};
use crate::error::Error;
use core::mem::size_of;
use crc::crc32;
use log::info;

/// Marks the start of a boot order record.
pub const BOOT_ORDER_MAGIC: u32 = 0xB007_0D3E;

/// Size in bytes of a persisted boot order record.
pub const RECORD_SIZE: usize = size_of::<u32>() * (3 + MAX_SLOTS);

const UNUSED: i32 = -1;

/// Ordered slot ids, boot first at index 0. Each slot appears at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootOrder {
    entries: [i32; MAX_SLOTS],
    table_size: u32,
}

impl BootOrder {
    /// Builds an order for a device with `slot_count` slots. Rejects unknown
    /// slots, duplicates, and more entries than there are slots.
    pub fn new(slots: &[u32], slot_count: u32) -> Result<Self, Error> {
        if slots.len() > slot_count as usize || slot_count as usize > MAX_SLOTS {
            return Err(Error::InvalidArgument("Boot order longer than slot count"));
        }
        let mut entries = [UNUSED; MAX_SLOTS];
        for (index, &slot) in slots.iter().enumerate() {
            if slot >= slot_count {
                return Err(Error::InvalidArgument("Slot does not exist"));
            }
            if slots[..index].contains(&slot) {
                return Err(Error::InvalidArgument("Slot appears twice in boot order"));
            }
            entries[index] = slot as i32;
        }
        Ok(Self { entries, table_size: slot_count })
    }

    /// Slot ids in boot priority order.
    pub fn slots(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries[..self.table_size as usize]
            .iter()
            .take_while(|e| **e != UNUSED)
            .map(|e| *e as u32)
    }

    pub fn first(&self) -> Option<u32> { self.slots().next() }

    pub fn len(&self) -> usize { self.slots().count() }

    pub fn is_empty(&self) -> bool { self.first().is_none() }

    /// Moves `slot` to the front, shifting the entries ahead of it back by
    /// one. A slot not yet in the order takes the place of the last entry
    /// of the table, which is dropped if the table is full.
    pub fn promote(&mut self, slot: u32) {
        let table = &mut self.entries[..self.table_size as usize];
        if table.is_empty() {
            return;
        }
        let position = table
            .iter()
            .position(|e| *e == slot as i32)
            .unwrap_or(table.len() - 1);
        table.copy_within(0..position, 1);
        table[0] = slot as i32;
    }

    fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        let words = core::iter::once(BOOT_ORDER_MAGIC)
            .chain(core::iter::once(self.table_size))
            .chain(self.entries.iter().map(|e| *e as u32));
        for (chunk, word) in record.chunks_exact_mut(size_of::<u32>()).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        let crc_offset = RECORD_SIZE - size_of::<u32>();
        let crc = crc32::checksum_ieee(&record[..crc_offset]);
        record[crc_offset..].copy_from_slice(&crc.to_le_bytes());
        record
    }

    /// Reads a record back for a device with `slot_count` slots. Entries
    /// must form a prefix of distinct, existing slot ids.
    fn decode(record: &[u8; RECORD_SIZE], slot_count: u32) -> Option<Self> {
        let word = |index: usize| {
            let start = index * size_of::<u32>();
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&record[start..start + size_of::<u32>()]);
            u32::from_le_bytes(bytes)
        };
        let crc_offset = RECORD_SIZE - size_of::<u32>();
        if word(0) != BOOT_ORDER_MAGIC || word(2 + MAX_SLOTS) != crc32::checksum_ieee(&record[..crc_offset]) {
            return None;
        }
        let table_size = word(1);
        if table_size as usize > MAX_SLOTS {
            return None;
        }
        // The record may predate a change in slot layout.
        let table_size = table_size.min(slot_count);
        let mut entries = [UNUSED; MAX_SLOTS];
        entries.iter_mut().enumerate().for_each(|(i, e)| *e = word(2 + i) as i32);

        let used = entries.iter().take_while(|e| **e != UNUSED).count();
        let well_formed = entries[used..].iter().all(|e| *e == UNUSED)
            && entries[..used].iter().enumerate().all(|(index, &entry)| {
                (0..table_size as i32).contains(&entry) && !entries[..index].contains(&entry)
            });
        well_formed.then(|| Self { entries, table_size })
    }
}

impl<F: Flash> Storage<F> {
    /// Reads the persisted boot order.
    ///
    /// Fails with [`Error::MissingMetadata`] if none was ever recorded or the
    /// record is corrupt.
    pub fn images_to_bootload(&mut self) -> Result<BootOrder, Error> {
        let mut record = [0u8; RECORD_SIZE];
        self.read_boot_record(&mut record)?;
        BootOrder::decode(&record, self.slot_count()).ok_or(Error::MissingMetadata)
    }

    /// Replaces the persisted boot order.
    pub fn set_images_to_bootload(&mut self, slots: &[u32]) -> Result<(), Error> {
        let order = BootOrder::new(slots, self.slot_count())?;
        self.write_boot_record(&order.encode())
    }

    /// Makes `slot` boot first while keeping the relative order of the rest.
    /// With no recorded order, records `[slot]`.
    pub fn promote_slot_to_boot_first(&mut self, slot: u32) -> Result<(), Error> {
        self.slot_info(slot)?;
        let order = match self.images_to_bootload() {
            Ok(mut order) => {
                order.promote(slot);
                order
            }
            Err(Error::MissingMetadata) => BootOrder::new(&[slot], self.slot_count())?,
            Err(error) => return Err(error),
        };
        info!("Slot {} promoted to boot first", slot);
        self.write_boot_record(&order.encode())
    }

    /// Forgets the persisted boot order.
    pub fn clear_images_to_bootload(&mut self) -> Result<(), Error> { self.erase_boot_record() }
}
