//! The trusted core's public surface.
//!
//! Everything the rest of the system may ask of the bootloader goes
//! through [`BootloaderInterface`]. The trusted core implements it
//! directly; the secure gate wraps an implementation and exposes the
//! same operations to untrusted callers, validating their arguments
//! first. Tests substitute mock implementations.
use super::{
    boot_order::BootOrder,
    image::{verify::VerificationContext, ApplicationImageMetadata, ImageProperties, ParserCallbacks},
    storage::{EraseStatus, StorageDeviceInfo, StorageSlot},
    Progress,
};
use crate::{
    error::Error,
    hal::{serial::Received, time::Milliseconds},
};

pub trait BootloaderInterface {
    // Storage

    fn storage_info(&mut self) -> Result<StorageDeviceInfo, Error>;
    fn slot_info(&mut self, slot: u32) -> Result<StorageSlot, Error>;
    fn read(&mut self, slot: u32, offset: u32, buffer: &mut [u8]) -> Result<(), Error>;
    fn write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error>;
    fn erase_and_write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error>;
    fn erase_slot(&mut self, slot: u32) -> Result<(), Error>;
    fn chunked_erase_init(&mut self, slot: u32) -> Result<EraseStatus, Error>;
    fn chunked_erase_step(&mut self, status: &mut EraseStatus) -> Result<Progress, Error>;

    // Images

    fn init_verify_image(&mut self, slot: u32) -> Result<VerificationContext, Error>;
    fn continue_verify_image(
        &mut self,
        context: &mut VerificationContext,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<Progress, Error>;
    fn verify_image(&mut self, slot: u32) -> Result<ImageProperties, Error>;
    fn image_info(&mut self, slot: u32) -> Result<ApplicationImageMetadata, Error>;

    // Boot order

    fn images_to_bootload(&mut self) -> Result<BootOrder, Error>;
    fn set_images_to_bootload(&mut self, slots: &[u32]) -> Result<(), Error>;
    fn promote_slot_to_boot_first(&mut self, slot: u32) -> Result<(), Error>;
    fn clear_images_to_bootload(&mut self) -> Result<(), Error>;
    /// Resets into the bootloader so it installs the images in the
    /// recorded boot order.
    fn reboot_and_install(&mut self) -> !;

    // Serial transport

    /// Bytes copied are reported even when the receive times out.
    fn receive(&mut self, buffer: &mut [u8], blocking: bool, timeout: Milliseconds) -> Received;
    fn send(&mut self, data: &[u8], blocking: bool) -> Result<(), Error>;
    fn flush(&mut self, transmit: bool, receive: bool) -> Result<(), Error>;
    fn available(&mut self) -> Result<usize, Error>;
}
