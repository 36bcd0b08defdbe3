//! Trusted bootloader core.
//!
//! Owns the storage device, the serial transport and the image policy,
//! and serves every [`BootloaderInterface`] operation on their behalf.
//! Construction replaces static initialization: a core starts unbound,
//! and operations on a collaborator that was never bound fail with
//! [`Error::NotInitialized`].
use super::{
    boot_order::BootOrder,
    image::{
        verify::{self, VerificationContext},
        ApplicationImageMetadata, ImagePolicy, ImageProperties, ParserCallbacks,
    },
    interface::BootloaderInterface,
    storage::{EraseStatus, Storage, StorageDeviceInfo, StorageSlot},
    traits::Flash,
    Progress,
};
use crate::{
    error::Error,
    hal::{
        protection::{ResetCause, SystemReset},
        serial::{BufferedTransport, Received},
        time::Milliseconds,
    },
};
use log::info;

pub struct Bootloader<F: Flash, S: BufferedTransport, R: SystemReset> {
    storage: Option<Storage<F>>,
    serial: Option<S>,
    policy: ImagePolicy,
    reset: R,
}

impl<F: Flash, S: BufferedTransport, R: SystemReset> Bootloader<F, S, R> {
    /// A core with no storage or transport bound yet.
    pub fn new(policy: ImagePolicy, reset: R) -> Self {
        Self { storage: None, serial: None, policy, reset }
    }

    pub fn bind_storage(&mut self, storage: Storage<F>) { self.storage = Some(storage); }

    pub fn bind_serial(&mut self, serial: S) { self.serial = Some(serial); }

    pub fn storage(&mut self) -> Result<&mut Storage<F>, Error> {
        self.storage.as_mut().ok_or(Error::NotInitialized)
    }

    pub fn serial(&mut self) -> Result<&mut S, Error> {
        self.serial.as_mut().ok_or(Error::NotInitialized)
    }

    pub fn policy(&self) -> &ImagePolicy { &self.policy }
}

impl<F: Flash, S: BufferedTransport, R: SystemReset> BootloaderInterface for Bootloader<F, S, R> {
    fn storage_info(&mut self) -> Result<StorageDeviceInfo, Error> {
        Ok(self.storage()?.storage_info())
    }

    fn slot_info(&mut self, slot: u32) -> Result<StorageSlot, Error> {
        self.storage()?.slot_info(slot)
    }

    fn read(&mut self, slot: u32, offset: u32, buffer: &mut [u8]) -> Result<(), Error> {
        self.storage()?.read(slot, offset, buffer)
    }

    fn write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.storage()?.write(slot, offset, data)
    }

    fn erase_and_write(&mut self, slot: u32, offset: u32, data: &[u8]) -> Result<(), Error> {
        self.storage()?.erase_and_write(slot, offset, data)
    }

    fn erase_slot(&mut self, slot: u32) -> Result<(), Error> { self.storage()?.erase_slot(slot) }

    fn chunked_erase_init(&mut self, slot: u32) -> Result<EraseStatus, Error> {
        self.storage()?.chunked_erase_init(slot)
    }

    fn chunked_erase_step(&mut self, status: &mut EraseStatus) -> Result<Progress, Error> {
        self.storage()?.chunked_erase_step(status)
    }

    fn init_verify_image(&mut self, slot: u32) -> Result<VerificationContext, Error> {
        self.storage()?.slot_info(slot)?;
        Ok(VerificationContext::init(slot))
    }

    fn continue_verify_image(
        &mut self,
        context: &mut VerificationContext,
        callbacks: &mut dyn ParserCallbacks,
    ) -> Result<Progress, Error> {
        let storage = self.storage.as_mut().ok_or(Error::NotInitialized)?;
        context.continue_verify(storage, &self.policy, callbacks)
    }

    fn verify_image(&mut self, slot: u32) -> Result<ImageProperties, Error> {
        let storage = self.storage.as_mut().ok_or(Error::NotInitialized)?;
        verify::verify_image(storage, slot, &self.policy)
    }

    fn image_info(&mut self, slot: u32) -> Result<ApplicationImageMetadata, Error> {
        let storage = self.storage.as_mut().ok_or(Error::NotInitialized)?;
        verify::image_info(storage, slot, &self.policy)
    }

    fn images_to_bootload(&mut self) -> Result<BootOrder, Error> {
        self.storage()?.images_to_bootload()
    }

    fn set_images_to_bootload(&mut self, slots: &[u32]) -> Result<(), Error> {
        self.storage()?.set_images_to_bootload(slots)
    }

    fn promote_slot_to_boot_first(&mut self, slot: u32) -> Result<(), Error> {
        self.storage()?.promote_slot_to_boot_first(slot)
    }

    fn clear_images_to_bootload(&mut self) -> Result<(), Error> {
        self.storage()?.clear_images_to_bootload()
    }

    fn reboot_and_install(&mut self) -> ! {
        info!("Rebooting to install the recorded boot order");
        self.reset.reset(ResetCause::BootloadRequested)
    }

    fn receive(&mut self, buffer: &mut [u8], blocking: bool, timeout: Milliseconds) -> Received {
        match self.serial() {
            Ok(serial) => serial.receive(buffer, blocking, timeout),
            Err(error) => Received::failed(error),
        }
    }

    fn send(&mut self, data: &[u8], blocking: bool) -> Result<(), Error> {
        self.serial()?.send(data, blocking)
    }

    fn flush(&mut self, transmit: bool, receive: bool) -> Result<(), Error> {
        self.serial()?.flush(transmit, receive);
        Ok(())
    }

    fn available(&mut self) -> Result<usize, Error> { Ok(self.serial()?.available()) }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        devices::image::{
            parser::test::{application_image, signing_key, strict_policy, Recorder},
            ImageContents,
        },
        drivers::dma_serial::BufferedSerial,
        hal::{
            doubles::{dma::FakeDma, flash::FakeFlash, protection::PanickingReset, time::MockSysTick},
            time::U32Ext,
        },
    };
    use std::panic::{catch_unwind, AssertUnwindSafe};

    const PAGE: u32 = 1024;

    type TestSerial = BufferedSerial<FakeDma, MockSysTick, 64, 32>;
    type TestBootloader = Bootloader<FakeFlash, TestSerial, PanickingReset>;

    fn bootloader() -> TestBootloader {
        let slots = [
            StorageSlot { address: 0, length: 4 * PAGE },
            StorageSlot { address: 4 * PAGE, length: 4 * PAGE },
        ];
        let storage = Storage::new(FakeFlash::new(PAGE, 16 * PAGE), &slots, 15 * PAGE).unwrap();
        let mut bootloader = Bootloader::new(strict_policy(), PanickingReset);
        bootloader.bind_storage(storage);
        bootloader.bind_serial(BufferedSerial::new(FakeDma::new().with_loopback(), MockSysTick::default()));
        bootloader
    }

    #[test]
    fn unbound_core_reports_not_initialized() {
        // Given
        let mut bootloader: TestBootloader = Bootloader::new(strict_policy(), PanickingReset);

        // Then
        assert_eq!(bootloader.storage_info(), Err(Error::NotInitialized));
        assert_eq!(bootloader.erase_slot(0), Err(Error::NotInitialized));
        assert_eq!(bootloader.verify_image(0).map(|_| ()), Err(Error::NotInitialized));
        assert_eq!(bootloader.images_to_bootload().map(|_| ()), Err(Error::NotInitialized));
        assert_eq!(bootloader.send(b"hi", false), Err(Error::NotInitialized));
        assert_eq!(bootloader.available(), Err(Error::NotInitialized));
        assert_eq!(bootloader.receive(&mut [0; 4], false, 0.ms()), Received::failed(Error::NotInitialized));
    }

    #[test]
    fn image_written_through_the_core_verifies_and_boots_first() {
        // Given
        let mut bootloader = bootloader();
        let image = application_image().build_signed(&signing_key());
        bootloader.set_images_to_bootload(&[0]).unwrap();

        // When
        bootloader.erase_and_write(1, 0, &image).unwrap();
        let properties = bootloader.verify_image(1).unwrap();
        bootloader.promote_slot_to_boot_first(1).unwrap();

        // Then
        assert!(properties.verified);
        assert!(properties.contents.contains(ImageContents::APPLICATION));
        assert_eq!(bootloader.image_info(1).unwrap(), properties.metadata);
        let order: Vec<u32> = bootloader.images_to_bootload().unwrap().slots().collect();
        assert_eq!(order, [1, 0]);
    }

    #[test]
    fn stepwise_verification_reports_payloads() {
        // Given
        let mut bootloader = bootloader();
        let image = application_image().build_signed(&signing_key());
        bootloader.erase_and_write(0, 0, &image).unwrap();
        let mut context = bootloader.init_verify_image(0).unwrap();
        let mut recorder = Recorder::default();

        // When
        while bootloader.continue_verify_image(&mut context, &mut recorder).unwrap()
            == Progress::Continue
        {}

        // Then
        assert!(context.properties().verified);
        assert_eq!(recorder.metadata, b"release notes");
        assert!(bootloader.init_verify_image(2).is_err());
    }

    #[test]
    fn chunked_erase_runs_through_the_core() {
        // Given
        let mut bootloader = bootloader();
        bootloader.erase_and_write(0, 0, &[0u8; 16]).unwrap();
        let mut status = bootloader.chunked_erase_init(0).unwrap();

        // When
        let mut steps = 1;
        while bootloader.chunked_erase_step(&mut status).unwrap() == Progress::Continue {
            steps += 1;
        }

        // Then
        assert_eq!(steps, 4);
        assert_eq!(bootloader.verify_image(0).map(|_| ()), Err(Error::NoImage));
    }

    #[test]
    fn reboot_and_install_resets_with_the_bootload_cause() {
        // Given
        let mut bootloader = bootloader();
        bootloader.promote_slot_to_boot_first(1).unwrap();

        // When
        let outcome = catch_unwind(AssertUnwindSafe(|| bootloader.reboot_and_install()));

        // Then
        let message = outcome.unwrap_err().downcast::<String>().unwrap();
        assert!(message.contains("BootloadRequested"));
        let order: Vec<u32> = bootloader.images_to_bootload().unwrap().slots().collect();
        assert_eq!(order, [1]);
    }

    #[test]
    fn serial_operations_reach_the_transport() {
        // Given
        let mut bootloader = bootloader();

        // When
        bootloader.send(b"ping", true).unwrap();
        let mut received = [0u8; 4];
        let count = bootloader.receive(&mut received, true, 100.ms()).result().unwrap();

        // Then
        assert_eq!(count, 4);
        assert_eq!(&received, b"ping");
        assert_eq!(bootloader.available(), Ok(0));
        bootloader.flush(true, true).unwrap();
    }
}
