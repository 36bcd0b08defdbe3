//! Verification of images held in storage slots.
//!
//! Verifying a slot may take a while on large images, so it is broken
//! into steps that each read and parse one chunk. Callers that can't
//! afford to block drive a [`VerificationContext`] themselves; the rest
//! use [`verify_image`].
use super::{parser::GblParser, ApplicationImageMetadata, ImagePolicy, ImageProperties, ParserCallbacks};
use crate::{
    devices::{storage::Storage, traits::Flash, Progress},
    error::{Error, ParseFault},
    utilities::bitwise::Erased,
};
use core::mem::size_of;
use log::info;
use static_assertions::const_assert;
use zeroize::Zeroize;

/// Bytes read from the slot per verification step.
pub const VERIFICATION_CHUNK: usize = 64;

/// Storage a caller must reserve for a [`VerificationContext`].
pub const VERIFICATION_CONTEXT_SIZE: usize = 524;

/// Leading bytes of a slot that tell an empty slot from an image.
const ERASED_HEADER_LENGTH: u32 = 8;

/// Progress of a resumable slot verification.
pub struct VerificationContext {
    slot: u32,
    offset: u32,
    failed: bool,
    parser: GblParser,
}

const_assert!(size_of::<VerificationContext>() <= VERIFICATION_CONTEXT_SIZE);

impl VerificationContext {
    /// Prepares to verify the image in `slot`, starting at its first byte.
    pub fn init(slot: u32) -> Self { Self { slot, offset: 0, failed: false, parser: GblParser::new() } }

    pub fn slot(&self) -> u32 { self.slot }

    /// Bytes of the slot consumed so far.
    pub fn offset(&self) -> u32 { self.offset }

    pub fn properties(&self) -> &ImageProperties { self.parser.properties() }

    /// Reads and parses the next chunk of the slot.
    ///
    /// Returns [`Progress::Done`] once the image verified, after which
    /// further calls keep returning it. Any error is terminal, and the
    /// context refuses further steps with [`Error::NotInitialized`].
    pub fn continue_verify<F: Flash, C: ParserCallbacks + ?Sized>(
        &mut self,
        storage: &mut Storage<F>,
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<Progress, Error> {
        if self.failed {
            return Err(Error::NotInitialized);
        }
        let result = self.step(storage, policy, callbacks);
        if result.is_err() {
            self.zeroize();
            self.failed = true;
        }
        result
    }

    fn step<F: Flash, C: ParserCallbacks + ?Sized>(
        &mut self,
        storage: &mut Storage<F>,
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<Progress, Error> {
        if self.parser.is_done() {
            return Ok(Progress::Done);
        }

        let slot = storage.slot_info(self.slot)?;
        if self.offset == 0 {
            let mut header = [0u8; ERASED_HEADER_LENGTH as usize];
            let header = &mut header[..ERASED_HEADER_LENGTH.min(slot.length) as usize];
            storage.read(self.slot, 0, header)?;
            if header.is_erased() {
                return Err(Error::NoImage);
            }
        }
        if self.offset >= slot.length {
            return Err(Error::Parse(ParseFault::Truncated));
        }

        let length = (slot.length - self.offset).min(VERIFICATION_CHUNK as u32) as usize;
        let mut chunk = [0u8; VERIFICATION_CHUNK];
        let result = storage
            .read(self.slot, self.offset, &mut chunk[..length])
            .and_then(|_| self.parser.parse(&chunk[..length], policy, callbacks));
        chunk.zeroize();
        self.offset += length as u32;
        result
    }
}

impl Zeroize for VerificationContext {
    fn zeroize(&mut self) {
        self.offset = 0;
        self.parser.zeroize();
    }
}

/// Verifies the image in `slot` in one go.
pub fn verify_image<F: Flash>(
    storage: &mut Storage<F>,
    slot: u32,
    policy: &ImagePolicy,
) -> Result<ImageProperties, Error> {
    let mut context = VerificationContext::init(slot);
    while context.continue_verify(storage, policy, &mut ())? == Progress::Continue {}
    info!("Slot {} holds a valid image", slot);
    Ok(*context.properties())
}

/// Metadata of the valid image in `slot`.
pub fn image_info<F: Flash>(
    storage: &mut Storage<F>,
    slot: u32,
    policy: &ImagePolicy,
) -> Result<ApplicationImageMetadata, Error> {
    verify_image(storage, slot, policy).map(|properties| properties.metadata)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        devices::{
            image::{
                builder::GblBuilder,
                parser::test::{
                    application_image, binary, lenient_policy, metadata, signing_key,
                    strict_policy, Recorder,
                },
                ApplicationType, ImageContents,
            },
            storage::StorageSlot,
        },
        hal::doubles::flash::FakeFlash,
    };

    const PAGE: u32 = 1024;

    fn storage() -> Storage<FakeFlash> {
        let slots = [
            StorageSlot { address: 0, length: 4 * PAGE },
            StorageSlot { address: 4 * PAGE, length: 4 * PAGE },
            StorageSlot { address: 8 * PAGE, length: PAGE },
        ];
        Storage::new(FakeFlash::new(PAGE, 16 * PAGE), &slots, 15 * PAGE).unwrap()
    }

    #[test]
    fn signed_image_in_a_slot_verifies_one_chunk_per_step() {
        // Given
        let mut storage = storage();
        let image = application_image().build_signed(&signing_key());
        storage.erase_and_write(1, 0, &image).unwrap();
        let mut context = VerificationContext::init(1);
        let mut recorder = Recorder::default();

        // When
        let mut steps = 1;
        while context.continue_verify(&mut storage, &strict_policy(), &mut recorder).unwrap()
            == Progress::Continue
        {
            steps += 1;
        }

        // Then
        assert_eq!(steps, (image.len() + VERIFICATION_CHUNK - 1) / VERIFICATION_CHUNK);
        assert!(context.properties().verified);
        assert_eq!(context.properties().metadata, metadata());
        assert_eq!(recorder.memory(200), binary(200));
        assert_eq!(
            context.continue_verify(&mut storage, &strict_policy(), &mut ()),
            Ok(Progress::Done)
        );
    }

    #[test]
    fn erased_slot_holds_no_image() {
        let mut storage = storage();
        assert_eq!(verify_image(&mut storage, 0, &lenient_policy()), Err(Error::NoImage));
    }

    #[test]
    fn partially_written_image_is_a_parse_error() {
        // Given
        let mut storage = storage();
        let image = application_image().build_signed(&signing_key());
        storage.erase_and_write(0, 0, &image[..image.len() / 2]).unwrap();

        // When
        let result = verify_image(&mut storage, 0, &strict_policy());

        // Then
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn image_running_past_its_slot_is_truncated() {
        // Given
        let mut storage = storage();
        let image = GblBuilder::new().prog(0, &binary(3000)).build();
        storage.erase_and_write(2, 0, &image[..PAGE as usize]).unwrap();

        // Then
        assert_eq!(
            verify_image(&mut storage, 2, &lenient_policy()),
            Err(Error::Parse(ParseFault::Truncated))
        );
    }

    #[test]
    fn failed_context_refuses_further_steps() {
        // Given
        let mut storage = storage();
        let mut context = VerificationContext::init(0);
        assert_eq!(
            context.continue_verify(&mut storage, &lenient_policy(), &mut ()),
            Err(Error::NoImage)
        );

        // When
        let image = application_image().build();
        storage.erase_and_write(0, 0, &image).unwrap();

        // Then
        assert_eq!(
            context.continue_verify(&mut storage, &lenient_policy(), &mut ()),
            Err(Error::NotInitialized)
        );
    }

    #[test]
    fn unknown_slot_is_rejected() {
        let mut storage = storage();
        assert!(matches!(
            verify_image(&mut storage, 3, &lenient_policy()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn bootloader_upgrade_reports_an_empty_application_type() {
        // Given
        let mut storage = storage();
        let image = GblBuilder::new().bootloader(0x0003_0000, 0, &binary(100)).build();
        storage.erase_and_write(0, 0, &image).unwrap();

        // When
        let info = image_info(&mut storage, 0, &lenient_policy()).unwrap();

        // Then
        assert_eq!(info.application_type, ApplicationType::empty());
        assert_eq!(info.bootloader_version, 0x0003_0000);
        let properties = verify_image(&mut storage, 0, &lenient_policy()).unwrap();
        assert_eq!(properties.contents, ImageContents::BOOTLOADER);
    }

    #[test]
    fn unreachable_device_fails_with_a_storage_error() {
        // Given
        let mut storage = storage();
        storage.erase_and_write(0, 0, &application_image().build()).unwrap();

        // When
        storage.device_mut().disconnect();

        // Then
        assert!(matches!(
            verify_image(&mut storage, 0, &lenient_policy()),
            Err(Error::Storage(_))
        ));
    }
}
