//! End to end flows through the public surface: an untrusted caller
//! stages an image through the secure gate, verifies it stepwise and
//! makes it the boot candidate.
use bootgate_lib::{
    devices::{
        bootloader::Bootloader,
        gate::{memory::NonSecureMemory, memory::NsSlice, SecureGate, METADATA_SIZE},
        image::{
            builder::GblBuilder, verify::VERIFICATION_CONTEXT_SIZE, ApplicationImageMetadata,
            ApplicationType, ImagePolicy,
        },
        interface::BootloaderInterface,
        storage::{Storage, StorageSlot},
        Progress,
    },
    drivers::dma_serial::BufferedSerial,
    error::Error,
    hal::doubles::{
        dma::FakeDma,
        flash::FakeFlash,
        protection::{FakeMpu, PanickingReset},
        time::MockSysTick,
    },
};
use p256::ecdsa::{SigningKey, VerifyingKey};

const PAGE: u32 = 2048;
const APPLICATION_BASE: u32 = 0x0800_8000;
const NS_RAM: u32 = 0x2000_0000;

type Core = Bootloader<FakeFlash, BufferedSerial<FakeDma, MockSysTick, 128, 64>, PanickingReset>;

fn key() -> SigningKey { SigningKey::from_slice(&[0x3C; 32]).unwrap() }

fn core() -> Core {
    let slots = [
        StorageSlot { address: 0, length: 12 * PAGE },
        StorageSlot { address: 12 * PAGE, length: 12 * PAGE },
        StorageSlot { address: 24 * PAGE, length: 6 * PAGE },
    ];
    let storage = Storage::new(FakeFlash::new(PAGE, 32 * PAGE), &slots, 31 * PAGE).unwrap();
    let policy = ImagePolicy {
        require_authenticity: true,
        verifying_key: Some(VerifyingKey::from(&key())),
        application_base: APPLICATION_BASE,
        ..Default::default()
    };
    let mut core = Bootloader::new(policy, PanickingReset);
    core.bind_storage(storage);
    core.bind_serial(BufferedSerial::new(FakeDma::new().with_loopback(), MockSysTick::default()));
    core
}

fn image(version: u32) -> Vec<u8> {
    let metadata = ApplicationImageMetadata {
        application_type: ApplicationType::MCU,
        version,
        product_id: *b"integration-test",
        ..Default::default()
    };
    let binary: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
    GblBuilder::new().application(&metadata).prog(APPLICATION_BASE, &binary).build_signed(&key())
}

fn stage(memory: &mut NonSecureMemory, address: u32, bytes: &[u8]) {
    let claim = memory.claim(NsSlice::from_raw(address, bytes.len() as u32).unwrap()).unwrap();
    memory.bytes_mut(&claim).copy_from_slice(bytes);
}

fn word(memory: &NonSecureMemory, address: u32) -> u32 {
    let claim = memory.claim(NsSlice::from_raw(address, 4).unwrap()).unwrap();
    let bytes = memory.bytes(&claim);
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[test]
fn untrusted_caller_installs_and_promotes_an_image() {
    // Given
    let mut core = core();
    core.set_images_to_bootload(&[0, 2]).unwrap();
    let update = image(0x0002_0000);
    let staging = NS_RAM + 0x1000;
    let context = NS_RAM + 0x100;
    let metadata = NS_RAM + 0x800;
    let order = NS_RAM + 0x900;

    let mut memory = NonSecureMemory::new().with_area(NS_RAM, 0x4000);
    stage(&mut memory, staging, &update);
    let mut gate = SecureGate::new(&mut core, memory, FakeMpu::default(), PanickingReset);

    // When
    gate.erase_slot(1).unwrap();
    gate.write(1, 0, staging, update.len() as u32).unwrap();
    gate.init_verify_image(1, context).unwrap();
    while gate.continue_verify_image(context).unwrap() == Progress::Continue {}
    gate.image_info(1, metadata).unwrap();
    gate.promote_slot_to_boot_first(1).unwrap();
    let count = gate.images_to_bootload(order, 8).unwrap();

    // Then
    let memory = gate.memory();
    assert_eq!(word(memory, metadata + 4), 0x0002_0000);
    assert_eq!(count, 3);
    assert_eq!([word(memory, order), word(memory, order + 4), word(memory, order + 8)], [1, 0, 2]);
    assert_eq!(gate.protection().saves, gate.protection().restores);
    assert!(gate.protection().enabled);
}

#[test]
fn tampered_image_never_becomes_bootable() {
    // Given
    let mut core = core();
    let mut tampered = image(7);
    let middle = tampered.len() / 2;
    tampered[middle] ^= 0x01;

    // When
    core.erase_and_write(0, 0, &tampered).unwrap();

    // Then
    assert!(matches!(core.verify_image(0), Err(Error::Parse(_)) | Err(Error::VerificationFailed)));
    assert!(core.image_info(0).is_err());
    assert_eq!(core.images_to_bootload().map(|_| ()), Err(Error::MissingMetadata));
}

#[test]
fn image_info_reports_without_stepping() {
    // Given
    let mut core = core();
    core.erase_and_write(2, 0, &image(0x0100_0001)).unwrap();

    // When
    let metadata = core.image_info(2).unwrap();

    // Then
    assert_eq!(metadata.version, 0x0100_0001);
    assert_eq!(&metadata.product_id, b"integration-test");
    assert_eq!(core.image_info(1).map(|_| ()), Err(Error::NoImage));
}

#[test]
fn verification_context_fits_its_reserved_buffer() {
    assert!(core::mem::size_of::<bootgate_lib::devices::image::verify::VerificationContext>()
        <= VERIFICATION_CONTEXT_SIZE);
    assert_eq!(METADATA_SIZE, 32);
}
