//! Firmware image container parsing and verification.
//!
//! Images are stored in slots in the GBL v3 container format: a
//! sequence of little-endian tags, each an identifier, a body length
//! and the body itself.
//!
//! | Tag         | Body                                                   |
//! |-------------|--------------------------------------------------------|
//! | Header      | Container version, container type flags                |
//! | Application | Application type, version, capabilities, product id    |
//! | Bootloader  | Bootloader version, base address, bootloader binary    |
//! | Prog        | Programming address, application binary chunk          |
//! | Metadata    | Opaque application defined data                        |
//! | Signature   | ECDSA P-256 `r ‖ s` over SHA-256 of every prior byte   |
//! | End         | CRC32 of every prior byte, end tag header included     |
//!
//! [`parser::GblParser`] consumes a container incrementally from any
//! chunking of its bytes. [`verify::VerificationContext`] drives the
//! parser over an image held in a storage slot.

pub mod builder;
pub mod parser;
pub mod verify;

use bitflags::bitflags;
use p256::ecdsa::VerifyingKey;

/// Tag identifiers.
pub mod tag {
    pub const HEADER_V3: u32 = 0x03A6_17EB;
    pub const BOOTLOADER: u32 = 0xF509_09F5;
    pub const APPLICATION: u32 = 0xF40A_0AF4;
    pub const METADATA: u32 = 0xF608_08F6;
    pub const PROG: u32 = 0xFE01_01FE;
    pub const ERASE_PROG: u32 = 0xFD03_03FD;
    pub const END: u32 = 0xFC04_04FC;
    pub const SIGNATURE_ECDSA_P256: u32 = 0xF70A_0AF7;
    pub const ENCRYPTION_INIT: u32 = 0xFA06_06FA;
    pub const ENCRYPTED_DATA: u32 = 0xF907_07F9;
}

/// Major version of the container format understood by the parser.
pub const CONTAINER_MAJOR_VERSION: u32 = 0x0300_0000;
/// Mask selecting the major version of a container version word.
pub const CONTAINER_MAJOR_VERSION_MASK: u32 = 0xFF00_0000;
/// Container type flag: the body is AES-CCM encrypted.
pub const CONTAINER_TYPE_ENCRYPTED: u32 = 0x0000_0001;
/// Container type flag: the container carries an ECDSA signature.
pub const CONTAINER_TYPE_SIGNED: u32 = 0x0000_0100;

/// Length of a product identifier.
pub const PRODUCT_ID_LENGTH: usize = 16;
/// Length of an ECDSA P-256 signature body.
pub const SIGNATURE_LENGTH: usize = 64;

bitflags! {
    /// Stacks an application image targets.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ApplicationType: u32 {
        const ZIGBEE = 1 << 0;
        const THREAD = 1 << 1;
        const FLEX = 1 << 2;
        const BLUETOOTH = 1 << 3;
        const MCU = 1 << 4;
        const BLUETOOTH_APP = 1 << 5;
        const BOOTLOADER = 1 << 6;
        const ZWAVE = 1 << 7;
    }
}

bitflags! {
    /// Kinds of payload found in a container.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ImageContents: u8 {
        const APPLICATION = 1 << 0;
        const BOOTLOADER = 1 << 1;
        const METADATA = 1 << 2;
    }
}

/// Descriptive record extracted from a parsed image.
///
/// A bootloader upgrade image without an application section has an
/// empty [`ApplicationType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationImageMetadata {
    pub application_type: ApplicationType,
    pub version: u32,
    pub capabilities: u32,
    pub product_id: [u8; PRODUCT_ID_LENGTH],
    /// Version of the bootloader carried in the image, zero if none.
    pub bootloader_version: u32,
}

impl Default for ApplicationImageMetadata {
    fn default() -> Self {
        Self {
            application_type: ApplicationType::empty(),
            version: 0,
            capabilities: 0,
            product_id: [0; PRODUCT_ID_LENGTH],
            bootloader_version: 0,
        }
    }
}

/// What a parse has established about an image so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageProperties {
    pub contents: ImageContents,
    pub metadata: ApplicationImageMetadata,
    /// The container carries a signature tag.
    pub signed: bool,
    /// The end tag was reached and its checksum matched.
    pub completed: bool,
    /// Completed, and the signature checked out where one was present
    /// or required.
    pub verified: bool,
}

impl Default for ImageContents {
    fn default() -> Self { ImageContents::empty() }
}

/// Rules a parse enforces.
#[derive(Clone, Debug, Default)]
pub struct ImagePolicy {
    /// Reject images that are not signed by `verifying_key`.
    pub require_authenticity: bool,
    /// Key signatures are checked against. Signed images fail
    /// verification when no key is configured.
    pub verifying_key: Option<VerifyingKey>,
    /// Address of the application's vector table. The initial program
    /// counter and following vectors are withheld from the application
    /// callback until the whole image is verified.
    pub application_base: u32,
    /// Address a bootloader upgrade must be built for.
    pub bootloader_base: u32,
    /// Applications older than this are rejected. Zero accepts any version.
    pub minimum_application_version: u32,
}

/// Receives the payloads found while parsing. A large tag may be split
/// over several calls; the address tells continuation from a new tag.
pub trait ParserCallbacks {
    /// Application binary bytes for absolute `address`.
    fn application(&mut self, _address: u32, _data: &[u8]) {}
    /// Metadata bytes at `offset` from the start of the metadata tag.
    fn metadata(&mut self, _offset: u32, _data: &[u8]) {}
    /// Bootloader binary bytes at `offset` from the start of the
    /// bootloader binary.
    fn bootloader(&mut self, _offset: u32, _data: &[u8]) {}
}

/// Discards every payload.
impl ParserCallbacks for () {}
