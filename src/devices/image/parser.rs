//! Incremental GBL container parser.
//!
//! The parser is pushed arbitrary chunks of a container and keeps all
//! the state needed to resume mid-field. Fixed size fields split across
//! chunks are gathered in an internal carry buffer; variable length
//! payloads are streamed straight through to the callbacks.
//!
//! Integrity and authenticity are accumulated on the fly: a CRC32 over
//! every byte up to the end tag's checksum, and a SHA-256 over every byte
//! before the signature tag. The initial program counter and following
//! vectors of the application, and the initial program counter of an
//! embedded bootloader, are withheld from the callbacks (replaced by
//! erased bytes) and only released once the whole container verifies.
use super::{
    tag, ApplicationType, ImageContents, ImagePolicy, ImageProperties, ParserCallbacks,
    CONTAINER_MAJOR_VERSION, CONTAINER_MAJOR_VERSION_MASK, CONTAINER_TYPE_ENCRYPTED,
    CONTAINER_TYPE_SIGNED, PRODUCT_ID_LENGTH, SIGNATURE_LENGTH,
};
use crate::{
    devices::Progress,
    error::{Error, ParseFault},
    utilities::bitwise::ERASED_BYTE,
};
use crc::crc32;
use log::{debug, warn};
use p256::ecdsa::{signature::DigestVerifier, Signature};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

const TAG_HEADER_LENGTH: usize = 8;
const CONTAINER_HEADER_LENGTH: u32 = 8;
const APPLICATION_INFO_LENGTH: u32 = 12 + PRODUCT_ID_LENGTH as u32;
const BOOTLOADER_INFO_LENGTH: u32 = 8;
const PROG_ADDRESS_LENGTH: u32 = 4;
const CHECKSUM_LENGTH: u32 = 4;

/// Largest fixed size field, the signature.
const CARRY_CAPACITY: usize = SIGNATURE_LENGTH;
/// Largest payload slice handed to a callback in one call.
const PAYLOAD_CHUNK: usize = 64;

/// Application vectors withheld until verification: initial program
/// counter first, then the following five exception vectors.
const WITHHELD_APPLICATION_OFFSET: u32 = 4;
const WITHHELD_APPLICATION_LENGTH: usize = 24;
/// Initial program counter of an embedded bootloader.
const WITHHELD_BOOTLOADER_OFFSET: u32 = 4;
const WITHHELD_BOOTLOADER_LENGTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    ContainerHeader,
    ContainerType,
    TagHeader,
    ApplicationInfo,
    BootloaderInfo,
    BootloaderData,
    ProgAddress,
    ProgData,
    MetadataData,
    Signature,
    Checksum,
    Done,
    Failed,
}

impl State {
    /// Length of the fixed size field the state gathers, if any.
    fn field_length(&self) -> Option<usize> {
        let length = match self {
            State::ContainerHeader | State::TagHeader => TAG_HEADER_LENGTH as u32,
            State::ContainerType => CONTAINER_HEADER_LENGTH,
            State::ApplicationInfo => APPLICATION_INFO_LENGTH,
            State::BootloaderInfo => BOOTLOADER_INFO_LENGTH,
            State::ProgAddress => PROG_ADDRESS_LENGTH,
            State::Signature => SIGNATURE_LENGTH as u32,
            State::Checksum => CHECKSUM_LENGTH,
            _ => return None,
        };
        Some(length as usize)
    }
}

/// Resumable parser for one container.
pub struct GblParser {
    state: State,
    carry: [u8; CARRY_CAPACITY],
    carried: usize,
    /// Bytes left in the variable length payload being streamed.
    remaining: u32,
    /// Offset into the current metadata or bootloader payload.
    offset: u32,
    programming_address: u32,
    application_base: u32,
    crc: u32,
    sha: Sha256,
    signature: [u8; SIGNATURE_LENGTH],
    withheld_application: [u8; WITHHELD_APPLICATION_LENGTH],
    withheld_bootloader: [u8; WITHHELD_BOOTLOADER_LENGTH],
    withheld: ImageContents,
    properties: ImageProperties,
}

impl Default for GblParser {
    fn default() -> Self { Self::new() }
}

impl GblParser {
    pub fn new() -> Self {
        Self {
            state: State::ContainerHeader,
            carry: [0; CARRY_CAPACITY],
            carried: 0,
            remaining: 0,
            offset: 0,
            programming_address: 0,
            application_base: 0,
            crc: 0,
            sha: Sha256::new(),
            signature: [0; SIGNATURE_LENGTH],
            withheld_application: [ERASED_BYTE; WITHHELD_APPLICATION_LENGTH],
            withheld_bootloader: [ERASED_BYTE; WITHHELD_BOOTLOADER_LENGTH],
            withheld: ImageContents::empty(),
            properties: ImageProperties::default(),
        }
    }

    /// Discards all progress, ready to parse a new container.
    pub fn reset(&mut self) {
        self.zeroize();
        *self = Self::new();
    }

    /// What has been established about the container so far.
    pub fn properties(&self) -> &ImageProperties { &self.properties }

    pub fn is_done(&self) -> bool { self.state == State::Done }

    /// Feeds the next chunk of the container.
    ///
    /// Returns [`Progress::Done`] once the end tag has been parsed and the
    /// container verified; bytes following the end tag are ignored. Any
    /// error is terminal: the parser wipes its state and refuses further
    /// input until reset.
    pub fn parse<C: ParserCallbacks + ?Sized>(
        &mut self,
        mut input: &[u8],
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<Progress, Error> {
        if self.state == State::Failed {
            return Err(Error::NotInitialized);
        }

        while !input.is_empty() && self.state != State::Done {
            match self.step(input, policy, callbacks) {
                Ok(consumed) => input = &input[consumed..],
                Err(error) => {
                    warn!("Image rejected: {}", error);
                    self.zeroize();
                    self.state = State::Failed;
                    return Err(error);
                }
            }
        }

        Ok(if self.state == State::Done { Progress::Done } else { Progress::Continue })
    }

    /// Consumes the start of `input`, returning how many bytes were used.
    fn step<C: ParserCallbacks + ?Sized>(
        &mut self,
        input: &[u8],
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<usize, Error> {
        match self.state.field_length() {
            Some(length) => {
                let take = (length - self.carried).min(input.len());
                self.carry[self.carried..self.carried + take].copy_from_slice(&input[..take]);
                self.carried += take;
                if self.carried == length {
                    self.carried = 0;
                    let mut field = self.carry;
                    let result = self.field(&field[..length], policy, callbacks);
                    field.zeroize();
                    self.carry.zeroize();
                    result?;
                }
                Ok(take)
            }
            None => {
                let take = (self.remaining as usize).min(input.len()).min(PAYLOAD_CHUNK);
                self.payload(&input[..take], callbacks);
                self.remaining -= take as u32;
                if self.remaining == 0 {
                    self.state = State::TagHeader;
                }
                Ok(take)
            }
        }
    }

    fn field<C: ParserCallbacks + ?Sized>(
        &mut self,
        field: &[u8],
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<(), Error> {
        match self.state {
            State::ContainerHeader => {
                self.digest(field, true);
                let (id, length) = (word(field, 0), word(field, 1));
                if id != tag::HEADER_V3 {
                    return Err(Error::Parse(ParseFault::UnexpectedTag));
                }
                if length != CONTAINER_HEADER_LENGTH {
                    return Err(Error::Parse(ParseFault::Malformed));
                }
                self.state = State::ContainerType;
            }
            State::ContainerType => {
                self.digest(field, true);
                let (version, container_type) = (word(field, 0), word(field, 1));
                if version & CONTAINER_MAJOR_VERSION_MASK != CONTAINER_MAJOR_VERSION {
                    return Err(Error::Parse(ParseFault::Version));
                }
                if container_type & CONTAINER_TYPE_ENCRYPTED != 0 {
                    return Err(Error::Parse(ParseFault::FileType));
                }
                if policy.require_authenticity && container_type & CONTAINER_TYPE_SIGNED == 0 {
                    return Err(Error::Parse(ParseFault::FileType));
                }
                self.application_base = policy.application_base;
                self.state = State::TagHeader;
            }
            State::TagHeader => self.tag_header(field, policy)?,
            State::ApplicationInfo => {
                self.digest(field, true);
                let version = word(field, 1);
                if version < policy.minimum_application_version {
                    return Err(Error::Parse(ParseFault::Version));
                }
                let metadata = &mut self.properties.metadata;
                metadata.application_type = ApplicationType::from_bits_retain(word(field, 0));
                metadata.version = version;
                metadata.capabilities = word(field, 2);
                metadata.product_id.copy_from_slice(&field[12..12 + PRODUCT_ID_LENGTH]);
                self.properties.contents |= ImageContents::APPLICATION;
                self.state = State::TagHeader;
            }
            State::BootloaderInfo => {
                self.digest(field, true);
                let address = word(field, 1);
                if address != policy.bootloader_base {
                    debug!("Bootloader built for {:#x}, expected {:#x}", address, policy.bootloader_base);
                    return Err(Error::Parse(ParseFault::UnexpectedTag));
                }
                self.properties.metadata.bootloader_version = word(field, 0);
                self.properties.contents |= ImageContents::BOOTLOADER;
                self.offset = 0;
                self.enter_payload(State::BootloaderData);
            }
            State::ProgAddress => {
                self.digest(field, true);
                self.programming_address = word(field, 0);
                self.enter_payload(State::ProgData);
            }
            State::Signature => {
                self.digest(field, false);
                self.signature.copy_from_slice(field);
                self.properties.signed = true;
                self.state = State::TagHeader;
            }
            State::Checksum => self.finish(word(field, 0), policy, callbacks)?,
            _ => unreachable!("payload states carry no fixed size field"),
        }
        Ok(())
    }

    fn tag_header(&mut self, field: &[u8], policy: &ImagePolicy) -> Result<(), Error> {
        let (id, length) = (word(field, 0), word(field, 1));
        if self.properties.signed && id != tag::END {
            return Err(Error::Parse(ParseFault::UnexpectedTag));
        }

        match id {
            tag::END => {
                if policy.require_authenticity && !self.properties.signed {
                    return Err(Error::Parse(ParseFault::UnexpectedTag));
                }
                self.digest(field, false);
                self.expect_length(length, CHECKSUM_LENGTH)?;
                self.state = State::Checksum;
            }
            tag::SIGNATURE_ECDSA_P256 => {
                self.digest(field, false);
                self.expect_length(length, SIGNATURE_LENGTH as u32)?;
                self.state = State::Signature;
            }
            tag::APPLICATION => {
                self.digest(field, true);
                self.expect_length(length, APPLICATION_INFO_LENGTH)?;
                self.state = State::ApplicationInfo;
            }
            tag::BOOTLOADER => {
                self.digest(field, true);
                self.remaining = payload_length(length, BOOTLOADER_INFO_LENGTH)?;
                self.state = State::BootloaderInfo;
            }
            tag::PROG | tag::ERASE_PROG => {
                self.digest(field, true);
                self.remaining = payload_length(length, PROG_ADDRESS_LENGTH)?;
                self.state = State::ProgAddress;
            }
            tag::METADATA => {
                self.digest(field, true);
                self.properties.contents |= ImageContents::METADATA;
                self.remaining = length;
                self.offset = 0;
                self.enter_payload(State::MetadataData);
            }
            tag::HEADER_V3 => return Err(Error::Parse(ParseFault::UnexpectedTag)),
            tag::ENCRYPTION_INIT | tag::ENCRYPTED_DATA => {
                return Err(Error::Parse(ParseFault::FileType))
            }
            _ => return Err(Error::Parse(ParseFault::UnknownTag)),
        }
        Ok(())
    }

    fn payload<C: ParserCallbacks + ?Sized>(&mut self, data: &[u8], callbacks: &mut C) {
        self.digest(data, true);
        let mut scratch = [0u8; PAYLOAD_CHUNK];
        let chunk = &mut scratch[..data.len()];
        chunk.copy_from_slice(data);

        match self.state {
            State::MetadataData => {
                callbacks.metadata(self.offset, chunk);
                self.offset += chunk.len() as u32;
            }
            State::BootloaderData => {
                if withhold(
                    self.offset,
                    chunk,
                    WITHHELD_BOOTLOADER_OFFSET,
                    &mut self.withheld_bootloader,
                ) {
                    self.withheld |= ImageContents::BOOTLOADER;
                }
                callbacks.bootloader(self.offset, chunk);
                self.offset += chunk.len() as u32;
            }
            State::ProgData => {
                let window_start = self.application_window();
                if withhold(
                    self.programming_address,
                    chunk,
                    window_start,
                    &mut self.withheld_application,
                ) {
                    self.withheld |= ImageContents::APPLICATION;
                }
                callbacks.application(self.programming_address, chunk);
                self.programming_address = self.programming_address.wrapping_add(chunk.len() as u32);
            }
            _ => {}
        }
        scratch.zeroize();
    }

    fn finish<C: ParserCallbacks + ?Sized>(
        &mut self,
        checksum: u32,
        policy: &ImagePolicy,
        callbacks: &mut C,
    ) -> Result<(), Error> {
        if checksum != self.crc {
            return Err(Error::Parse(ParseFault::Crc));
        }
        self.properties.completed = true;

        if self.properties.signed {
            let key = policy.verifying_key.as_ref().ok_or(Error::VerificationFailed)?;
            let signature =
                Signature::from_slice(&self.signature).map_err(|_| Error::VerificationFailed)?;
            key.verify_digest(self.sha.clone(), &signature)
                .map_err(|_| Error::VerificationFailed)?;
        }
        self.properties.verified = true;

        if self.withheld.contains(ImageContents::BOOTLOADER) {
            callbacks.bootloader(WITHHELD_BOOTLOADER_OFFSET, &self.withheld_bootloader);
        }
        if self.withheld.contains(ImageContents::APPLICATION) {
            let window_start = self.application_window();
            let (program_counter, vectors) = self.withheld_application.split_at(4);
            callbacks.application(window_start + 4, vectors);
            // The program counter goes last: a valid one marks a complete image.
            callbacks.application(window_start, program_counter);
        }

        let properties = self.properties;
        self.zeroize();
        self.properties = properties;
        self.state = State::Done;
        debug!("Image verified: {:?}", self.properties.contents);
        Ok(())
    }

    fn application_window(&self) -> u32 {
        self.application_base.wrapping_add(WITHHELD_APPLICATION_OFFSET)
    }

    fn enter_payload(&mut self, state: State) {
        self.state = if self.remaining == 0 { State::TagHeader } else { state };
    }

    fn expect_length(&self, length: u32, expected: u32) -> Result<(), Error> {
        if length == expected {
            Ok(())
        } else {
            Err(Error::Parse(ParseFault::Malformed))
        }
    }

    fn digest(&mut self, bytes: &[u8], authenticated: bool) {
        self.crc = crc32::update(self.crc, &crc32::IEEE_TABLE, bytes);
        if authenticated {
            self.sha.update(bytes);
        }
    }
}

impl Zeroize for GblParser {
    fn zeroize(&mut self) {
        self.carry.zeroize();
        self.carried = 0;
        self.remaining = 0;
        self.offset = 0;
        self.programming_address = 0;
        self.crc = 0;
        Digest::reset(&mut self.sha);
        self.signature.zeroize();
        self.withheld_application.zeroize();
        self.withheld_bootloader.zeroize();
        self.withheld = ImageContents::empty();
        self.properties = ImageProperties::default();
    }
}

impl Drop for GblParser {
    fn drop(&mut self) { self.zeroize(); }
}

/// Parses a whole container held in memory.
pub fn parse_buffer<C: ParserCallbacks + ?Sized>(
    bytes: &[u8],
    policy: &ImagePolicy,
    callbacks: &mut C,
) -> Result<ImageProperties, Error> {
    let mut parser = GblParser::new();
    match parser.parse(bytes, policy, callbacks)? {
        Progress::Done => Ok(*parser.properties()),
        Progress::Continue => Err(Error::Parse(ParseFault::Truncated)),
    }
}

fn word(bytes: &[u8], index: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[index * 4..index * 4 + 4]);
    u32::from_le_bytes(word)
}

fn payload_length(tag_length: u32, header_length: u32) -> Result<u32, Error> {
    tag_length.checked_sub(header_length).ok_or(Error::Parse(ParseFault::Malformed))
}

/// Moves the part of `chunk` (which sits at `address`) overlapping the
/// window `[window_start, window_start + withheld.len())` into `withheld`,
/// leaving erased bytes in its place. Returns whether anything was moved.
fn withhold(address: u32, chunk: &mut [u8], window_start: u32, withheld: &mut [u8]) -> bool {
    let chunk_start = address as u64;
    let chunk_end = chunk_start + chunk.len() as u64;
    let window_start = window_start as u64;
    let window_end = window_start + withheld.len() as u64;

    let start = chunk_start.max(window_start);
    let end = chunk_end.min(window_end);
    if start >= end {
        return false;
    }

    let source = (start - chunk_start) as usize..(end - chunk_start) as usize;
    let destination = (start - window_start) as usize;
    withheld[destination..destination + source.len()].copy_from_slice(&chunk[source.clone()]);
    chunk[source].fill(ERASED_BYTE);
    true
}
