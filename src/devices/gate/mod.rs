//! Secure/non-secure call gate.
//!
//! Untrusted code reaches the trusted core only through a
//! [`SecureGate`]. Every pointer it passes is an address in its own
//! memory, and every entry point follows the same sequence:
//!
//! 1. Check the arity of descriptor arrays, failing with
//!    [`Error::InvalidArgument`].
//! 2. Check that every range the call will touch, descriptor arrays
//!    included, lies in untrusted memory. A range that doesn't ends the
//!    call in a [`ResetCause::SecurityViolation`] reset; the wrapped
//!    operation never runs and the caller never hears back.
//! 3. Save and disable the protection unit around the dispatch, restoring
//!    it on every return path.
//! 4. Copy results back into untrusted memory.
//!
//! Verification contexts and erase progress never cross the boundary.
//! The untrusted side reserves a buffer for each and the gate keeps the
//! real state on the secure side, keyed by the buffer's address.
pub mod memory;

use self::memory::{Claim, NonSecureMemory, NsSlice, SecureCallArgument, ARGUMENT_SIZE};
use super::{
    image::{
        verify::{VerificationContext, VERIFICATION_CONTEXT_SIZE},
        ApplicationImageMetadata, PRODUCT_ID_LENGTH,
    },
    interface::BootloaderInterface,
    storage::{EraseStatus, StorageDeviceInfo, StorageSlot, MAX_SLOTS},
    Progress,
};
use crate::{
    error::Error,
    hal::{
        protection::{ProtectionUnit, ResetCause, SystemReset},
        time::Milliseconds,
    },
    utilities::guard::Guard,
};
use core::mem::size_of;
use log::error;
use zeroize::Zeroize;

/// Sessions of each kind the gate tracks at once.
pub const MAX_SESSIONS: usize = 4;
/// Untrusted buffer reserved for a chunked erase in progress.
pub const ERASE_STATUS_SIZE: u32 = 16;
/// Encoded [`StorageDeviceInfo`]: five words.
pub const STORAGE_INFO_SIZE: u32 = 20;
/// Encoded [`StorageSlot`]: address and length words.
pub const SLOT_INFO_SIZE: u32 = 8;
/// Encoded [`ApplicationImageMetadata`]: type, version and capability
/// words, product id, bootloader version word.
pub const METADATA_SIZE: u32 = 16 + PRODUCT_ID_LENGTH as u32;

const WORD: u32 = size_of::<u32>() as u32;

/// Secure side state keyed by the address of its untrusted placeholder.
struct Sessions<T> {
    entries: [Option<(u32, T)>; MAX_SESSIONS],
}

impl<T> Sessions<T> {
    fn new() -> Self { Self { entries: core::array::from_fn(|_| None) } }

    /// Starts a session, replacing any previous one on the same key.
    fn open(&mut self, key: u32, value: T) -> Result<(), Error> {
        let entry = match self.entries.iter().position(|e| matches!(e, Some((k, _)) if *k == key)) {
            Some(index) => &mut self.entries[index],
            None => self.entries.iter_mut().find(|e| e.is_none()).ok_or(Error::Busy)?,
        };
        *entry = Some((key, value));
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<&mut T, Error> {
        self.entries
            .iter_mut()
            .find_map(|e| match e {
                Some((k, value)) if *k == key => Some(value),
                _ => None,
            })
            .ok_or(Error::NotInitialized)
    }

    fn close(&mut self, key: u32) {
        self.entries.iter_mut().filter(|e| matches!(e, Some((k, _)) if *k == key)).for_each(|e| *e = None);
    }
}

/// Validating adapter between untrusted callers and a trusted core.
pub struct SecureGate<'a, I, P, R>
where
    I: BootloaderInterface + ?Sized,
    P: ProtectionUnit,
    R: SystemReset,
{
    core: &'a mut I,
    memory: NonSecureMemory,
    protection: P,
    reset: R,
    verifications: Sessions<VerificationContext>,
    erasures: Sessions<EraseStatus>,
}

impl<'a, I, P, R> SecureGate<'a, I, P, R>
where
    I: BootloaderInterface + ?Sized,
    P: ProtectionUnit,
    R: SystemReset,
{
    pub fn new(core: &'a mut I, memory: NonSecureMemory, protection: P, reset: R) -> Self {
        Self {
            core,
            memory,
            protection,
            reset,
            verifications: Sessions::new(),
            erasures: Sessions::new(),
        }
    }

    /// The untrusted side's memory, for it to stage arguments in and
    /// collect results from.
    pub fn memory(&self) -> &NonSecureMemory { &self.memory }

    pub fn memory_mut(&mut self) -> &mut NonSecureMemory { &mut self.memory }

    pub fn protection(&self) -> &P { &self.protection }

    pub fn storage_info(&mut self, out: u32) -> Result<(), Error> {
        let out = self.claim(out, STORAGE_INFO_SIZE);
        let info: StorageDeviceInfo = protected(&mut self.protection, || self.core.storage_info())?;
        encode_words(
            self.memory.bytes_mut(&out),
            &[info.page_size, info.word_size, info.capacity, info.capabilities.bits(), info.slot_count],
        );
        Ok(())
    }

    pub fn slot_info(&mut self, slot: u32, out: u32) -> Result<(), Error> {
        let out = self.claim(out, SLOT_INFO_SIZE);
        let info: StorageSlot = protected(&mut self.protection, || self.core.slot_info(slot))?;
        encode_words(self.memory.bytes_mut(&out), &[info.address, info.length]);
        Ok(())
    }

    pub fn read(&mut self, slot: u32, offset: u32, buffer: u32, length: u32) -> Result<(), Error> {
        let buffer = self.claim(buffer, length);
        protected(&mut self.protection, || {
            self.core.read(slot, offset, self.memory.bytes_mut(&buffer))
        })
    }

    pub fn write(&mut self, slot: u32, offset: u32, data: u32, length: u32) -> Result<(), Error> {
        let data = self.claim(data, length);
        protected(&mut self.protection, || self.core.write(slot, offset, self.memory.bytes(&data)))
    }

    pub fn erase_and_write(
        &mut self,
        slot: u32,
        offset: u32,
        data: u32,
        length: u32,
    ) -> Result<(), Error> {
        let data = self.claim(data, length);
        protected(&mut self.protection, || {
            self.core.erase_and_write(slot, offset, self.memory.bytes(&data))
        })
    }

    pub fn erase_slot(&mut self, slot: u32) -> Result<(), Error> {
        protected(&mut self.protection, || self.core.erase_slot(slot))
    }

    /// Starts a chunked erase tracked under the untrusted `status` buffer.
    pub fn chunked_erase_init(&mut self, slot: u32, status: u32) -> Result<(), Error> {
        let status = self.claim(status, ERASE_STATUS_SIZE);
        self.memory.bytes_mut(&status).zeroize();
        let erase = protected(&mut self.protection, || self.core.chunked_erase_init(slot))?;
        self.erasures.open(status.base(), erase)
    }

    pub fn chunked_erase_step(&mut self, status: u32) -> Result<Progress, Error> {
        let status = self.claim(status, ERASE_STATUS_SIZE);
        let result = protected(&mut self.protection, || {
            let erase = self.erasures.get(status.base())?;
            self.core.chunked_erase_step(erase)
        });
        if result != Ok(Progress::Continue) {
            self.erasures.close(status.base());
        }
        result
    }

    /// Starts verifying `slot`, tracked under the untrusted `context`
    /// buffer, which is zeroed.
    pub fn init_verify_image(&mut self, slot: u32, context: u32) -> Result<(), Error> {
        let context = self.claim(context, VERIFICATION_CONTEXT_SIZE as u32);
        self.memory.bytes_mut(&context).zeroize();
        let verification = protected(&mut self.protection, || self.core.init_verify_image(slot))?;
        self.verifications.open(context.base(), verification)
    }

    /// Advances the verification tracked under `context`. The session
    /// ends with the verification, successful or not.
    pub fn continue_verify_image(&mut self, context: u32) -> Result<Progress, Error> {
        let context = self.claim(context, VERIFICATION_CONTEXT_SIZE as u32);
        let result = protected(&mut self.protection, || {
            let verification = self.verifications.get(context.base())?;
            self.core.continue_verify_image(verification, &mut ())
        });
        if result != Ok(Progress::Continue) {
            self.verifications.close(context.base());
        }
        result
    }

    pub fn verify_image(&mut self, slot: u32, metadata: u32) -> Result<(), Error> {
        let metadata = self.claim(metadata, METADATA_SIZE);
        let properties = protected(&mut self.protection, || self.core.verify_image(slot))?;
        encode_metadata(self.memory.bytes_mut(&metadata), &properties.metadata);
        Ok(())
    }

    pub fn image_info(&mut self, slot: u32, metadata: u32) -> Result<(), Error> {
        let metadata = self.claim(metadata, METADATA_SIZE);
        let info = protected(&mut self.protection, || self.core.image_info(slot))?;
        encode_metadata(self.memory.bytes_mut(&metadata), &info);
        Ok(())
    }

    /// Copies the boot order into the untrusted array of `capacity` slot
    /// id words, returning how many entries it holds.
    pub fn images_to_bootload(&mut self, slots: u32, capacity: u32) -> Result<u32, Error> {
        let length = capacity.checked_mul(WORD).unwrap_or_else(|| self.violation(slots, capacity));
        let slots = self.claim(slots, length);
        let order = protected(&mut self.protection, || self.core.images_to_bootload())?;
        if order.len() > capacity as usize {
            return Err(Error::InvalidArgument("Boot order does not fit the array"));
        }
        let mut words = [0u32; MAX_SLOTS];
        order.slots().zip(words.iter_mut()).for_each(|(slot, word)| *word = slot);
        encode_words(self.memory.bytes_mut(&slots), &words[..order.len()]);
        Ok(order.len() as u32)
    }

    pub fn set_images_to_bootload(&mut self, slots: u32, count: u32) -> Result<(), Error> {
        if count as usize > MAX_SLOTS {
            return Err(Error::InvalidArgument("Boot order longer than slot count"));
        }
        let claim = self.claim(slots, count * WORD);
        let mut order = [0u32; MAX_SLOTS];
        decode_words(self.memory.bytes(&claim), &mut order[..count as usize]);
        protected(&mut self.protection, || {
            self.core.set_images_to_bootload(&order[..count as usize])
        })
    }

    pub fn promote_slot_to_boot_first(&mut self, slot: u32) -> Result<(), Error> {
        protected(&mut self.protection, || self.core.promote_slot_to_boot_first(slot))
    }

    pub fn clear_images_to_bootload(&mut self) -> Result<(), Error> {
        protected(&mut self.protection, || self.core.clear_images_to_bootload())
    }

    pub fn reboot_and_install(&mut self) -> ! {
        self.protection.save_and_disable();
        self.core.reboot_and_install()
    }

    /// Receives into an untrusted buffer.
    ///
    /// `inputs` holds two descriptors: a `blocking` byte and a `timeout`
    /// word in milliseconds. `outputs` holds two: the data buffer and a
    /// word that receives the number of bytes copied. The count is written
    /// back even when the receive times out.
    pub fn receive_buffer(
        &mut self,
        inputs: u32,
        input_count: u32,
        outputs: u32,
        output_count: u32,
    ) -> Result<(), Error> {
        check_arity(input_count, 2, output_count, 2)?;
        let [blocking, timeout] = self.arguments::<2>(inputs);
        let [buffer, received] = self.arguments::<2>(outputs);

        let blocking = read_flag(self.memory.bytes(&blocking))?;
        let timeout = Milliseconds(read_word(self.memory.bytes(&timeout))?);
        if received.len() < WORD as usize {
            return Err(Error::InvalidArgument("Received length descriptor too short"));
        }

        let outcome = protected(&mut self.protection, || {
            self.core.receive(self.memory.bytes_mut(&buffer), blocking, timeout)
        });
        encode_words(self.memory.bytes_mut(&received), &[outcome.count as u32]);
        outcome.status
    }

    /// Sends from an untrusted buffer.
    ///
    /// `inputs` holds two descriptors: the data and a `blocking` byte.
    /// There are no outputs.
    pub fn send_buffer(
        &mut self,
        inputs: u32,
        input_count: u32,
        _outputs: u32,
        output_count: u32,
    ) -> Result<(), Error> {
        check_arity(input_count, 2, output_count, 0)?;
        let [data, blocking] = self.arguments::<2>(inputs);

        let blocking = read_flag(self.memory.bytes(&blocking))?;
        protected(&mut self.protection, || self.core.send(self.memory.bytes(&data), blocking))
    }

    pub fn flush(&mut self, transmit: bool, receive: bool) -> Result<(), Error> {
        protected(&mut self.protection, || self.core.flush(transmit, receive))
    }

    pub fn available(&mut self) -> Result<u32, Error> {
        protected(&mut self.protection, || self.core.available()).map(|count| count as u32)
    }

    /// Validates a descriptor array and every range it describes.
    fn arguments<const N: usize>(&mut self, table: u32) -> [Claim; N] {
        let table = self.claim(table, N as u32 * ARGUMENT_SIZE);
        let descriptors: [SecureCallArgument; N] = core::array::from_fn(|index| {
            let start = index * ARGUMENT_SIZE as usize;
            SecureCallArgument::decode(&self.memory.bytes(&table)[start..start + ARGUMENT_SIZE as usize])
        });
        descriptors.map(|argument| self.claim(argument.base, argument.length))
    }

    /// Turns an alleged range into a claim, or resets.
    fn claim(&mut self, base: u32, length: u32) -> Claim {
        match NsSlice::from_raw(base, length).and_then(|slice| self.memory.claim(slice)) {
            Some(claim) => claim,
            None => self.violation(base, length),
        }
    }

    fn violation(&mut self, base: u32, length: u32) -> ! {
        error!("Untrusted caller passed memory it does not own: {:#x} (+{:#x})", base, length);
        self.reset.reset(ResetCause::SecurityViolation)
    }
}

/// Runs `operation` with the protection unit saved and disabled.
fn protected<P: ProtectionUnit, T>(protection: &mut P, operation: impl FnOnce() -> T) -> T {
    let _guard = Guard::new(protection, |p| p.save_and_disable(), |p, state| p.restore(state));
    operation()
}

fn check_arity(inputs: u32, expected_inputs: u32, outputs: u32, expected_outputs: u32) -> Result<(), Error> {
    if inputs == expected_inputs && outputs == expected_outputs {
        Ok(())
    } else {
        Err(Error::InvalidArgument("Wrong number of call arguments"))
    }
}

fn read_flag(bytes: &[u8]) -> Result<bool, Error> {
    bytes.first().map(|b| *b != 0).ok_or(Error::InvalidArgument("Flag descriptor is empty"))
}

fn read_word(bytes: &[u8]) -> Result<u32, Error> {
    let mut word = [0u32; 1];
    if bytes.len() < WORD as usize {
        return Err(Error::InvalidArgument("Word descriptor too short"));
    }
    decode_words(bytes, &mut word);
    Ok(word[0])
}

fn encode_words(bytes: &mut [u8], words: &[u32]) {
    bytes.chunks_exact_mut(WORD as usize).zip(words).for_each(|(chunk, word)| {
        chunk.copy_from_slice(&word.to_le_bytes());
    });
}

fn decode_words(bytes: &[u8], words: &mut [u32]) {
    bytes.chunks_exact(WORD as usize).zip(words.iter_mut()).for_each(|(chunk, word)| {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    });
}

fn encode_metadata(bytes: &mut [u8], metadata: &ApplicationImageMetadata) {
    encode_words(
        &mut bytes[..12],
        &[metadata.application_type.bits(), metadata.version, metadata.capabilities],
    );
    bytes[12..12 + PRODUCT_ID_LENGTH].copy_from_slice(&metadata.product_id);
    encode_words(&mut bytes[12 + PRODUCT_ID_LENGTH..], &[metadata.bootloader_version]);
}
