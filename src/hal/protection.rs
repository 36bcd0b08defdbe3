//! Memory protection and reset machinery of the secure domain.

/// Opaque snapshot of a protection unit's configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectionState(pub u32);

/// Memory protection unit guarding the trusted core's own memory.
///
/// Implementations must perform `save_and_disable` and `restore` as
/// critical sections (interrupts masked, or a single core relied upon),
/// as both mutate configuration visible to any preempting handler.
pub trait ProtectionUnit {
    /// Captures the current configuration and disables enforcement.
    fn save_and_disable(&mut self) -> ProtectionState;
    /// Reinstates a configuration captured by `save_and_disable`.
    fn restore(&mut self, state: ProtectionState);
}

/// Why the system was reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetCause {
    /// The boot order was committed and the bootloader should act on it.
    BootloadRequested,
    /// An untrusted caller passed memory it does not own across the
    /// call gate.
    SecurityViolation,
}

/// Non returning system reset.
pub trait SystemReset {
    /// Records `cause` where it survives the reset, then resets.
    fn reset(&mut self, cause: ResetCause) -> !;
}
