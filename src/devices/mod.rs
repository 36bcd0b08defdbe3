//! Modules with business logic related to the problem
//! domain, that lay on top of the abstract hardware
//! interfaces.

pub mod boot_order;
pub mod bootloader;
pub mod gate;
pub mod image;
pub mod interface;
pub mod storage;

/// Outcome of one step of a resumable operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    /// More steps are needed.
    Continue,
    /// The operation completed successfully.
    Done,
}

/// General purpose traits that summarize requirements on collaborators.
pub mod traits {
    use crate::{error::Convertible, hal::flash};

    /// A supported raw storage device must be able to lift its errors
    /// into the core's error type.
    pub trait Flash: flash::RawStorage<Error: Convertible> {}
    impl<F: flash::RawStorage<Error: Convertible>> Flash for F {}
}
