//! Hardware Abstraction Layer, containing interfaces
//! for the collaborators the trusted core drives: raw
//! storage, DMA channels, a clock, and the memory
//! protection and reset machinery.

pub mod dma;
pub mod flash;
pub mod protection;
pub mod serial;
pub mod time;

#[doc(hidden)]
pub mod doubles;
