//! Host implementations of the hardware abstraction layer, used by the
//! test suite and the host simulator.
pub mod dma;
pub mod flash;
pub mod protection;
pub mod time;
