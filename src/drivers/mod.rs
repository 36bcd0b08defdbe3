//! Driver implementations over the abstract hardware interfaces in
//! [`crate::hal`].

pub mod dma_serial;
