//! # Bootgate Library
//!
//! Trusted image storage and secure call gate core for a secure
//! bootloader, in library form. Everything here is hardware
//! independent: the [`hal`] traits describe the collaborators
//! (raw storage, DMA engine, clock, protection unit) and the
//! [`hal::doubles`] module provides host implementations of them.
//!
//! The main entry points are:
//!
//! * [`devices::bootloader::Bootloader`], the trusted core.
//! * [`devices::gate::SecureGate`], the validating adapter that
//!   untrusted callers go through.
//! * [`drivers::dma_serial::BufferedSerial`], the double buffered
//!   serial transport.

pub mod utilities {
    pub mod bitwise;
    pub mod guard;
    pub mod memory;
}

pub mod config;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod hal;
