#![allow(clippy::uninlined_format_args)]

//! Error related data structures to be shared and used.
//!
//! This module contains the [`Error`] enum, which is used to represent
//! errors that can occur within the emulator core's domain.

use std::fmt::{self, Display, Formatter};

/// Top level enum for error handling within the core.
///
/// Most of the time, you will want to use the `CustomError` variant
/// to provide a more detailed error message, or one of the cartridge-
/// construction variants when the failure is a well-known header or
/// file-size problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    InvalidData,
    RomSize,
    IncompatibleBootRom,
    InvalidParameter(String),
    CustomError(String),

    /// A ROM/RAM file could not be opened, read, or written.
    Io(String),

    /// A file's size did not match what was expected for it.
    InvalidSize { expected: usize, actual: usize },

    /// The Nintendo logo bytes at 0x104-0x133 did not match the
    /// fixed reference sequence.
    HeaderLogoMismatch,

    /// The header checksum at 0x14D did not match the computed
    /// checksum over 0x134-0x14C.
    HeaderChecksumMismatch { expected: u8, actual: u8 },

    /// Cartridge-type byte 0x147 names an MBC family that is not
    /// implemented.
    UnsupportedCartridgeType(u8),

    /// The RAM-size byte, or a loaded battery-RAM file, did not
    /// agree with the RAM size the validator expects.
    RamSizeMismatch { expected: usize, actual: usize },
}

impl Error {
    pub fn description(&self) -> String {
        match self {
            Error::InvalidData => String::from("Invalid data format"),
            Error::RomSize => String::from("Invalid ROM size"),
            Error::IncompatibleBootRom => String::from("Incompatible Boot ROM"),
            Error::InvalidParameter(message) => format!("Invalid parameter: {}", message),
            Error::CustomError(message) => String::from(message),
            Error::Io(message) => format!("I/O error: {}", message),
            Error::InvalidSize { expected, actual } => format!(
                "Invalid size, expected {} bytes but got {} bytes",
                expected, actual
            ),
            Error::HeaderLogoMismatch => String::from("Nintendo logo mismatch in ROM header"),
            Error::HeaderChecksumMismatch { expected, actual } => format!(
                "Header checksum mismatch, expected 0x{:02x} but computed 0x{:02x}",
                expected, actual
            ),
            Error::UnsupportedCartridgeType(kind) => {
                format!("Unsupported cartridge type 0x{:02x}", kind)
            }
            Error::RamSizeMismatch { expected, actual } => format!(
                "RAM size mismatch, expected {} bytes but got {} bytes",
                expected, actual
            ),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
