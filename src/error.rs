//! Bootgate error types and methods

use core::fmt;
use ufmt::{uWrite, uwrite, uwriteln};

/// Top level error type for the trusted core. Every variant is an
/// ordinary, recoverable failure; the caller decides whether to retry,
/// surface it or abort. Security violations at the call gate are never
/// represented here, as they end in a system reset instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The core is not bound to the storage device or transport the
    /// operation needs, or the operation's context was never initialised.
    NotInitialized,
    /// Out of range slot id, oversized length or wrong argument arity.
    InvalidArgument(&'static str),
    /// Offset and length exceed a bounded region.
    InvalidRange,
    /// A required resource is already in use.
    Busy,
    /// A blocking operation did not complete in the allotted time.
    Timeout,
    /// The image container is malformed.
    Parse(ParseFault),
    /// The slot is empty.
    NoImage,
    /// The image parsed but failed an authenticity check.
    VerificationFailed,
    /// Opaque failure reported by the raw storage device.
    Storage(StorageFault),
    /// No boot order has been persisted yet, or it is corrupt.
    MissingMetadata,
}

/// Specific reasons for an image container to be rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseFault {
    /// Container major version is not supported.
    Version,
    /// Container type is not supported (e.g. encrypted, or unsigned when
    /// signatures are mandatory).
    FileType,
    /// A tag appeared where the container does not allow it.
    UnexpectedTag,
    /// Tag identifier not recognised.
    UnknownTag,
    /// Tag length inconsistent with its type.
    Malformed,
    /// Container checksum mismatch.
    Crc,
    /// The container ended before its end tag.
    Truncated,
}

/// Opaque error code propagated from a raw storage device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageFault(pub u32);

/// Implemented by lower level error types that can be lifted into
/// the top level [`Error`].
pub trait Convertible {
    fn into(self) -> Error;
}

impl<T: Convertible> From<T> for Error {
    fn from(t: T) -> Self { t.into() }
}

/// Exposes a report_unwrap() method that behaves like
/// unwrap(), but also reports any errors through a writer before panicking.
pub trait ReportOnUnwrap<T, W: uWrite> {
    fn report_unwrap(self, writer: &mut W) -> T;
}

impl<T, W: uWrite> ReportOnUnwrap<T, W> for Result<T, Error> {
    fn report_unwrap(self, writer: &mut W) -> T {
        match self {
            Ok(value) => value,
            Err(error) => {
                error.report(writer);
                panic!("{}", error);
            }
        }
    }
}

impl ParseFault {
    fn description(&self) -> &'static str {
        match self {
            ParseFault::Version => "Unsupported container version",
            ParseFault::FileType => "Unsupported container type",
            ParseFault::UnexpectedTag => "Tag not allowed at this point",
            ParseFault::UnknownTag => "Unknown tag",
            ParseFault::Malformed => "Tag length is inconsistent",
            ParseFault::Crc => "Container checksum mismatch",
            ParseFault::Truncated => "Container ended before its end tag",
        }
    }
}

impl Error {
    /// Reports the error through an abstract writer.
    pub fn report<W: uWrite>(&self, writer: &mut W) {
        // A failing writer has nowhere left to report to.
        let _ = match self {
            Error::NotInitialized => uwriteln!(writer, "[State Error] -> Not initialized"),
            Error::InvalidArgument(text) => {
                uwriteln!(writer, "[Argument Error] -> {}", *text)
            }
            Error::InvalidRange => {
                uwriteln!(writer, "[Argument Error] -> Range exceeds region bounds")
            }
            Error::Busy => uwriteln!(writer, "[State Error] -> Resource busy"),
            Error::Timeout => uwriteln!(writer, "[State Error] -> Timed out"),
            Error::Parse(fault) => {
                uwrite!(writer, "[Parse Error] -> ").and_then(|_| uwriteln!(writer, "{}", fault.description()))
            }
            Error::NoImage => uwriteln!(writer, "[Image Error] -> Slot contains no image"),
            Error::VerificationFailed => {
                uwriteln!(writer, "[Image Error] -> Image failed verification")
            }
            Error::Storage(StorageFault(code)) => {
                uwriteln!(writer, "[Storage Error] -> Device error code {}", *code)
            }
            Error::MissingMetadata => {
                uwriteln!(writer, "[Boot Error] -> No boot order recorded")
            }
        };
    }
}

impl fmt::Display for ParseFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.description()) }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotInitialized => write!(f, "not initialized"),
            Error::InvalidArgument(text) => write!(f, "invalid argument: {}", text),
            Error::InvalidRange => write!(f, "range exceeds region bounds"),
            Error::Busy => write!(f, "resource busy"),
            Error::Timeout => write!(f, "timed out"),
            Error::Parse(fault) => write!(f, "parse error: {}", fault),
            Error::NoImage => write!(f, "slot contains no image"),
            Error::VerificationFailed => write!(f, "image failed verification"),
            Error::Storage(StorageFault(code)) => write!(f, "storage device error {:#x}", code),
            Error::MissingMetadata => write!(f, "no boot order recorded"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    struct Sink(String);

    impl uWrite for Sink {
        type Error = ();
        fn write_str(&mut self, s: &str) -> Result<(), ()> {
            self.0.push_str(s);
            Ok(())
        }
    }

    #[test]
    fn errors_report_through_abstract_writers() {
        // Given
        let mut sink = Sink(String::new());

        // When
        Error::Parse(ParseFault::Crc).report(&mut sink);
        Error::Storage(StorageFault(7)).report(&mut sink);

        // Then
        assert_eq!(
            sink.0,
            "[Parse Error] -> Container checksum mismatch\n[Storage Error] -> Device error code 7\n"
        );
    }

    #[test]
    #[should_panic]
    fn report_unwrap_panics_on_error() {
        let mut sink = Sink(String::new());
        let result: Result<(), Error> = Err(Error::Busy);
        result.report_unwrap(&mut sink);
    }

    #[test]
    fn report_unwrap_passes_values_through() {
        let mut sink = Sink(String::new());
        let result: Result<u8, Error> = Ok(3);
        assert_eq!(result.report_unwrap(&mut sink), 3);
        assert!(sink.0.is_empty());
    }
}
