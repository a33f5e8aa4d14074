//! Error types for the NAND controller

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the NAND controller
///
/// Corrected bit errors are not errors; they are reported through [crate::ecc::Outcome] and the
/// controller's ECC statistics.
#[derive(Error, Debug)]
pub enum Error {
    /// ECC strength exceeded; the affected data was left untouched
    #[error("uncorrectable ECC error in page {page}")]
    Uncorrectable { page: u32 },

    /// The device did not signal completion before the deadline
    #[error("hardware sequence timed out")]
    TimedOut,

    /// The device reported failure after programming a page
    #[error("program failed at page {page}")]
    ProgramFailed { page: u32 },

    /// The device reported failure after erasing a block
    #[error("erase failed at block {block}")]
    EraseFailed { block: u32 },

    /// The region reserved for table copies has no usable block left
    #[error("no space left in the bad block table area")]
    NoSpace,

    /// Neither the primary nor the mirror table copy could be located
    #[error("no bad block table found")]
    NoTableFound,

    /// A table copy was located, but its bitmap page could not be read
    #[error("bad block table at block {block} is unreadable")]
    TableUnreadable { block: u32 },

    /// The bus was handed a command byte it does not implement
    #[error("unsupported NAND command 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// The bus was driven out of sequence
    #[error("NAND bus protocol violation: {0}")]
    BusProtocol(&'static str),

    /// The device is write-protected
    #[error("device is write-protected")]
    WriteProtected,

    /// The geometry or ECC configuration cannot be supported
    #[error("incompatible device: {0}")]
    Incompatible(String),

    /// An access ran past the end of the device
    #[error("access at {offset:#x} (+{len:#x}) is beyond the end of the device")]
    OutOfRange { offset: u64, len: u64 },

    /// An access that must be aligned was not
    #[error("access at {offset:#x} (+{len:#x}) is not aligned to {align:#x}")]
    Misaligned { offset: u64, len: u64, align: u64 },

    /// An operation targeted a block that is bad or reserved
    #[error("block {0} is bad")]
    BadBlock(u32),

    /// I/O error (image files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Table header encoding error
    #[error("table header encoding error: {0}")]
    Header(#[from] deku::DekuError),
}
