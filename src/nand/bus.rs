//! The command/address/data bus between the controller's sequencer and a NAND chip.

use crate::error::{Error, Result};

/// Status register bit: the last program/erase operation failed
pub const STATUS_FAIL: u8 = 0x01;
/// Status register bit: the device is ready
pub const STATUS_READY: u8 = 0x40;
/// Status register bit: the device is *not* write-protected
pub const STATUS_WP: u8 = 0x80;

/// The NAND command bytes understood by this driver
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum NandCommand {
    Read0 = 0x00,
    PageProg = 0x10,
    ReadStart = 0x30,
    Erase1 = 0x60,
    Status = 0x70,
    SeqIn = 0x80,
    Erase2 = 0xD0,
    Reset = 0xFF,
}

impl From<NandCommand> for u8 {
    fn from(value: NandCommand) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for NandCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use NandCommand::*;

        Ok(match value {
            0x00 => Read0,
            0x10 => PageProg,
            0x30 => ReadStart,
            0x60 => Erase1,
            0x70 => Status,
            0x80 => SeqIn,
            0xD0 => Erase2,
            0xFF => Reset,
            other => return Err(Error::UnsupportedCommand(other)),
        })
    }
}

/// The capability set a sequencer needs from a NAND chip
///
/// Implementations are chosen when the controller is attached; the sequencer never swaps them
/// out afterwards.
pub trait NandBus {
    /// Assert (or release) chip-select
    fn select(&mut self, selected: bool) -> Result<()>;

    /// Latch a command byte
    fn command(&mut self, cmd: u8) -> Result<()>;

    /// Latch a run of address cycles
    fn address(&mut self, cycles: &[u8]) -> Result<()>;

    /// Clock data out of the device
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Clock data into the device
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Sample the ready/busy line
    fn is_ready(&mut self) -> bool;

    /// Write the all-zero stop word, abandoning whatever sequence is in flight
    fn stop(&mut self);
}

#[test]
fn test_command_bytes() {
    for cmd in [
        NandCommand::Read0,
        NandCommand::PageProg,
        NandCommand::ReadStart,
        NandCommand::Erase1,
        NandCommand::Status,
        NandCommand::SeqIn,
        NandCommand::Erase2,
        NandCommand::Reset,
    ] {
        assert_eq!(NandCommand::try_from(u8::from(cmd)).unwrap(), cmd);
    }

    assert!(matches!(
        NandCommand::try_from(0x90),
        Err(Error::UnsupportedCommand(0x90))
    ));
}
