//! A simulated in-memory NAND flash chip, for testing purposes
//!
//! The chip sits behind the same [NandBus] a real controller would drive, so the whole
//! sequencer/ECC/table stack can be exercised against it. Besides honouring the usual NAND
//! rules (pages are programmed in order, once per erase), it can be told to misbehave: fail
//! erases or programs on chosen blocks, flip stored bits, stay busy forever, or be
//! write-protected.

use std::collections::HashSet;
use std::io::{Read, Write};

use super::bus::{NandBus, NandCommand, STATUS_FAIL, STATUS_READY, STATUS_WP};
use super::{NandLayout, PageUtil};
use crate::error::{Error, Result};

/// A simulated NAND chip
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,

    /// How many ready-polls an operation stays busy for
    latency: u32,
    write_protected: bool,
    hung: bool,
    fail_erase: HashSet<u32>,
    fail_program: HashSet<u32>,

    bus: BusState,
}

/// A block of SimNand
#[derive(Debug, Clone)]
struct SimBlock {
    /// All bytes (data + OOB) of all written pages (legally, can only append to this)
    data: Vec<u8>,
}

/// Where the chip is within a command sequence
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
enum Phase {
    #[default]
    Idle,
    ReadSetup,
    ReadOut,
    ProgramSetup,
    EraseSetup,
    StatusOut,
}

#[derive(Debug, Clone)]
struct BusState {
    selected: bool,
    phase: Phase,
    column: usize,
    row: Option<u32>,
    register: Vec<u8>,
    status: u8,
    busy_polls: u32,
}

impl SimNand {
    /// Create an empty (fully erased) SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            latency: 2,
            write_protected: false,
            hung: false,
            fail_erase: HashSet::new(),
            fail_program: HashSet::new(),
            bus: BusState {
                selected: false,
                phase: Phase::Idle,
                column: 0,
                row: None,
                register: vec![0xFF; layout.raw_page_size()],
                status: STATUS_READY | STATUS_WP,
                busy_polls: 0,
            },
        }
    }

    /// The layout this chip was created with
    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    /// Initialize the NAND contents (data and OOB of every page) from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> Result<()> {
        let raw = self.layout.raw_page_size();
        let mut buf = vec![0; raw * self.layout.pages_per_block as usize];

        for block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;

            // Trailing erased pages stay unwritten, so they may still be programmed.
            let mut used = buf.len();
            while used > 0 && buf[used - raw..used].is_erased() {
                used -= raw;
            }

            block.data.clear();
            block.data.extend_from_slice(&buf[..used]);
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> Result<()> {
        let mut page = vec![0; self.layout.raw_page_size()];

        for block in self.blocks.iter() {
            for index in 0..self.layout.pages_per_block {
                block.read_page(self.layout, index, &mut page);
                write.write_all(&page)?;
            }
        }

        Ok(())
    }

    /// Set how many ready-polls each operation stays busy for
    pub fn set_latency(&mut self, polls: u32) {
        self.latency = polls;
    }

    /// Assert or release the write-protect pin
    pub fn set_write_protect(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    /// Make the chip stop signalling ready, as if it had locked up
    pub fn set_hung(&mut self, hung: bool) {
        self.hung = hung;
    }

    /// Make every erase of `block` report failure
    pub fn fail_erase(&mut self, block: u32) {
        self.fail_erase.insert(block);
    }

    /// Make every program of a page in `block` report failure
    pub fn fail_program(&mut self, block: u32) {
        self.fail_program.insert(block);
    }

    /// Forget all injected erase/program failures
    pub fn clear_faults(&mut self) {
        self.fail_erase.clear();
        self.fail_program.clear();
    }

    /// Write a factory bad-block marker (a zero byte at OOB offset 0) into `block`'s first page
    pub fn mark_factory_bad(&mut self, block: u32) -> Result<()> {
        let page = self.layout.first_page(block);
        let offset = self.layout.bytes_per_page;
        let raw = self.raw_page_mut(page)?;
        raw[offset] = 0x00;
        Ok(())
    }

    /// Invert one stored bit; `bit` indexes the page's data followed by its OOB
    pub fn flip_bit(&mut self, page: u32, bit: usize) -> Result<()> {
        let raw = self.raw_page_mut(page)?;
        let byte = raw
            .get_mut(bit / 8)
            .ok_or(Error::BusProtocol("bit index beyond raw page"))?;
        *byte ^= 0x80 >> (bit % 8);
        Ok(())
    }

    /// Get a copy of a stored page (data followed by OOB)
    pub fn raw_page(&self, page: u32) -> Result<Vec<u8>> {
        let (block, index) = self.locate(page)?;
        let mut buf = vec![0; self.layout.raw_page_size()];
        self.blocks[block as usize].read_page(self.layout, index, &mut buf);
        Ok(buf)
    }

    /// Split a page number into (block, page-within-block)
    fn locate(&self, page: u32) -> Result<(u32, u32)> {
        if page >= self.layout.pages() {
            return Err(Error::BusProtocol("row address out of range"));
        }
        Ok((
            self.layout.block_of(page),
            page % self.layout.pages_per_block,
        ))
    }

    /// Get a mutable view of a stored page, materializing it (as erased) if never written
    fn raw_page_mut(&mut self, page: u32) -> Result<&mut [u8]> {
        let (block, index) = self.locate(page)?;
        let raw = self.layout.raw_page_size();
        let begin = index as usize * raw;

        let data = &mut self.blocks[block as usize].data;
        if data.len() < begin + raw {
            data.resize(begin + raw, 0xFF);
        }
        Ok(&mut data[begin..begin + raw])
    }

    /// Begin a busy period and latch the resulting status
    fn finish_operation(&mut self, failed: bool) {
        let mut status = STATUS_READY;
        if !self.write_protected {
            status |= STATUS_WP;
        }
        if failed {
            status |= STATUS_FAIL;
        }

        self.bus.status = status;
        self.bus.busy_polls = self.latency;
        self.bus.phase = Phase::Idle;
    }

    fn row(&self) -> Result<u32> {
        self.bus
            .row
            .ok_or(Error::BusProtocol("command issued without an address"))
    }

    fn start_read(&mut self) -> Result<()> {
        let (block, index) = self.locate(self.row()?)?;
        self.blocks[block as usize].read_page(self.layout, index, &mut self.bus.register);
        self.bus.busy_polls = self.latency;
        self.bus.phase = Phase::ReadOut;
        Ok(())
    }

    fn program(&mut self) -> Result<()> {
        let (block, index) = self.locate(self.row()?)?;
        let failed = self.write_protected
            || self.fail_program.contains(&block)
            || self.blocks[block as usize]
                .write_page(self.layout, index, &self.bus.register)
                .is_err();
        self.finish_operation(failed);
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        let (block, _) = self.locate(self.row()?)?;
        let failed = self.write_protected || self.fail_erase.contains(&block);
        if !failed {
            self.blocks[block as usize].data.clear();
        }
        self.finish_operation(failed);
        Ok(())
    }
}

impl SimBlock {
    fn new() -> Self {
        Self {
            data: Default::default(),
        }
    }

    fn write_page(&mut self, layout: NandLayout, index: u32, content: &[u8]) -> Result<()> {
        let raw = layout.raw_page_size();
        let begin = index as usize * raw;

        if begin < self.data.len() {
            return Err(Error::BusProtocol("write in already-written area"));
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(&content[..raw]);
        }

        Ok(())
    }

    fn read_page(&self, layout: NandLayout, index: u32, content: &mut [u8]) {
        let raw = layout.raw_page_size();
        let begin = index as usize * raw;
        let end = begin + raw;

        if let Some(page) = self.data.get(begin..end) {
            content[..raw].copy_from_slice(page);
        } else {
            content[..raw].fill(0xFF);
        }
    }
}

impl NandBus for SimNand {
    fn select(&mut self, selected: bool) -> Result<()> {
        self.bus.selected = selected;
        Ok(())
    }

    fn command(&mut self, cmd: u8) -> Result<()> {
        let cmd = NandCommand::try_from(cmd)?;
        if !self.bus.selected {
            return Err(Error::BusProtocol("command while chip not selected"));
        }

        match (cmd, self.bus.phase) {
            (NandCommand::Read0, _) => {
                self.bus.row = None;
                self.bus.phase = Phase::ReadSetup;
            }
            (NandCommand::ReadStart, Phase::ReadSetup) => self.start_read()?,
            (NandCommand::SeqIn, _) => {
                self.bus.row = None;
                self.bus.register.fill(0xFF);
                self.bus.phase = Phase::ProgramSetup;
            }
            (NandCommand::PageProg, Phase::ProgramSetup) => self.program()?,
            (NandCommand::Erase1, _) => {
                self.bus.row = None;
                self.bus.phase = Phase::EraseSetup;
            }
            (NandCommand::Erase2, Phase::EraseSetup) => self.erase()?,
            (NandCommand::Status, _) => self.bus.phase = Phase::StatusOut,
            (NandCommand::Reset, _) => {
                self.bus.row = None;
                self.finish_operation(false);
            }
            _ => return Err(Error::BusProtocol("command out of sequence")),
        }

        Ok(())
    }

    fn address(&mut self, cycles: &[u8]) -> Result<()> {
        let le = |bytes: &[u8]| {
            bytes
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
        };

        match self.bus.phase {
            Phase::ReadSetup | Phase::ProgramSetup if cycles.len() > 2 => {
                self.bus.column = le(&cycles[..2]) as usize;
                self.bus.row = Some(le(&cycles[2..]));
            }
            Phase::EraseSetup if !cycles.is_empty() => {
                self.bus.row = Some(le(cycles));
            }
            _ => return Err(Error::BusProtocol("address out of sequence")),
        }

        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.bus.phase {
            Phase::StatusOut => {
                // The WP bit follows the pin, not the last operation
                let status = match self.write_protected {
                    true => self.bus.status & !STATUS_WP,
                    false => self.bus.status | STATUS_WP,
                };
                buf.fill(status);
            }
            Phase::ReadOut => {
                let begin = self.bus.column;
                let src = self
                    .bus
                    .register
                    .get(begin..begin + buf.len())
                    .ok_or(Error::BusProtocol("read beyond page register"))?;
                buf.copy_from_slice(src);
                self.bus.column += buf.len();
            }
            _ => return Err(Error::BusProtocol("data read out of sequence")),
        }

        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.bus.phase != Phase::ProgramSetup {
            return Err(Error::BusProtocol("data write out of sequence"));
        }

        let begin = self.bus.column;
        self.bus
            .register
            .get_mut(begin..begin + buf.len())
            .ok_or(Error::BusProtocol("write beyond page register"))?
            .copy_from_slice(buf);
        self.bus.column += buf.len();

        Ok(())
    }

    fn is_ready(&mut self) -> bool {
        if self.hung {
            return false;
        }
        if self.bus.busy_polls > 0 {
            self.bus.busy_polls -= 1;
            return false;
        }
        true
    }

    fn stop(&mut self) {
        self.bus.phase = Phase::Idle;
        self.bus.row = None;
        self.bus.busy_polls = 0;
    }
}
