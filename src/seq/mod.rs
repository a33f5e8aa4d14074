//! Hardware command sequencing
//!
//! A [Program] is a fixed list of bus steps (command bytes, address cycles, data transfers,
//! ready-waits and status checks). The controller builds its [ProgramSet] once, from the device
//! geometry, and the [SequenceEngine] runs those programs against a [NandBus], supplying only
//! the page address and the buffers for each call.

use std::time::Duration;

use tracing::{debug, warn};

use crate::ecc::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::nand::bus::{STATUS_FAIL, STATUS_READY, STATUS_WP};
use crate::nand::{NandBus, NandCommand, NandLayout};

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

/// Which way data moves during a transfer
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Direction {
    /// Device to host
    Read,
    /// Host to device
    Write,
    /// No data phase
    None,
}

/// One step of a [Program]
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Step {
    /// Latch a command byte
    Command(u8),
    /// Send the page address; `column` also sends the two (zero) column cycles first
    Address { column: bool },
    /// Move `sectors` sectors of main-area data, followed by the OOB buffer
    Transfer {
        direction: Direction,
        sectors: usize,
    },
    /// Wait for the device to signal ready
    WaitReady,
    /// Issue STATUS and latch the status byte
    CheckStatus,
    /// End of program
    Stop,
}

/// An immutable hardware sequence template
#[derive(Debug, Clone)]
pub struct Program {
    name: &'static str,
    direction: Direction,
    row_cycles: usize,
    steps: Vec<Step>,
}

impl Program {
    pub fn new(
        name: &'static str,
        direction: Direction,
        row_cycles: usize,
        steps: Vec<Step>,
    ) -> Self {
        Self {
            name,
            direction,
            row_cycles,
            steps,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of main-area bytes moved by this program
    fn data_bytes(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Transfer { sectors, .. } => sectors * SECTOR_SIZE,
                _ => 0,
            })
            .sum()
    }
}

/// The programs a controller needs, built once for one device geometry
#[derive(Debug, Clone)]
pub struct ProgramSet {
    pub read_page: Program,
    pub write_page: Program,
    pub erase_block: Program,
    pub read_status: Program,
}

impl ProgramSet {
    pub fn new(layout: &NandLayout) -> Self {
        let sectors = layout.bytes_per_page / SECTOR_SIZE;
        let row_cycles = if layout.needs_extra_addr_cycle() { 3 } else { 2 };

        let read_page = Program::new(
            "read_page",
            Direction::Read,
            row_cycles,
            vec![
                Step::Command(NandCommand::Read0.into()),
                Step::Address { column: true },
                Step::Command(NandCommand::ReadStart.into()),
                Step::WaitReady,
                Step::Transfer {
                    direction: Direction::Read,
                    sectors,
                },
                Step::Stop,
            ],
        );

        let write_page = Program::new(
            "write_page",
            Direction::Write,
            row_cycles,
            vec![
                Step::Command(NandCommand::SeqIn.into()),
                Step::Address { column: true },
                Step::Transfer {
                    direction: Direction::Write,
                    sectors,
                },
                Step::Command(NandCommand::PageProg.into()),
                Step::WaitReady,
                Step::CheckStatus,
                Step::Stop,
            ],
        );

        let erase_block = Program::new(
            "erase_block",
            Direction::None,
            row_cycles,
            vec![
                Step::Command(NandCommand::Erase1.into()),
                Step::Address { column: false },
                Step::Command(NandCommand::Erase2.into()),
                Step::WaitReady,
                Step::CheckStatus,
                Step::Stop,
            ],
        );

        let read_status = Program::new(
            "read_status",
            Direction::None,
            row_cycles,
            vec![Step::CheckStatus, Step::Stop],
        );

        Self {
            read_page,
            write_page,
            erase_block,
            read_status,
        }
    }
}

/// The buffers handed to one execution
#[derive(Debug)]
pub enum Buffers<'a> {
    None,
    In {
        data: &'a mut [u8],
        oob: &'a mut [u8],
    },
    Out { data: &'a [u8], oob: &'a [u8] },
}

impl Buffers<'_> {
    fn direction(&self) -> Direction {
        match self {
            Buffers::None => Direction::None,
            Buffers::In { .. } => Direction::Read,
            Buffers::Out { .. } => Direction::Write,
        }
    }
}

/// How an execution ended
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Status {
    /// The program ran to its end; carries the device status byte
    Done { status: u8 },
    /// The device did not become ready in time; the bus was halted
    TimedOut,
}

impl Status {
    /// Did the device report a failed operation?
    pub fn failed(&self) -> bool {
        matches!(self, Status::Done { status } if status & STATUS_FAIL != 0)
    }

    /// Is the device write-protected?
    pub fn write_protected(&self) -> bool {
        matches!(self, Status::Done { status } if status & STATUS_WP == 0)
    }
}

/// Runs [Program]s against a bus, one at a time
#[derive(Debug)]
pub struct SequenceEngine<B, C> {
    bus: B,
    clock: C,
    poll_interval: Duration,
}

impl<B: NandBus, C: Clock> SequenceEngine<B, C> {
    pub fn new(bus: B, clock: C, poll_interval: Duration) -> Self {
        Self {
            bus,
            clock,
            poll_interval,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Run `program` against page `page`
    ///
    /// On `TimedOut` the contents of any input buffers are undefined.
    pub fn execute(
        &mut self,
        program: &Program,
        page: u32,
        mut buffers: Buffers<'_>,
        timeout: Duration,
    ) -> Result<Status> {
        if buffers.direction() != program.direction {
            return Err(Error::BusProtocol("buffers do not match program direction"));
        }
        if let Buffers::In { data, .. } = &buffers {
            if data.len() < program.data_bytes() {
                return Err(Error::BusProtocol("data buffer shorter than transfer"));
            }
        }
        if let Buffers::Out { data, .. } = &buffers {
            if data.len() < program.data_bytes() {
                return Err(Error::BusProtocol("data buffer shorter than transfer"));
            }
        }

        debug!(program = program.name, page, "Executing");

        self.bus.select(true)?;
        let result = self.run(program, page, &mut buffers, timeout);
        let deselect = self.bus.select(false);

        let status = result?;
        deselect?;
        Ok(status)
    }

    fn run(
        &mut self,
        program: &Program,
        page: u32,
        buffers: &mut Buffers<'_>,
        timeout: Duration,
    ) -> Result<Status> {
        let mut status = STATUS_READY | STATUS_WP;

        for step in &program.steps {
            match *step {
                Step::Command(cmd) => self.bus.command(cmd)?,
                Step::Address { column } => {
                    let mut cycles = Vec::with_capacity(2 + program.row_cycles);
                    if column {
                        cycles.extend_from_slice(&[0, 0]);
                    }
                    cycles.extend_from_slice(&page.to_le_bytes()[..program.row_cycles]);
                    self.bus.address(&cycles)?;
                }
                Step::Transfer { sectors, .. } => {
                    let len = sectors * SECTOR_SIZE;
                    match buffers {
                        Buffers::In { data, oob } => {
                            self.bus.read_bytes(&mut data[..len])?;
                            self.bus.read_bytes(oob)?;
                        }
                        Buffers::Out { data, oob } => {
                            self.bus.write_bytes(&data[..len])?;
                            self.bus.write_bytes(oob)?;
                        }
                        Buffers::None => return Err(Error::BusProtocol("transfer without buffers")),
                    }
                }
                Step::WaitReady => {
                    if !self.wait_ready(timeout) {
                        warn!(program = program.name, page, "Timed out, halting");
                        self.bus.stop();
                        return Ok(Status::TimedOut);
                    }
                }
                Step::CheckStatus => {
                    self.bus.command(NandCommand::Status.into())?;
                    let mut byte = [0u8];
                    self.bus.read_bytes(&mut byte)?;
                    status = byte[0];
                }
                Step::Stop => break,
            }
        }

        Ok(Status::Done { status })
    }

    fn wait_ready(&mut self, timeout: Duration) -> bool {
        let deadline = self.clock.now() + timeout;
        loop {
            if self.bus.is_ready() {
                return true;
            }
            if self.clock.now() >= deadline {
                return false;
            }
            self.clock.pause(self.poll_interval);
        }
    }
}
