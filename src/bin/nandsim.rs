//! Drive the controller against a simulated NAND chip kept in an image file.
//!
//! The image holds the raw data and OOB bytes of every page, block after block. Bit errors and
//! factory bad block markers can be injected into it directly, to watch how ECC and the bad
//! block table respond on the next run.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nand_bch::{
    bbt::Role,
    nand::{NandLayout, SimNand},
    seq::SystemClock,
    util::ReadExt,
    Controller, ControllerConfig, EccSelect, Error,
};

/// Accept decimal or 0x-prefixed hexadecimal
fn parse_number(s: &str) -> Result<u64> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use; a blank chip is simulated if it doesn't exist yet
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as BLOCKSxPAGESxBYTES[+OOB]
    #[clap(long, default_value = "256x64x2048+64")]
    sim_layout: NandLayout,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.sim_layout);

        if let Some(path) = &self.sim_path {
            match File::open(path) {
                Ok(mut file) => sim
                    .load(&mut file)
                    .with_context(|| format!("loading image {}", path.display()))?,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    info!("{} does not exist, starting from a blank chip", path.display());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("opening image {}", path.display()))
                }
            }
        }

        Ok(sim)
    }

    fn cleanup(&self, sim: SimNand) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                let mut file = File::create(path)
                    .with_context(|| format!("creating image {}", path.display()))?;
                sim.save(&mut file)?;
            }
        }

        Ok(())
    }
}

#[derive(Args, Debug)]
struct ControllerOptions {
    /// ECC mode: auto, none, 18 or 30
    #[clap(long, default_value = "auto")]
    ecc: EccSelect,

    /// Corrected bits per sector at which a read is flagged for scrubbing
    #[clap(long)]
    bitflip_threshold: Option<u32>,

    /// Author string written into bad block table headers
    #[clap(long)]
    author: Option<String>,
}

impl ControllerOptions {
    fn config(&self) -> ControllerConfig {
        let mut config = ControllerConfig::default().ecc(self.ecc);
        if let Some(threshold) = self.bitflip_threshold {
            config = config.bitflip_threshold(threshold);
        }
        if let Some(author) = &self.author {
            config = config.author(author.as_str());
        }
        config
    }
}

/// Commands run through an attached controller
#[derive(Subcommand, Debug)]
enum DeviceCommand {
    /// Show the geometry, ECC mode, table copies and bad blocks
    Info,

    /// Record a block as worn out in the bad block table
    MarkBad { block: u32 },

    /// Erase one block
    Erase { block: u32 },

    /// Read bytes, printing a hex dump unless --out is given
    Read {
        #[clap(value_parser = parse_number)]
        offset: u64,

        #[clap(value_parser = parse_number)]
        len: u64,

        /// Write the bytes to this file instead
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Write a file at a page-aligned offset (padded to whole pages)
    Write {
        #[clap(value_parser = parse_number)]
        offset: u64,

        path: PathBuf,
    },
}

/// Commands that edit the image directly, bypassing the controller
#[derive(Subcommand, Debug)]
enum ImageCommand {
    /// Invert one stored bit of the image (page data followed by OOB)
    Flip { page: u32, bit: usize },

    /// Put a factory bad block marker into the image
    FactoryBad { block: u32 },
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(flatten)]
    Device(DeviceCommand),

    #[clap(flatten)]
    Image(ImageCommand),
}

impl ImageCommand {
    fn execute(self, sim: &mut SimNand) -> Result<()> {
        match self {
            ImageCommand::Flip { page, bit } => {
                sim.flip_bit(page, bit)
                    .with_context(|| format!("flipping bit {bit} of page {page}"))?;
                println!("Flipped bit {bit} of page {page}");
            }

            ImageCommand::FactoryBad { block } => {
                sim.mark_factory_bad(block)
                    .with_context(|| format!("marking block {block}"))?;
                println!("Block {block} now carries a factory bad block marker");
            }
        }

        Ok(())
    }
}

impl DeviceCommand {
    fn execute(self, ctrl: &mut Controller<SimNand>) -> Result<()> {
        match self {
            DeviceCommand::Info => print_info(ctrl),

            DeviceCommand::MarkBad { block } => {
                ctrl.mark_block_bad(block)
                    .with_context(|| format!("marking block {block} bad"))?;
                let state = ctrl.table_state();
                println!("Block {block} marked bad");
                print_copy(Role::Primary, state.primary);
                print_copy(Role::Mirror, state.mirror);
            }

            DeviceCommand::Erase { block } => {
                let block_size = ctrl.layout().block_size();
                ctrl.erase(u64::from(block) * block_size, block_size)
                    .with_context(|| format!("erasing block {block}"))?;
                println!("Erased block {block}");
            }

            DeviceCommand::Read { offset, len, out } => {
                let len = usize::try_from(len).context("length too large")?;
                let mut buf = vec![0; len];

                match ctrl.read(offset, &mut buf) {
                    Ok(report) => {
                        eprintln!(
                            "Read {} bytes, {} bits corrected (max {} per sector){}",
                            report.bytes_read,
                            report.corrected,
                            report.max_bitflips,
                            if report.scrub { ", scrub advised" } else { "" }
                        );
                    }
                    Err(err @ Error::Uncorrectable { .. }) => {
                        error!("{err}; affected sectors are shown as read");
                    }
                    Err(err) => return Err(err).context("reading"),
                }

                match out {
                    Some(path) => File::create(&path)
                        .and_then(|mut file| file.write_all(&buf))
                        .with_context(|| format!("writing {}", path.display()))?,
                    None => hex_dump(offset, &buf)?,
                }
            }

            DeviceCommand::Write { offset, path } => {
                let layout = ctrl.layout();
                let limit = layout.device_size().saturating_sub(offset);
                let limit = usize::try_from(limit).context("device too large")?;

                let data = File::open(&path)
                    .and_then(|mut file| file.read_aligned(limit, layout.bytes_per_page))
                    .with_context(|| format!("reading {}", path.display()))?;
                let written = ctrl
                    .write(offset, &data)
                    .with_context(|| format!("writing at {offset:#x}"))?;
                println!("Wrote {written} bytes at {offset:#x}");
            }
        }

        Ok(())
    }
}

fn print_copy(role: Role, copy: Option<nand_bch::bbt::CopyState>) {
    match copy {
        Some(copy) => println!(
            "{role:?} table: block {}, version {}",
            copy.block, copy.version
        ),
        None => println!("{role:?} table: missing"),
    }
}

fn print_info(ctrl: &Controller<SimNand>) {
    let layout = ctrl.layout();
    println!(
        "Geometry: {} blocks x {} pages x {}+{} bytes",
        layout.blocks, layout.pages_per_block, layout.bytes_per_page, layout.oob_bytes_per_page
    );
    println!(
        "ECC: {} ({} bytes per sector), scrub threshold {}",
        ctrl.mode(),
        ctrl.mode().ecc_bytes(),
        ctrl.bitflip_threshold()
    );

    let state = ctrl.table_state();
    print_copy(Role::Primary, state.primary);
    print_copy(Role::Mirror, state.mirror);

    let bad = ctrl.bad_blocks();
    println!("Bad blocks: {}", bad.len());
    for (block, health) in bad {
        println!("{block:6} => {health:?}");
    }
}

fn hex_dump(offset: u64, buf: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    for (line, chunk) in (0u64..).zip(buf.chunks(16)) {
        write!(stdout, "{:08x}:", offset + line * 16)?;
        for byte in chunk {
            write!(stdout, " {byte:02x}")?;
        }
        writeln!(stdout)?;
    }
    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .init();
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to simulate
    #[clap(flatten)]
    nand: NandOptions,

    /// How to attach the controller
    #[clap(flatten)]
    controller: ControllerOptions,

    /// More logging (repeat for more)
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// The command to run against this NAND
    #[clap(subcommand)]
    cmd: Command,
}

fn run(args: Cli) -> Result<()> {
    let mut sim = args.nand.open()?;

    let result = match args.cmd {
        Command::Image(cmd) => cmd.execute(&mut sim),
        Command::Device(cmd) => {
            let layout = sim.layout();
            let config = args.controller.config();
            let mut ctrl = Controller::attach(sim, layout, config, SystemClock::new())
                .context("attaching controller")?;
            let result = cmd.execute(&mut ctrl);
            sim = ctrl.into_bus();
            result
        }
    };

    // Keep whatever the command managed to change, even if it failed partway
    args.nand.cleanup(sim)?;
    result
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = run(args);

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
    result
}
