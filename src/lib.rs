//! Driver stack for a NAND flash controller with hardware-style BCH error correction
//!
//! From the bottom up: a [nand::NandBus] carries raw commands to the chip, the
//! [seq::SequenceEngine] runs fixed command programs over it, [page_io::PageIo] adds per-sector
//! BCH protection, and [bbt] keeps a bad block table (with a mirrored copy) on the medium itself.
//! [controller::Controller] ties these together behind byte-addressed read/write/erase.

pub mod bbt;
pub mod config;
pub mod controller;
pub mod ecc;
pub mod error;
pub mod nand;
pub mod page_io;
pub mod seq;
pub mod util;

pub use config::{ControllerConfig, EccSelect};
pub use controller::{Controller, ReadReport};
pub use ecc::EccMode;
pub use error::{Error, Result};
