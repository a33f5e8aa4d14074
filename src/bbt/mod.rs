//! The bad block table: a 2-bit health entry for every block of the device
//!
//! The table lives in memory for as long as the controller is attached. Two copies of it
//! (Primary and Mirror) are kept on the medium itself, in the last few blocks of the device; see
//! [sync] for how they are found and kept in step.

pub mod header;
pub mod scan;
pub mod sync;

pub use header::{Role, TableHeader};
pub use scan::{scan_markers, BbmScheme, MarkerBytes, MarkerPages};
pub use sync::{BbtSync, CopyState, Resolution, SearchResult, TableState};

/// Number of blocks at the end of the device set aside for the table copies
pub const RESERVED_BLOCKS: u32 = 4;

/// The health of a single block
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum BlockHealth {
    Good,
    /// Marked bad by the manufacturer
    BadFactory,
    /// Went bad in use
    BadWear,
    Reserved,
}

impl BlockHealth {
    /// The 2-bit on-medium encoding
    pub fn bits(self) -> u8 {
        match self {
            BlockHealth::BadFactory => 0b00,
            BlockHealth::BadWear => 0b01,
            BlockHealth::Reserved => 0b10,
            BlockHealth::Good => 0b11,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => BlockHealth::BadFactory,
            0b01 => BlockHealth::BadWear,
            0b10 => BlockHealth::Reserved,
            _ => BlockHealth::Good,
        }
    }
}

/// In-memory bad block table
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct BadBlockTable {
    bitmap: Vec<u8>,
    blocks: u32,
    reserved: u32,
}

impl BadBlockTable {
    /// An all-good table for `blocks` blocks, the last `reserved` of which hold table copies
    pub fn new(blocks: u32, reserved: u32) -> Self {
        Self {
            bitmap: vec![0xFF; Self::bitmap_len(blocks)],
            blocks,
            reserved,
        }
    }

    /// Build a table from its on-medium bitmap (extra trailing bytes are ignored)
    pub fn from_bytes(blocks: u32, reserved: u32, bytes: &[u8]) -> Self {
        let mut table = Self::new(blocks, reserved);
        let len = table.bitmap.len().min(bytes.len());
        table.bitmap[..len].copy_from_slice(&bytes[..len]);
        table
    }

    /// Size of the on-medium bitmap for `blocks` blocks
    pub fn bitmap_len(blocks: u32) -> usize {
        (blocks as usize).div_ceil(4)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// The first block of the reserved region
    pub fn first_reserved(&self) -> u32 {
        self.blocks.saturating_sub(self.reserved)
    }

    pub fn is_reserved(&self, block: u32) -> bool {
        block >= self.first_reserved()
    }

    /// The bitmap entry of `block`; anything past the end of the device reads as reserved
    pub fn get(&self, block: u32) -> BlockHealth {
        if block >= self.blocks {
            return BlockHealth::Reserved;
        }

        let byte = self.bitmap[block as usize >> 2];
        BlockHealth::from_bits(byte >> ((block & 3) << 1))
    }

    pub fn mark(&mut self, block: u32, health: BlockHealth) {
        if block >= self.blocks {
            return;
        }

        let shift = (block & 3) << 1;
        let byte = &mut self.bitmap[block as usize >> 2];
        *byte = (*byte & !(0b11 << shift)) | (health.bits() << shift);
    }

    /// May ordinary I/O not use `block`?
    ///
    /// The reserved region is always unusable, whatever its entries say.
    pub fn is_bad(&self, block: u32) -> bool {
        self.is_reserved(block) || self.get(block) != BlockHealth::Good
    }

    /// Every block whose entry is not `Good`
    pub fn bad_blocks(&self) -> impl Iterator<Item = (u32, BlockHealth)> + '_ {
        (0..self.blocks)
            .map(|block| (block, self.get(block)))
            .filter(|&(_, health)| health != BlockHealth::Good)
    }
}

#[test]
fn test_health_encoding() {
    for health in [
        BlockHealth::Good,
        BlockHealth::BadFactory,
        BlockHealth::BadWear,
        BlockHealth::Reserved,
    ] {
        assert_eq!(BlockHealth::from_bits(health.bits()), health);
    }
}

#[test]
fn test_table_bitmap() {
    let mut table = BadBlockTable::new(30, RESERVED_BLOCKS);
    assert_eq!(table.as_bytes().len(), 8);
    assert_eq!(table.bad_blocks().count(), 0);

    table.mark(5, BlockHealth::BadWear);
    table.mark(6, BlockHealth::BadFactory);
    assert_eq!(table.as_bytes()[1], 0b1100_0111);
    assert_eq!(table.get(5), BlockHealth::BadWear);
    assert_eq!(table.get(4), BlockHealth::Good);
    assert!(table.is_bad(6));
    assert!(!table.is_bad(7));

    // The reserved region is bad to I/O callers, but its entries are still tracked
    assert!(table.is_bad(27));
    assert_eq!(table.get(27), BlockHealth::Good);
    assert_eq!(table.get(30), BlockHealth::Reserved);

    let copy = BadBlockTable::from_bytes(30, RESERVED_BLOCKS, table.as_bytes());
    assert_eq!(copy, table);
    assert_eq!(
        copy.bad_blocks().collect::<Vec<_>>(),
        [(5, BlockHealth::BadWear), (6, BlockHealth::BadFactory)]
    );

    table.mark(5, BlockHealth::Good);
    assert!(!table.is_bad(5));
}
