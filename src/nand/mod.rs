//! Abstractions and code to access NAND flash

use std::str::FromStr;

use crate::error::Result;

pub mod bus;
pub mod sim;

pub use bus::{NandBus, NandCommand};
pub use sim::SimNand;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// How many bits are at '0'?
    fn zero_bits(&self) -> usize;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn zero_bits(&self) -> usize {
        self.iter().map(|x| x.count_zeros() as usize).sum()
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub oob_bytes_per_page: usize,
}

impl NandLayout {
    /// Total number of pages on the device
    pub fn pages(&self) -> u32 {
        self.blocks * self.pages_per_block
    }

    /// Size of an erase block, in (main-area) bytes
    pub fn block_size(&self) -> u64 {
        u64::from(self.pages_per_block) * self.bytes_per_page as u64
    }

    /// Size of the device, in (main-area) bytes
    pub fn device_size(&self) -> u64 {
        u64::from(self.blocks) * self.block_size()
    }

    /// Size of a page including its OOB area
    pub fn raw_page_size(&self) -> usize {
        self.bytes_per_page + self.oob_bytes_per_page
    }

    /// The first page of `block`
    pub fn first_page(&self, block: u32) -> u32 {
        block * self.pages_per_block
    }

    /// The last page of `block`
    pub fn last_page(&self, block: u32) -> u32 {
        self.first_page(block) + self.pages_per_block - 1
    }

    /// The block containing `page`
    pub fn block_of(&self, page: u32) -> u32 {
        page / self.pages_per_block
    }

    /// Devices with more than 64Ki pages need a third row address cycle
    pub fn needs_extra_addr_cycle(&self) -> bool {
        self.pages() > 0x10000
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES+OOB"
///
/// The "+OOB" suffix is optional; when absent, the common 1/32 ratio is assumed.
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (geometry, oob) = match s.split_once('+') {
            Some((geometry, oob)) => (geometry, Some(oob)),
            None => (s, None),
        };

        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = geometry
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[+#]"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let oob_bytes_per_page = match oob {
            Some(oob) => oob.parse()?,
            None => bytes_per_page / 32,
        };

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad (or reserved)
    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    ///
    /// Returns the number of bit errors that had to be corrected.
    fn read(&mut self, start_page: u32, content: &mut [u8]) -> Result<u64>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Pages must be written in ascending order and only once between erases.
    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> Result<()>;
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 32,
    pages_per_block: 8,
    bytes_per_page: 2048,
    oob_bytes_per_page: 64,
};

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x64x2048+64".parse()?;
    assert_eq!(layout.blocks, 1024);
    assert_eq!(layout.pages_per_block, 64);
    assert_eq!(layout.bytes_per_page, 2048);
    assert_eq!(layout.oob_bytes_per_page, 64);

    let layout: NandLayout = "16x8x4096".parse()?;
    assert_eq!(layout.oob_bytes_per_page, 128);

    assert!("16x8".parse::<NandLayout>().is_err());
    assert!("16x8x4096+".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_layout_addressing() {
    assert_eq!(TEST_LAYOUT.pages(), 256);
    assert_eq!(TEST_LAYOUT.first_page(3), 24);
    assert_eq!(TEST_LAYOUT.last_page(3), 31);
    assert_eq!(TEST_LAYOUT.block_of(31), 3);
    assert_eq!(TEST_LAYOUT.device_size(), 32 * 8 * 2048);
    assert!(!TEST_LAYOUT.needs_extra_addr_cycle());

    let big = NandLayout {
        blocks: 4096,
        pages_per_block: 64,
        ..TEST_LAYOUT
    };
    assert!(big.needs_extra_addr_cycle());
}

#[test]
fn test_page_util() {
    let mut page = vec![0xFFu8; 64];
    assert!(page.is_erased());
    assert_eq!(page.zero_bits(), 0);

    page[3] = 0x7E;
    page[40] = 0x00;
    assert!(!page.is_erased());
    assert_eq!(page.zero_bits(), 10);
}
