//! Full-device scan for manufacturer bad block markers, used when no table can be loaded

use tracing::{debug, info};

use super::{BadBlockTable, BlockHealth, RESERVED_BLOCKS};
use crate::error::Result;
use crate::nand::{NandBus, NandLayout};
use crate::page_io::PageIo;
use crate::seq::Clock;

/// Which pages of a block carry the marker
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum MarkerPages {
    #[default]
    First,
    FirstAndSecond,
    FirstAndLast,
}

/// Which OOB bytes make up the marker
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum MarkerBytes {
    #[default]
    Byte0,
    Byte5,
    /// Every OOB byte must be 0xFF
    All,
}

/// Where a device keeps its bad block markers
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct BbmScheme {
    pub pages: MarkerPages,
    pub bytes: MarkerBytes,
}

impl BbmScheme {
    fn pages(&self, layout: &NandLayout, block: u32) -> Vec<u32> {
        let first = layout.first_page(block);
        match self.pages {
            MarkerPages::First => vec![first],
            MarkerPages::FirstAndSecond => vec![first, first + 1],
            MarkerPages::FirstAndLast => vec![first, layout.last_page(block)],
        }
    }

    fn is_marked(&self, oob: &[u8]) -> bool {
        match self.bytes {
            MarkerBytes::Byte0 => oob.first().is_some_and(|&b| b != 0xFF),
            MarkerBytes::Byte5 => oob.get(5).is_some_and(|&b| b != 0xFF),
            MarkerBytes::All => oob.iter().any(|&b| b != 0xFF),
        }
    }
}

/// Read the markers of every block and build a fresh table from them
pub fn scan_markers<B: NandBus, C: Clock>(
    io: &mut PageIo<B, C>,
    scheme: BbmScheme,
) -> Result<BadBlockTable> {
    let layout = io.layout();
    let mut table = BadBlockTable::new(layout.blocks, RESERVED_BLOCKS);

    let rpt = howudoin::new()
        .label("Scanning bad block markers")
        .set_len(u64::from(layout.blocks));

    let mut data = vec![0; layout.bytes_per_page];
    let mut oob = vec![0; layout.oob_bytes_per_page];
    for block in 0..layout.blocks {
        for page in scheme.pages(&layout, block) {
            io.read_raw(page, &mut data, &mut oob)?;
            if scheme.is_marked(&oob) {
                debug!(block, page, "Factory bad block marker");
                table.mark(block, BlockHealth::BadFactory);
                break;
            }
        }
        rpt.inc();
    }

    rpt.close();

    info!(
        bad = table.bad_blocks().count(),
        blocks = layout.blocks,
        "Marker scan complete"
    );
    Ok(table)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::ecc::EccMode;
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::seq::{ManualClock, SequenceEngine};

    fn page_io(nand: SimNand) -> anyhow::Result<PageIo<SimNand, ManualClock>> {
        let engine = SequenceEngine::new(nand, ManualClock::new(), Duration::from_micros(10));
        Ok(PageIo::new(
            engine,
            TEST_LAYOUT,
            EccMode::Bch18,
            Duration::from_millis(500),
        )?)
    }

    #[test]
    fn test_scan_markers() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(2)?;
        nand.mark_factory_bad(30)?;
        nand.flip_bit(TEST_LAYOUT.last_page(7), 2048 * 8 + 5 * 8)?;
        let mut io = page_io(nand)?;

        let table = scan_markers(&mut io, BbmScheme::default())?;
        assert_eq!(
            table.bad_blocks().collect::<Vec<_>>(),
            [(2, BlockHealth::BadFactory), (30, BlockHealth::BadFactory)]
        );

        let scheme = BbmScheme {
            pages: MarkerPages::FirstAndLast,
            bytes: MarkerBytes::Byte5,
        };
        let table = scan_markers(&mut io, scheme)?;
        assert_eq!(
            table.bad_blocks().collect::<Vec<_>>(),
            [(7, BlockHealth::BadFactory)]
        );

        let scheme = BbmScheme {
            pages: MarkerPages::FirstAndLast,
            bytes: MarkerBytes::All,
        };
        assert_eq!(scan_markers(&mut io, scheme)?.bad_blocks().count(), 3);
        Ok(())
    }
}
