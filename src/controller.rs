//! The attached controller: byte-addressed I/O over ECC-protected pages, with bad block
//! tracking
//!
//! Every operation takes `&mut self`, so one controller never has more than one hardware
//! program in flight, and the bad block table can't change under an operation that is
//! persisting it.

use tracing::{debug, info, warn};

use crate::bbt::header::HEADER_SIZE;
use crate::bbt::{scan_markers, BadBlockTable, BbtSync, BlockHealth, TableState, RESERVED_BLOCKS};
use crate::config::ControllerConfig;
use crate::ecc::EccMode;
use crate::error::{Error, Result};
use crate::nand::{Nand, NandBlock, NandBus, NandLayout};
use crate::page_io::{check_geometry, EccStats, EraseStatus, PageIo};
use crate::seq::{Clock, SequenceEngine, SystemClock};

/// Summary of a [Controller::read]
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct ReadReport {
    pub bytes_read: usize,
    /// Bits corrected across all pages read
    pub corrected: u64,
    /// The highest corrected count of any one sector
    pub max_bitflips: u32,
    /// `max_bitflips` reached the configured threshold; the data should be rewritten elsewhere
    pub scrub: bool,
}

/// A NAND device attached through the BCH controller
#[derive(Debug)]
pub struct Controller<B, C = SystemClock> {
    io: PageIo<B, C>,
    sync: BbtSync,
    bitflip_threshold: u32,
}

/// Make sure the controller can drive a device of this shape in this mode
fn check_compatibility(layout: &NandLayout, mode: EccMode) -> Result<()> {
    check_geometry(layout, mode)?;

    if layout.blocks <= RESERVED_BLOCKS {
        return Err(Error::Incompatible(format!(
            "{} blocks leave nothing outside the {RESERVED_BLOCKS}-block table area",
            layout.blocks
        )));
    }
    if layout.pages_per_block < 2 {
        return Err(Error::Incompatible("table copies need at least two pages per block".into()));
    }
    if BadBlockTable::bitmap_len(layout.blocks) > layout.bytes_per_page
        || HEADER_SIZE > layout.bytes_per_page
    {
        return Err(Error::Incompatible("bad block table does not fit in a page".into()));
    }

    Ok(())
}

impl<B: NandBus, C: Clock> Controller<B, C> {
    /// Take over `bus`, then load the bad block table (or build and persist a new one)
    pub fn attach(bus: B, layout: NandLayout, config: ControllerConfig, clock: C) -> Result<Self> {
        let mode = config.ecc.select(&layout)?;
        check_compatibility(&layout, mode)?;

        let engine = SequenceEngine::new(bus, clock, config.poll_interval);
        let mut io = PageIo::new(engine, layout, mode, config.timeout)?;

        let sync = match BbtSync::load(&mut io, config.author.as_str()) {
            Ok(sync) => sync,
            Err(err @ (Error::NoTableFound | Error::TableUnreadable { .. })) => {
                warn!("{err}; scanning for factory bad block markers");
                if io.is_write_protected()? {
                    return Err(Error::WriteProtected);
                }
                let table = scan_markers(&mut io, config.bbm)?;
                BbtSync::bootstrap(&mut io, table, config.author.as_str())?
            }
            Err(err) => return Err(err),
        };

        let bitflip_threshold = config.bitflip_threshold.unwrap_or(mode.strength());
        info!(
            blocks = layout.blocks,
            page_size = layout.bytes_per_page,
            oob_size = layout.oob_bytes_per_page,
            ecc = %mode,
            bitflip_threshold,
            "Attached"
        );

        Ok(Self {
            io,
            sync,
            bitflip_threshold,
        })
    }

    pub fn layout(&self) -> NandLayout {
        self.io.layout()
    }

    pub fn mode(&self) -> EccMode {
        self.io.mode()
    }

    pub fn bitflip_threshold(&self) -> u32 {
        self.bitflip_threshold
    }

    pub fn bus(&self) -> &B {
        self.io.bus()
    }

    /// Detach, handing back the bus
    pub fn into_bus(self) -> B {
        self.io.into_bus()
    }

    pub fn ecc_stats(&self) -> EccStats {
        self.io.stats()
    }

    pub fn reset_ecc_stats(&mut self) {
        self.io.reset_stats()
    }

    /// Where the two table copies currently live
    pub fn table_state(&self) -> TableState {
        self.sync.state()
    }

    /// May ordinary I/O not use `block`? The table area always counts as bad.
    pub fn is_block_bad(&self, block: u32) -> bool {
        self.sync.table().is_bad(block)
    }

    /// Every block recorded as anything but good
    pub fn bad_blocks(&self) -> Vec<(u32, BlockHealth)> {
        self.sync.table().bad_blocks().collect()
    }

    /// Record `block` as worn out, and persist both table copies
    pub fn mark_block_bad(&mut self, block: u32) -> Result<()> {
        let layout = self.layout();
        if block >= layout.blocks {
            return Err(Error::OutOfRange {
                offset: u64::from(block) * layout.block_size(),
                len: layout.block_size(),
            });
        }
        if self.sync.table().is_bad(block) {
            return Ok(());
        }

        self.check_writable()?;
        self.sync.mark_bad(&mut self.io, block)?;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.layout().device_size() => Ok(()),
            _ => Err(Error::OutOfRange { offset, len }),
        }
    }

    fn check_aligned(&self, offset: u64, len: u64, align: u64) -> Result<()> {
        if offset % align != 0 || len % align != 0 {
            return Err(Error::Misaligned { offset, len, align });
        }
        Ok(())
    }

    fn check_block(&self, block: u32) -> Result<()> {
        if self.sync.table().is_bad(block) {
            return Err(Error::BadBlock(block));
        }
        Ok(())
    }

    fn check_writable(&mut self) -> Result<()> {
        if self.io.is_write_protected()? {
            warn!("Device is write-protected");
            return Err(Error::WriteProtected);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `offset`
    ///
    /// Pages that are only partly covered are served through the page cache. If any page turns
    /// out uncorrectable, all pages are still read (the buffer then holds the raw data for
    /// those) and the first such page is reported as [Error::Uncorrectable].
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<ReadReport> {
        let layout = self.layout();
        self.check_range(offset, buf.len() as u64)?;

        let page_size = layout.bytes_per_page;
        let mut oob = vec![0; layout.oob_bytes_per_page];
        let mut report = ReadReport::default();
        let mut failed_page = None;

        let mut pos = offset;
        let mut done = 0;
        while done < buf.len() {
            let page = (pos / page_size as u64) as u32;
            let column = (pos % page_size as u64) as usize;
            let len = (page_size - column).min(buf.len() - done);
            self.check_block(layout.block_of(page))?;

            let chunk = &mut buf[done..done + len];
            let page_report = if len == page_size {
                self.io.read_page(page, chunk, &mut oob)?
            } else {
                self.io.read_sectors(page, column, chunk)?
            };

            report.corrected += u64::from(page_report.corrected);
            report.max_bitflips = report.max_bitflips.max(page_report.max_bitflips);
            if page_report.failed_sectors > 0 && failed_page.is_none() {
                failed_page = Some(page);
            }

            pos += len as u64;
            done += len;
        }

        report.bytes_read = done;
        report.scrub = report.max_bitflips > 0 && report.max_bitflips >= self.bitflip_threshold;
        debug!(offset, len = done, corrected = report.corrected, "Read");

        match failed_page {
            Some(page) => Err(Error::Uncorrectable { page }),
            None => Ok(report),
        }
    }

    /// Write whole pages starting at `offset`
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        let layout = self.layout();
        let page_size = layout.bytes_per_page;
        self.check_aligned(offset, data.len() as u64, page_size as u64)?;
        self.check_range(offset, data.len() as u64)?;
        self.check_writable()?;

        let first_page = (offset / page_size as u64) as u32;
        for (page, chunk) in (first_page..).zip(data.chunks(page_size)) {
            self.check_block(layout.block_of(page))?;
            self.io.write_page(page, chunk, None)?;
        }

        debug!(offset, len = data.len(), "Wrote");
        Ok(data.len())
    }

    /// Erase whole blocks covering `offset..offset + len`
    pub fn erase(&mut self, offset: u64, len: u64) -> Result<()> {
        let layout = self.layout();
        self.check_aligned(offset, len, layout.block_size())?;
        self.check_range(offset, len)?;
        self.check_writable()?;

        let first = (offset / layout.block_size()) as u32;
        let count = (len / layout.block_size()) as u32;
        for block in first..first + count {
            self.check_block(block)?;
            if self.io.erase_block(block)? == EraseStatus::Failed {
                return Err(Error::EraseFailed { block });
            }
        }

        debug!(offset, len, "Erased");
        Ok(())
    }

    /// Read a page's OOB area as stored, without ECC processing
    pub fn read_oob(&mut self, page: u32) -> Result<Vec<u8>> {
        let layout = self.layout();
        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes_per_page];
        self.io.read_raw(page, &mut data, &mut oob)?;
        Ok(oob)
    }

    /// Program a page's data and OOB exactly as given, without ECC
    pub fn write_oob(&mut self, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        let layout = self.layout();
        self.check_range(
            u64::from(page) * layout.bytes_per_page as u64,
            layout.bytes_per_page as u64,
        )?;
        self.check_block(layout.block_of(page))?;
        self.check_writable()?;
        self.io.write_raw(page, data, oob)
    }
}

/// A good block of an attached [Controller]
#[derive(Debug)]
pub struct ControllerBlock<'a, B, C> {
    controller: &'a mut Controller<B, C>,
    block: u32,
}

impl<B: NandBus, C: Clock> Nand for Controller<B, C> {
    type Block<'a> = ControllerBlock<'a, B, C> where Self: 'a;

    fn block(&mut self, index: u32) -> Result<Option<Self::Block<'_>>> {
        let layout = self.layout();
        if index >= layout.blocks {
            return Err(Error::OutOfRange {
                offset: u64::from(index) * layout.block_size(),
                len: layout.block_size(),
            });
        }
        if self.is_block_bad(index) {
            return Ok(None);
        }

        Ok(Some(ControllerBlock {
            controller: self,
            block: index,
        }))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout()
    }
}

impl<B: NandBus, C: Clock> ControllerBlock<'_, B, C> {
    fn page_range(&self, start_page: u32, len: usize) -> Result<u32> {
        let page_size = self.page_size();
        if len % page_size != 0 {
            return Err(Error::Misaligned {
                offset: u64::from(start_page) * page_size as u64,
                len: len as u64,
                align: page_size as u64,
            });
        }

        let pages = (len / page_size) as u32;
        if start_page + pages > self.page_count() {
            return Err(Error::OutOfRange {
                offset: u64::from(start_page) * page_size as u64,
                len: len as u64,
            });
        }

        Ok(self.controller.layout().first_page(self.block) + start_page)
    }
}

impl<B: NandBus, C: Clock> NandBlock for ControllerBlock<'_, B, C> {
    fn page_count(&self) -> u32 {
        self.controller.layout().pages_per_block
    }

    fn page_size(&self) -> usize {
        self.controller.layout().bytes_per_page
    }

    fn read(&mut self, start_page: u32, content: &mut [u8]) -> Result<u64> {
        let first = self.page_range(start_page, content.len())?;
        let mut oob = vec![0; self.controller.layout().oob_bytes_per_page];

        let mut corrected = 0;
        for (page, chunk) in (first..).zip(content.chunks_mut(self.page_size())) {
            let report = self
                .controller
                .io
                .read_page(page, chunk, &mut oob)?
                .check(page)?;
            corrected += u64::from(report.corrected);
        }
        Ok(corrected)
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> Result<()> {
        let first = self.page_range(start_page, content.len())?;
        self.controller.check_writable()?;

        for (page, chunk) in (first..).zip(content.chunks(self.page_size())) {
            self.controller.io.write_page(page, chunk, None)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.controller.check_writable()?;
        match self.controller.io.erase_block(self.block)? {
            EraseStatus::Ok => Ok(()),
            EraseStatus::Failed => Err(Error::EraseFailed { block: self.block }),
        }
    }

    fn mark_bad(self) -> Result<()> {
        self.controller.mark_block_bad(self.block)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bbt::CopyState;
    use crate::config::EccSelect;
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::seq::ManualClock;

    type TestController = Controller<SimNand, ManualClock>;

    fn attach(nand: SimNand) -> Result<TestController> {
        Controller::attach(
            nand,
            TEST_LAYOUT,
            ControllerConfig::default(),
            ManualClock::new(),
        )
    }

    fn copy(block: u32, version: u8) -> Option<CopyState> {
        Some(CopyState { block, version })
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31) ^ seed)
            .collect()
    }

    #[test]
    fn test_attach_blank() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(5)?;

        let ctrl = attach(nand)?;
        assert_eq!(ctrl.mode(), EccMode::Bch18);
        assert_eq!(ctrl.bitflip_threshold(), 18);
        assert_eq!(
            ctrl.table_state(),
            TableState {
                primary: copy(31, 0),
                mirror: copy(30, 0),
            }
        );
        assert_eq!(ctrl.bad_blocks(), [(5, BlockHealth::BadFactory)]);
        assert!(ctrl.is_block_bad(5));
        assert!(ctrl.is_block_bad(28));
        assert!(!ctrl.is_block_bad(6));

        // The table is found again on reattach, instead of rescanning
        let ctrl = attach(ctrl.into_bus())?;
        assert_eq!(ctrl.bad_blocks(), [(5, BlockHealth::BadFactory)]);
        assert_eq!(ctrl.table_state().primary, copy(31, 0));
        Ok(())
    }

    #[test]
    fn test_incompatible() {
        let layout = NandLayout {
            oob_bytes_per_page: 16,
            ..TEST_LAYOUT
        };
        let nand = SimNand::new(layout);
        assert!(matches!(
            Controller::attach(
                nand,
                layout,
                ControllerConfig::default(),
                ManualClock::new(),
            ),
            Err(Error::Incompatible(_))
        ));

        let layout = NandLayout {
            blocks: 4,
            ..TEST_LAYOUT
        };
        let config = ControllerConfig::default().ecc(EccSelect::Fixed(EccMode::NoEcc));
        assert!(matches!(
            Controller::attach(SimNand::new(layout), layout, config, ManualClock::new()),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn test_read_write() -> anyhow::Result<()> {
        let mut ctrl = attach(SimNand::new(TEST_LAYOUT))?;
        let block_size = TEST_LAYOUT.block_size();

        let data = pattern(3 * 2048, 0x3C);
        assert_eq!(ctrl.write(block_size + 2048, &data)?, data.len());

        let mut buf = vec![0; data.len()];
        let report = ctrl.read(block_size + 2048, &mut buf)?;
        assert_eq!(report.bytes_read, data.len());
        assert_eq!(report.corrected, 0);
        assert_eq!(buf, data);

        // An unaligned read spanning a page boundary
        let mut buf = vec![0; 1000];
        ctrl.read(block_size + 2048 + 1500, &mut buf)?;
        assert_eq!(buf, data[1500..2500]);

        assert!(matches!(
            ctrl.write(100, &data[..2048]),
            Err(Error::Misaligned { .. })
        ));
        assert!(matches!(
            ctrl.read(TEST_LAYOUT.device_size() - 10, &mut buf),
            Err(Error::OutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_corrected_and_uncorrectable_reads() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_latency(0);
        let mut ctrl = Controller::attach(
            nand,
            TEST_LAYOUT,
            ControllerConfig::default().bitflip_threshold(3),
            ManualClock::new(),
        )?;

        let data = pattern(2 * 2048, 0x99);
        ctrl.write(0, &data)?;

        let mut nand = ctrl.into_bus();
        for bit in [1, 2, 3, 5000] {
            nand.flip_bit(0, bit)?;
        }
        for k in 0..25 {
            nand.flip_bit(1, 8192 + k * 13)?;
        }
        let mut ctrl = Controller::attach(
            nand,
            TEST_LAYOUT,
            ControllerConfig::default().bitflip_threshold(3),
            ManualClock::new(),
        )?;

        let mut buf = vec![0; 2048];
        let report = ctrl.read(0, &mut buf)?;
        assert_eq!(report.corrected, 4);
        assert_eq!(report.max_bitflips, 4);
        assert!(report.scrub);
        assert_eq!(buf, data[..2048]);

        let mut buf = vec![0; 2 * 2048];
        assert!(matches!(
            ctrl.read(0, &mut buf),
            Err(Error::Uncorrectable { page: 1 })
        ));
        assert_eq!(buf[..2048], data[..2048]);
        assert_ne!(buf[3072..], data[3072..]);

        assert_eq!(ctrl.ecc_stats().corrected, 8);
        assert_eq!(ctrl.ecc_stats().failed, 1);
        ctrl.reset_ecc_stats();
        assert_eq!(ctrl.ecc_stats(), EccStats::default());
        Ok(())
    }

    #[test]
    fn test_erase() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.fail_erase(7);
        let mut ctrl = attach(nand)?;
        let block_size = TEST_LAYOUT.block_size();

        ctrl.write(2 * block_size, &pattern(2048, 1))?;
        ctrl.erase(2 * block_size, block_size)?;
        let mut buf = vec![0; 2048];
        ctrl.read(2 * block_size, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xFF));

        assert!(matches!(
            ctrl.erase(7 * block_size, block_size),
            Err(Error::EraseFailed { block: 7 })
        ));
        assert!(matches!(
            ctrl.erase(29 * block_size, block_size),
            Err(Error::BadBlock(29))
        ));
        assert!(matches!(
            ctrl.erase(block_size / 2, block_size),
            Err(Error::Misaligned { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_write_protect() -> anyhow::Result<()> {
        let mut ctrl = attach(SimNand::new(TEST_LAYOUT))?;
        let mut nand = ctrl.into_bus();
        nand.set_write_protect(true);
        ctrl = attach(nand)?;

        assert!(matches!(
            ctrl.write(0, &pattern(2048, 0)),
            Err(Error::WriteProtected)
        ));
        assert!(matches!(
            ctrl.erase(0, TEST_LAYOUT.block_size()),
            Err(Error::WriteProtected)
        ));
        assert!(matches!(ctrl.mark_block_bad(3), Err(Error::WriteProtected)));
        assert!(!ctrl.is_block_bad(3));

        // A blank, write-protected device can't get a table
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_write_protect(true);
        assert!(matches!(attach(nand), Err(Error::WriteProtected)));
        Ok(())
    }

    #[test]
    fn test_mark_block_bad() -> anyhow::Result<()> {
        let mut ctrl = attach(SimNand::new(TEST_LAYOUT))?;

        ctrl.mark_block_bad(12)?;
        assert!(ctrl.is_block_bad(12));
        assert_eq!(
            ctrl.table_state(),
            TableState {
                primary: copy(31, 1),
                mirror: copy(30, 1),
            }
        );
        assert!(matches!(
            ctrl.write(12 * TEST_LAYOUT.block_size(), &pattern(2048, 0)),
            Err(Error::BadBlock(12))
        ));

        // No-op when already bad
        ctrl.mark_block_bad(12)?;
        assert_eq!(ctrl.table_state().primary, copy(31, 1));

        let ctrl = attach(ctrl.into_bus())?;
        assert_eq!(ctrl.bad_blocks(), [(12, BlockHealth::BadWear)]);
        assert_eq!(ctrl.table_state().mirror, copy(30, 1));
        Ok(())
    }

    #[test]
    fn test_attach_with_one_readable_copy() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(9)?;
        let mut nand = attach(nand)?.into_bus();
        for k in 0..40 {
            nand.flip_bit(TEST_LAYOUT.last_page(30), k * 3)?;
        }

        // The Mirror can't be rewritten anywhere
        let mut failing = nand.clone();
        for block in 28..32 {
            failing.fail_erase(block);
        }
        let ctrl = attach(failing)?;
        assert!(ctrl.is_block_bad(9));
        assert_eq!(ctrl.table_state().primary, copy(31, 0));
        assert_eq!(ctrl.table_state().mirror, None);

        // Write-protected: the Primary is used as found
        nand.set_write_protect(true);
        let mut ctrl = attach(nand)?;
        assert_eq!(ctrl.bad_blocks(), [(9, BlockHealth::BadFactory)]);
        assert_eq!(ctrl.table_state().mirror, None);
        assert!(matches!(
            ctrl.write(0, &pattern(2048, 0)),
            Err(Error::WriteProtected)
        ));
        Ok(())
    }

    #[test]
    fn test_attach_timeout() -> anyhow::Result<()> {
        let mut ctrl = attach(SimNand::new(TEST_LAYOUT))?;
        ctrl.write(0, &pattern(2048, 7))?;

        let mut nand = ctrl.into_bus();
        nand.set_hung(true);
        let result = Controller::attach(
            nand,
            TEST_LAYOUT,
            ControllerConfig::default(),
            ManualClock::new(),
        );
        assert!(matches!(result, Err(Error::TimedOut)));

        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_latency(0);
        let mut ctrl = attach(nand)?;
        let mut buf = vec![0; 2048];
        ctrl.read(0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_raw_oob() -> anyhow::Result<()> {
        let mut ctrl = attach(SimNand::new(TEST_LAYOUT))?;

        let data = pattern(2048, 4);
        let mut oob = vec![0xFF; 64];
        oob[0] = 0x00;
        oob[63] = 0x5A;
        ctrl.write_oob(8, &data, &oob)?;
        assert_eq!(ctrl.read_oob(8)?, oob);

        ctrl.write(9 * 2048, &data)?;
        let oob = ctrl.read_oob(9)?;
        assert!(oob.iter().any(|&b| b != 0xFF));
        Ok(())
    }

    #[test]
    fn test_block_handles() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.mark_factory_bad(1)?;
        let mut ctrl = attach(nand)?;

        assert!(ctrl.block(1)?.is_none());
        assert!(ctrl.block(30)?.is_none());
        assert!(ctrl.block(32).is_err());

        let data = pattern(2 * 2048, 0xE1);
        let mut block = ctrl.block(4)?.expect("block 4 is good");
        assert_eq!(block.page_count(), 8);
        block.program(2, &data)?;

        let mut buf = vec![0; 2 * 2048];
        assert_eq!(block.read(2, &mut buf)?, 0);
        assert_eq!(buf, data);
        assert!(block.read(7, &mut buf).is_err());

        block.erase()?;
        block.mark_bad()?;
        assert!(ctrl.block(4)?.is_none());
        assert_eq!(ctrl.table_state().primary, copy(31, 1));
        Ok(())
    }
}
