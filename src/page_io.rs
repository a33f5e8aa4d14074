//! ECC-protected page I/O
//!
//! [PageIo] runs the sequencer's page programs and applies the ECC codec to every sector of
//! every page that passes through it. The ECC records of all sectors sit back to back at the
//! start of the page's OOB area (sector `i` at `oob[i * N..(i + 1) * N]`); any OOB bytes after
//! them are passed through untouched.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ecc::{EccCodec, EccMode, Outcome, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::nand::{NandBus, NandLayout};
use crate::seq::{Buffers, Clock, ProgramSet, SequenceEngine, Status};

/// Running ECC statistics, kept until explicitly reset
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct EccStats {
    /// Bits corrected (including tolerated zero bits in erased pages)
    pub corrected: u64,
    /// Sectors that could not be corrected
    pub failed: u64,
}

/// Aggregate result of reading one page
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ReadStatus {
    Ok,
    /// Some bits were corrected (total count)
    Warning(u32),
    /// At least one sector was beyond repair
    Uncorrectable,
}

/// Details of one page read
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct PageReport {
    /// Bits corrected across all sectors
    pub corrected: u32,
    /// The highest per-sector corrected count
    pub max_bitflips: u32,
    /// Number of sectors that could not be corrected
    pub failed_sectors: u32,
    /// The page was recognized as erased
    pub erased: bool,
}

impl PageReport {
    pub fn status(&self) -> ReadStatus {
        if self.failed_sectors > 0 {
            ReadStatus::Uncorrectable
        } else if self.corrected > 0 {
            ReadStatus::Warning(self.corrected)
        } else {
            ReadStatus::Ok
        }
    }

    /// Turn an uncorrectable read into an error
    pub fn check(self, page: u32) -> Result<Self> {
        match self.status() {
            ReadStatus::Uncorrectable => Err(Error::Uncorrectable { page }),
            _ => Ok(self),
        }
    }
}

/// Result of erasing one block
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum EraseStatus {
    Ok,
    Failed,
}

/// Make sure pages of `layout` can be protected with `mode`
pub fn check_geometry(layout: &NandLayout, mode: EccMode) -> Result<()> {
    if layout.bytes_per_page == 0 || layout.bytes_per_page % SECTOR_SIZE != 0 {
        return Err(Error::Incompatible(format!(
            "page size {} is not a multiple of the {SECTOR_SIZE}-byte sector",
            layout.bytes_per_page
        )));
    }

    let sectors = layout.bytes_per_page / SECTOR_SIZE;
    if sectors * mode.ecc_bytes() > layout.oob_bytes_per_page {
        return Err(Error::Incompatible(format!(
            "{mode} needs {} OOB bytes per page, device has {}",
            sectors * mode.ecc_bytes(),
            layout.oob_bytes_per_page
        )));
    }

    Ok(())
}

/// Page-granular, ECC-protected access to a NAND device
#[derive(Debug)]
pub struct PageIo<B, C> {
    engine: SequenceEngine<B, C>,
    programs: ProgramSet,
    codec: EccCodec,
    layout: NandLayout,
    timeout: Duration,
    stats: EccStats,

    /// Bounce buffers for sub-page reads, and the page they currently hold
    bounce_data: Vec<u8>,
    bounce_oob: Vec<u8>,
    cached_page: Option<u32>,
}

impl<B: NandBus, C: Clock> PageIo<B, C> {
    pub fn new(
        engine: SequenceEngine<B, C>,
        layout: NandLayout,
        mode: EccMode,
        timeout: Duration,
    ) -> Result<Self> {
        check_geometry(&layout, mode)?;

        Ok(Self {
            engine,
            programs: ProgramSet::new(&layout),
            codec: EccCodec::new(mode),
            layout,
            timeout,
            stats: EccStats::default(),
            bounce_data: vec![0; layout.bytes_per_page],
            bounce_oob: vec![0; layout.oob_bytes_per_page],
            cached_page: None,
        })
    }

    pub fn layout(&self) -> NandLayout {
        self.layout
    }

    pub fn mode(&self) -> EccMode {
        self.codec.mode()
    }

    pub fn stats(&self) -> EccStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EccStats::default();
    }

    pub fn bus(&self) -> &B {
        self.engine.bus()
    }

    /// Direct access to the bus; drops the page cache, since the medium may change under it
    pub fn bus_mut(&mut self) -> &mut B {
        self.cached_page = None;
        self.engine.bus_mut()
    }

    pub fn into_bus(self) -> B {
        self.engine.into_bus()
    }

    fn sectors(&self) -> usize {
        self.layout.bytes_per_page / SECTOR_SIZE
    }

    fn ecc_area(&self) -> usize {
        self.sectors() * self.codec.ecc_bytes()
    }

    fn check_page(&self, page: u32) -> Result<()> {
        if page >= self.layout.pages() {
            return Err(Error::OutOfRange {
                offset: u64::from(page) * self.layout.bytes_per_page as u64,
                len: self.layout.bytes_per_page as u64,
            });
        }
        Ok(())
    }

    fn check_buffers(&self, data: usize, oob: usize) -> Result<()> {
        if data != self.layout.bytes_per_page || oob != self.layout.oob_bytes_per_page {
            return Err(Error::BusProtocol("page buffers do not match the geometry"));
        }
        Ok(())
    }

    /// Is the device's write-protect asserted?
    pub fn is_write_protected(&mut self) -> Result<bool> {
        let status = self.engine.execute(
            &self.programs.read_status,
            0,
            Buffers::None,
            self.timeout,
        )?;
        match status {
            Status::TimedOut => Err(Error::TimedOut),
            status => Ok(status.write_protected()),
        }
    }

    /// Read page data and OOB without any ECC processing
    pub fn read_raw(&mut self, page: u32, data: &mut [u8], oob: &mut [u8]) -> Result<()> {
        self.check_page(page)?;
        self.check_buffers(data.len(), oob.len())?;

        let status = self.engine.execute(
            &self.programs.read_page,
            page,
            Buffers::In { data, oob },
            self.timeout,
        )?;
        match status {
            Status::TimedOut => Err(Error::TimedOut),
            Status::Done { .. } => Ok(()),
        }
    }

    /// Program page data and OOB exactly as given
    pub fn write_raw(&mut self, page: u32, data: &[u8], oob: &[u8]) -> Result<()> {
        self.check_page(page)?;
        self.check_buffers(data.len(), oob.len())?;
        self.cached_page = None;

        let status = self.engine.execute(
            &self.programs.write_page,
            page,
            Buffers::Out { data, oob },
            self.timeout,
        )?;
        match status {
            Status::TimedOut => Err(Error::TimedOut),
            status if status.failed() => {
                warn!(page, "Program failed");
                Err(Error::ProgramFailed { page })
            }
            Status::Done { .. } => Ok(()),
        }
    }

    /// Read and correct one page
    ///
    /// An uncorrectable sector does not make this fail: the report says so, and the failing
    /// sectors are left as read. Use [PageReport::check] to turn that into an error.
    pub fn read_page(&mut self, page: u32, data: &mut [u8], oob: &mut [u8]) -> Result<PageReport> {
        self.read_raw(page, data, oob)?;

        let mut report = PageReport::default();
        if self.codec.mode() == EccMode::NoEcc {
            return Ok(report);
        }

        let ecc_bytes = self.codec.ecc_bytes();
        let records = &mut oob[..self.ecc_area()];

        if let Some(zeros) = EccCodec::erased_bitflips(data, records, self.sectors()) {
            report.erased = true;
            report.corrected = zeros as u32;
            report.max_bitflips = zeros as u32;
            self.stats.corrected += zeros as u64;
            if zeros > 0 {
                debug!(page, zeros, "Erased page with stuck bits");
            }
            return Ok(report);
        }

        let mut calc = vec![0; ecc_bytes];
        for (index, (sector, read_code)) in data
            .chunks_mut(SECTOR_SIZE)
            .zip(records.chunks(ecc_bytes))
            .enumerate()
        {
            self.codec.compute_into(sector, &mut calc);
            match self.codec.correct(sector, read_code, &calc) {
                Outcome::Ok => {}
                Outcome::Corrected(n) => {
                    report.corrected += n;
                    report.max_bitflips = report.max_bitflips.max(n);
                }
                Outcome::Uncorrectable => {
                    warn!(page, sector = index, "Uncorrectable ECC error");
                    report.failed_sectors += 1;
                }
            }
        }

        self.stats.corrected += u64::from(report.corrected);
        self.stats.failed += u64::from(report.failed_sectors);
        if report.corrected > 0 {
            info!(
                page,
                corrected = report.corrected,
                max_bitflips = report.max_bitflips,
                "Corrected bit errors"
            );
        }

        Ok(report)
    }

    /// Compute ECC for every sector and program the page
    ///
    /// `oob` supplies the bytes after the ECC area (if any); its ECC area is overwritten.
    pub fn write_page(&mut self, page: u32, data: &[u8], oob: Option<&[u8]>) -> Result<()> {
        let mut spare = vec![0xFF; self.layout.oob_bytes_per_page];
        if let Some(oob) = oob {
            self.check_buffers(data.len(), oob.len())?;
            spare.copy_from_slice(oob);
        }

        let ecc_bytes = self.codec.ecc_bytes();
        if ecc_bytes > 0 {
            let area = self.ecc_area();
            for (sector, code) in data
                .chunks(SECTOR_SIZE)
                .zip(spare[..area].chunks_mut(ecc_bytes))
            {
                self.codec.compute_into(sector, code);
            }
        }

        self.write_raw(page, data, &spare)
    }

    /// Erase one block
    pub fn erase_block(&mut self, block: u32) -> Result<EraseStatus> {
        if block >= self.layout.blocks {
            return Err(Error::OutOfRange {
                offset: u64::from(block) * self.layout.block_size(),
                len: self.layout.block_size(),
            });
        }
        self.cached_page = None;

        let page = self.layout.first_page(block);
        let status = self.engine.execute(
            &self.programs.erase_block,
            page,
            Buffers::None,
            self.timeout,
        )?;
        match status {
            Status::TimedOut => Err(Error::TimedOut),
            status if status.failed() => {
                warn!(block, "Erase failed");
                Ok(EraseStatus::Failed)
            }
            Status::Done { .. } => Ok(EraseStatus::Ok),
        }
    }

    /// Read part of a page, through the single-page cache
    ///
    /// A cache hit reports nothing new. Uncorrectable pages are returned as read but never
    /// cached.
    pub fn read_sectors(&mut self, page: u32, offset: usize, buf: &mut [u8]) -> Result<PageReport> {
        let end = offset + buf.len();
        if end > self.layout.bytes_per_page {
            return Err(Error::OutOfRange {
                offset: offset as u64,
                len: buf.len() as u64,
            });
        }

        if self.cached_page == Some(page) {
            buf.copy_from_slice(&self.bounce_data[offset..end]);
            return Ok(PageReport::default());
        }

        self.cached_page = None;
        let mut data = std::mem::take(&mut self.bounce_data);
        let mut oob = std::mem::take(&mut self.bounce_oob);
        let result = self.read_page(page, &mut data, &mut oob);
        buf.copy_from_slice(&data[offset..end]);
        self.bounce_data = data;
        self.bounce_oob = oob;

        let report = result?;
        if report.failed_sectors == 0 {
            self.cached_page = Some(page);
        }
        Ok(report)
    }
}
