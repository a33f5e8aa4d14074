//! Finding, loading and re-persisting the two on-medium copies of the bad block table
//!
//! Each copy occupies one block of the reserved region: the raw bitmap in the block's first
//! page and a [TableHeader] in its last page. Versions are compared circularly (as a signed
//! 8-bit difference), which orders them correctly as long as the two copies never drift more
//! than 127 versions apart.
//!
//! Whenever a copy is written, the other one is brought to the same version before the
//! operation returns, so outside of a persist the two copies always agree.

use tracing::{debug, info, warn};

use super::header::{Role, TableHeader};
use super::{BadBlockTable, BlockHealth};
use crate::error::{Error, Result};
use crate::nand::NandBus;
use crate::page_io::{EraseStatus, PageIo};
use crate::seq::Clock;

/// Is version `a` newer than version `b`?
pub fn is_newer(a: u8, b: u8) -> bool {
    (a.wrapping_sub(b) as i8) > 0
}

/// Where one copy lives on the medium
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct CopyState {
    pub block: u32,
    pub version: u8,
}

/// Locations and versions of both copies; `None` means the role has no current copy
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct TableState {
    pub primary: Option<CopyState>,
    pub mirror: Option<CopyState>,
}

impl TableState {
    pub fn get(&self, role: Role) -> Option<CopyState> {
        match role {
            Role::Primary => self.primary,
            Role::Mirror => self.mirror,
        }
    }

    fn set(&mut self, role: Role, state: Option<CopyState>) {
        match role {
            Role::Primary => self.primary = state,
            Role::Mirror => self.mirror = state,
        }
    }
}

/// What a search of the reserved region turned up
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum SearchResult {
    Found {
        primary: CopyState,
        mirror: CopyState,
    },
    FoundOne { role: Role, copy: CopyState },
    FoundNone,
}

/// Which copy to trust, and which role (if any) must be rewritten to match it
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Resolution {
    pub source: Role,
    pub copy: CopyState,
    pub pending: Option<Role>,
}

/// Owns the in-memory table and keeps the on-medium copies in step with it
#[derive(Debug, Clone)]
pub struct BbtSync {
    table: BadBlockTable,
    state: TableState,
    author: String,
}

impl BbtSync {
    /// Look at the last page of every reserved block for table headers
    ///
    /// Copies whose header cannot be read are ignored. If one role turns up more than once, the
    /// newest copy wins, and of equally new copies the lowest block.
    pub fn search<B: NandBus, C: Clock>(io: &mut PageIo<B, C>) -> Result<SearchResult> {
        let layout = io.layout();
        let first_reserved = layout.blocks.saturating_sub(super::RESERVED_BLOCKS);

        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes_per_page];
        let mut found = TableState::default();

        for block in first_reserved..layout.blocks {
            let page = layout.last_page(block);
            let report = io.read_page(page, &mut data, &mut oob)?;
            if report.failed_sectors > 0 {
                warn!(block, "Unreadable table header, skipping");
                continue;
            }

            let Some(header) = TableHeader::decode(&data) else {
                continue;
            };
            debug!(block, role = ?header.role, version = header.version, "Found table copy");

            let copy = CopyState {
                block,
                version: header.version,
            };
            match found.get(header.role) {
                Some(existing) if !is_newer(copy.version, existing.version) => {}
                _ => found.set(header.role, Some(copy)),
            }
        }

        Ok(match (found.primary, found.mirror) {
            (Some(primary), Some(mirror)) => SearchResult::Found { primary, mirror },
            (Some(copy), None) => SearchResult::FoundOne {
                role: Role::Primary,
                copy,
            },
            (None, Some(copy)) => SearchResult::FoundOne {
                role: Role::Mirror,
                copy,
            },
            (None, None) => SearchResult::FoundNone,
        })
    }

    /// Pick the authoritative copy
    pub fn resolve(found: &SearchResult) -> Result<Resolution> {
        match *found {
            SearchResult::Found { primary, mirror } => Ok(if primary.version == mirror.version {
                Resolution {
                    source: Role::Primary,
                    copy: primary,
                    pending: None,
                }
            } else if is_newer(mirror.version, primary.version) {
                Resolution {
                    source: Role::Mirror,
                    copy: mirror,
                    pending: Some(Role::Primary),
                }
            } else {
                Resolution {
                    source: Role::Primary,
                    copy: primary,
                    pending: Some(Role::Mirror),
                }
            }),
            SearchResult::FoundOne { role, copy } => Ok(Resolution {
                source: role,
                copy,
                pending: Some(role.other()),
            }),
            SearchResult::FoundNone => Err(Error::NoTableFound),
        }
    }

    /// Load the table from the medium, repairing whichever copy is missing or stale
    ///
    /// Fails with [Error::NoTableFound] or [Error::TableUnreadable] if the caller has to fall
    /// back to a marker scan and [BbtSync::bootstrap].
    pub fn load<B: NandBus, C: Clock>(
        io: &mut PageIo<B, C>,
        author: impl Into<String>,
    ) -> Result<Self> {
        let layout = io.layout();
        let found = Self::search(io)?;
        let resolution = Self::resolve(&found)?;
        let CopyState { block, version } = resolution.copy;

        let mut data = vec![0; layout.bytes_per_page];
        let mut oob = vec![0; layout.oob_bytes_per_page];
        io.read_page(layout.first_page(block), &mut data, &mut oob)?
            .check(layout.first_page(block))
            .map_err(|_| Error::TableUnreadable { block })?;

        let table = BadBlockTable::from_bytes(layout.blocks, super::RESERVED_BLOCKS, &data);
        info!(
            source = ?resolution.source,
            block,
            version,
            bad = table.bad_blocks().count(),
            "Loaded bad block table"
        );

        let mut state = TableState::default();
        if let SearchResult::Found { primary, mirror } = found {
            state.primary = Some(primary);
            state.mirror = Some(mirror);
        } else {
            state.set(resolution.source, Some(resolution.copy));
        }

        let mut sync = Self {
            table,
            state,
            author: author.into(),
        };

        if let Some(role) = resolution.pending {
            sync.repair(io, role, version)?;
        }

        Ok(sync)
    }

    /// Rewrite `role` at `version` after a load
    ///
    /// The loaded table stays usable if this fails; the role is then left without a current
    /// copy, to be written by the next update.
    fn repair<B: NandBus, C: Clock>(
        &mut self,
        io: &mut PageIo<B, C>,
        role: Role,
        version: u8,
    ) -> Result<()> {
        if io.is_write_protected()? {
            warn!(role = ?role, "Device is write-protected, leaving table copy out of date");
            self.state.set(role, None);
            return Ok(());
        }

        info!(role = ?role, version, "Bringing table copy up to date");
        let result = self
            .persist(io, role, version)
            .and_then(|()| self.keep_in_sync(io));

        if let Err(err) = result {
            warn!(role = ?role, "Could not bring table copies into step: {err}");
            let newest = [self.state.primary, self.state.mirror]
                .into_iter()
                .flatten()
                .map(|copy| copy.version)
                .reduce(|a, b| if is_newer(b, a) { b } else { a });
            for role in [Role::Primary, Role::Mirror] {
                if self.state.get(role).map(|copy| copy.version) != newest {
                    self.state.set(role, None);
                }
            }
        }

        Ok(())
    }

    /// Write both copies of a freshly built table, at version 0
    pub fn bootstrap<B: NandBus, C: Clock>(
        io: &mut PageIo<B, C>,
        table: BadBlockTable,
        author: impl Into<String>,
    ) -> Result<Self> {
        let mut sync = Self {
            table,
            state: TableState::default(),
            author: author.into(),
        };

        info!("Writing initial bad block tables");
        sync.persist(io, Role::Primary, 0)?;
        sync.keep_in_sync(io)?;
        Ok(sync)
    }

    pub fn table(&self) -> &BadBlockTable {
        &self.table
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    /// Write `role`'s copy of the table at `version`
    ///
    /// Candidates are tried from the role's current block downward through the reserved region,
    /// skipping bad blocks and the other role's block. A candidate that fails to erase or
    /// program is marked worn out, which changes the table, so the version is bumped before the
    /// next candidate. Running out of candidates leaves the role without a current copy.
    pub fn persist<B: NandBus, C: Clock>(
        &mut self,
        io: &mut PageIo<B, C>,
        role: Role,
        version: u8,
    ) -> Result<()> {
        let layout = io.layout();
        let first_reserved = self.table.first_reserved();
        let start = self
            .state
            .get(role)
            .map_or(layout.blocks - 1, |copy| copy.block);
        let other = self.state.get(role.other()).map(|copy| copy.block);

        let mut version = version;
        for block in (first_reserved..=start).rev() {
            if Some(block) == other || self.table.get(block) != BlockHealth::Good {
                continue;
            }

            match self.write_copy(io, role, block, version) {
                Ok(()) => {
                    info!(role = ?role, block, version, "Wrote bad block table");
                    self.state.set(role, Some(CopyState { block, version }));
                    return Ok(());
                }
                Err(err @ (Error::EraseFailed { .. } | Error::ProgramFailed { .. })) => {
                    warn!(role = ?role, block, "Failed to write table copy: {err}");
                    self.table.mark(block, BlockHealth::BadWear);
                    version = version.wrapping_add(1);
                }
                Err(err) => return Err(err),
            }
        }

        warn!(role = ?role, "No space left for the bad block table");
        self.state.set(role, None);
        Err(Error::NoSpace)
    }

    /// Erase `block`, then write the bitmap to its first page and the header to its last
    fn write_copy<B: NandBus, C: Clock>(
        &self,
        io: &mut PageIo<B, C>,
        role: Role,
        block: u32,
        version: u8,
    ) -> Result<()> {
        let layout = io.layout();

        if io.erase_block(block)? == EraseStatus::Failed {
            return Err(Error::EraseFailed { block });
        }

        let mut page = vec![0xFF; layout.bytes_per_page];
        let bitmap = self.table.as_bytes();
        page.get_mut(..bitmap.len())
            .ok_or_else(|| Error::Incompatible("bad block table does not fit in a page".into()))?
            .copy_from_slice(bitmap);
        io.write_page(layout.first_page(block), &page, None)?;

        page.fill(0xFF);
        TableHeader {
            role,
            version,
            ecc_size: io.mode().ecc_bytes() as u8,
            author: self.author.clone(),
        }
        .encode(&mut page)?;
        io.write_page(layout.last_page(block), &page, None)
    }

    /// Re-persist the older copy at the newer copy's version until both agree
    pub fn keep_in_sync<B: NandBus, C: Clock>(&mut self, io: &mut PageIo<B, C>) -> Result<()> {
        loop {
            let (role, version) = match (self.state.primary, self.state.mirror) {
                (Some(p), Some(m)) if p.version == m.version => return Ok(()),
                (Some(p), Some(m)) if is_newer(p.version, m.version) => (Role::Mirror, p.version),
                (Some(_), Some(m)) => (Role::Primary, m.version),
                (Some(p), None) => (Role::Mirror, p.version),
                (None, Some(m)) => (Role::Primary, m.version),
                (None, None) => return Err(Error::NoSpace),
            };

            debug!(role = ?role, version, "Table copies out of step");
            self.persist(io, role, version)?;
        }
    }

    /// Persist both copies at the next version
    pub fn update<B: NandBus, C: Clock>(&mut self, io: &mut PageIo<B, C>) -> Result<()> {
        let version = self
            .state
            .primary
            .or(self.state.mirror)
            .map_or(0, |copy| copy.version.wrapping_add(1));

        self.persist(io, Role::Primary, version)?;
        self.keep_in_sync(io)
    }

    /// Mark `block` worn out and persist the change
    ///
    /// Returns `false` (and writes nothing) if the block was already bad or is reserved.
    pub fn mark_bad<B: NandBus, C: Clock>(
        &mut self,
        io: &mut PageIo<B, C>,
        block: u32,
    ) -> Result<bool> {
        if self.table.is_bad(block) {
            return Ok(false);
        }

        info!(block, "Marking block bad");
        self.table.mark(block, BlockHealth::BadWear);
        self.update(io)?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::bbt::RESERVED_BLOCKS;
    use crate::ecc::EccMode;
    use crate::nand::{SimNand, TEST_LAYOUT};
    use crate::seq::{ManualClock, SequenceEngine};

    const AUTHOR: &str = "sync test";

    fn page_io() -> PageIo<SimNand, ManualClock> {
        let engine = SequenceEngine::new(
            SimNand::new(TEST_LAYOUT),
            ManualClock::new(),
            Duration::from_micros(10),
        );
        PageIo::new(
            engine,
            TEST_LAYOUT,
            EccMode::Bch18,
            Duration::from_millis(500),
        )
        .expect("test geometry is compatible")
    }

    fn fresh_table() -> BadBlockTable {
        BadBlockTable::new(TEST_LAYOUT.blocks, RESERVED_BLOCKS)
    }

    fn copy(block: u32, version: u8) -> Option<CopyState> {
        Some(CopyState { block, version })
    }

    #[test]
    fn test_version_ordering() {
        assert!(is_newer(6, 5));
        assert!(!is_newer(5, 6));
        assert!(!is_newer(5, 5));
        assert!(is_newer(0, 255));
        assert!(is_newer(3, 250));
        assert!(!is_newer(255, 0));
    }

    #[test]
    fn test_resolve() {
        let p = CopyState {
            block: 31,
            version: 7,
        };
        let m = CopyState {
            block: 30,
            version: 9,
        };

        let found = SearchResult::Found {
            primary: p,
            mirror: m,
        };
        let resolution = BbtSync::resolve(&found).unwrap();
        assert_eq!(resolution.source, Role::Mirror);
        assert_eq!(resolution.pending, Some(Role::Primary));

        let found = SearchResult::Found {
            primary: p,
            mirror: p,
        };
        assert_eq!(BbtSync::resolve(&found).unwrap().pending, None);

        let found = SearchResult::FoundOne {
            role: Role::Primary,
            copy: CopyState {
                block: 31,
                version: 5,
            },
        };
        let resolution = BbtSync::resolve(&found).unwrap();
        assert_eq!(resolution.source, Role::Primary);
        assert_eq!(resolution.copy.version, 5);
        assert_eq!(resolution.pending, Some(Role::Mirror));

        assert!(matches!(
            BbtSync::resolve(&SearchResult::FoundNone),
            Err(Error::NoTableFound)
        ));
    }

    #[test]
    fn test_bootstrap_and_load() -> anyhow::Result<()> {
        let mut io = page_io();
        assert!(matches!(
            BbtSync::load(&mut io, AUTHOR),
            Err(Error::NoTableFound)
        ));

        let mut table = fresh_table();
        table.mark(3, BlockHealth::BadFactory);
        let sync = BbtSync::bootstrap(&mut io, table.clone(), AUTHOR)?;
        assert_eq!(
            sync.state(),
            TableState {
                primary: copy(31, 0),
                mirror: copy(30, 0),
            }
        );

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table(), &table);
        assert_eq!(loaded.state(), sync.state());

        let header_page = io.bus().raw_page(TEST_LAYOUT.last_page(30))?;
        assert_eq!(&header_page[..4], b"1tbB");
        assert_eq!(&header_page[20..29], AUTHOR.as_bytes());
        Ok(())
    }

    #[test]
    fn test_primary_only() -> anyhow::Result<()> {
        let mut io = page_io();

        // Only a Primary at version 5 on the medium
        let mut table = fresh_table();
        table.mark(9, BlockHealth::BadWear);
        let mut sync = BbtSync {
            table: table.clone(),
            state: TableState::default(),
            author: AUTHOR.into(),
        };
        sync.persist(&mut io, Role::Primary, 5)?;

        let found = BbtSync::search(&mut io)?;
        assert_eq!(
            found,
            SearchResult::FoundOne {
                role: Role::Primary,
                copy: CopyState {
                    block: 31,
                    version: 5,
                },
            }
        );

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table(), &table);
        assert_eq!(
            loaded.state(),
            TableState {
                primary: copy(31, 5),
                mirror: copy(30, 5),
            }
        );
        Ok(())
    }

    #[test]
    fn test_newer_copy_wins_across_wraparound() -> anyhow::Result<()> {
        let mut io = page_io();

        let mut old = fresh_table();
        old.mark(4, BlockHealth::BadWear);
        let mut new = old.clone();
        new.mark(12, BlockHealth::BadWear);

        let mut sync = BbtSync {
            table: old,
            state: TableState::default(),
            author: AUTHOR.into(),
        };
        sync.persist(&mut io, Role::Mirror, 255)?;
        sync.table = new.clone();
        sync.persist(&mut io, Role::Primary, 0)?;
        assert_eq!(
            sync.state(),
            TableState {
                primary: copy(30, 0),
                mirror: copy(31, 255),
            }
        );

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table(), &new);
        assert_eq!(loaded.state().mirror, copy(31, 0));

        // A reload now sees two agreeing copies
        let reloaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(reloaded.state(), loaded.state());
        Ok(())
    }

    #[test]
    fn test_persist_skips_failing_blocks() -> anyhow::Result<()> {
        let mut io = page_io();
        io.bus_mut().fail_erase(31);
        io.bus_mut().fail_program(29);

        let sync = BbtSync::bootstrap(&mut io, fresh_table(), AUTHOR)?;

        // Primary: 31 fails (version 1), lands on 30. Mirror follows at 1: 29 fails
        // (version 2), lands on 28. Primary then catches up to 2 in place.
        assert_eq!(sync.table().get(31), BlockHealth::BadWear);
        assert_eq!(sync.table().get(29), BlockHealth::BadWear);
        assert_eq!(
            sync.state(),
            TableState {
                primary: copy(30, 2),
                mirror: copy(28, 2),
            }
        );

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table(), sync.table());
        Ok(())
    }

    #[test]
    fn test_no_space() -> anyhow::Result<()> {
        let mut io = page_io();
        for block in 28..32 {
            io.bus_mut().fail_erase(block);
        }

        let mut sync = BbtSync {
            table: fresh_table(),
            state: TableState::default(),
            author: AUTHOR.into(),
        };
        assert!(matches!(
            sync.persist(&mut io, Role::Primary, 0),
            Err(Error::NoSpace)
        ));
        assert_eq!(sync.state().primary, None);
        assert_eq!(sync.table().bad_blocks().count(), 4);
        assert!(matches!(BbtSync::search(&mut io)?, SearchResult::FoundNone));
        Ok(())
    }

    #[test]
    fn test_mark_bad_bumps_versions() -> anyhow::Result<()> {
        let mut io = page_io();
        let mut sync = BbtSync::bootstrap(&mut io, fresh_table(), AUTHOR)?;

        assert!(sync.mark_bad(&mut io, 6)?);
        assert_eq!(sync.table().get(6), BlockHealth::BadWear);
        assert_eq!(
            sync.state(),
            TableState {
                primary: copy(31, 1),
                mirror: copy(30, 1),
            }
        );

        // Already bad, or reserved: nothing to do
        assert!(!sync.mark_bad(&mut io, 6)?);
        assert!(!sync.mark_bad(&mut io, 29)?);
        assert_eq!(sync.state().primary, copy(31, 1));

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table().get(6), BlockHealth::BadWear);
        Ok(())
    }

    #[test]
    fn test_unreadable_header_skipped() -> anyhow::Result<()> {
        let mut io = page_io();
        BbtSync::bootstrap(&mut io, fresh_table(), AUTHOR)?;

        // Wreck the Primary's header page beyond repair
        for k in 0..40 {
            io.bus_mut().flip_bit(TEST_LAYOUT.last_page(31), k * 3)?;
        }

        let found = BbtSync::search(&mut io)?;
        assert_eq!(
            found,
            SearchResult::FoundOne {
                role: Role::Mirror,
                copy: CopyState {
                    block: 30,
                    version: 0,
                },
            }
        );

        // Loading rewrites the Primary in place of its damaged copy
        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.state().primary, copy(31, 0));
        Ok(())
    }

    /// Make the Mirror's header at block 30 unreadable
    fn wreck_mirror_header(io: &mut PageIo<SimNand, ManualClock>) -> anyhow::Result<()> {
        for k in 0..40 {
            io.bus_mut().flip_bit(TEST_LAYOUT.last_page(30), k * 3)?;
        }
        Ok(())
    }

    #[test]
    fn test_load_survives_failed_repair() -> anyhow::Result<()> {
        let mut io = page_io();
        let mut table = fresh_table();
        table.mark(7, BlockHealth::BadWear);
        BbtSync::bootstrap(&mut io, table, AUTHOR)?;

        wreck_mirror_header(&mut io)?;
        for block in 28..32 {
            io.bus_mut().fail_erase(block);
        }

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table().get(7), BlockHealth::BadWear);
        assert!(loaded
            .table()
            .bad_blocks()
            .all(|(block, _)| block == 7 || block >= 28));
        assert_eq!(
            loaded.state(),
            TableState {
                primary: copy(31, 0),
                mirror: None,
            }
        );

        // Once the blocks work again, the next update restores the Mirror
        io.bus_mut().clear_faults();
        let mut loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.state().mirror, copy(30, 0));
        assert!(loaded.mark_bad(&mut io, 9)?);
        assert_eq!(
            loaded.state(),
            TableState {
                primary: copy(31, 1),
                mirror: copy(30, 1),
            }
        );
        Ok(())
    }

    #[test]
    fn test_load_write_protected_single_copy() -> anyhow::Result<()> {
        let mut io = page_io();
        let mut table = fresh_table();
        table.mark(3, BlockHealth::BadFactory);
        BbtSync::bootstrap(&mut io, table.clone(), AUTHOR)?;

        wreck_mirror_header(&mut io)?;
        io.bus_mut().set_write_protect(true);

        let loaded = BbtSync::load(&mut io, AUTHOR)?;
        assert_eq!(loaded.table(), &table);
        assert_eq!(
            loaded.state(),
            TableState {
                primary: copy(31, 0),
                mirror: None,
            }
        );
        Ok(())
    }

    #[test]
    fn test_search_prefers_lowest_duplicate() -> anyhow::Result<()> {
        let mut io = page_io();
        let mut sync = BbtSync {
            table: fresh_table(),
            state: TableState::default(),
            author: AUTHOR.into(),
        };
        sync.persist(&mut io, Role::Primary, 4)?;
        sync.state.primary = copy(29, 4);
        sync.persist(&mut io, Role::Primary, 4)?;

        assert_eq!(
            BbtSync::search(&mut io)?,
            SearchResult::FoundOne {
                role: Role::Primary,
                copy: CopyState {
                    block: 29,
                    version: 4,
                },
            }
        );
        Ok(())
    }

    #[test]
    fn test_unreadable_bitmap() -> anyhow::Result<()> {
        let mut io = page_io();
        BbtSync::bootstrap(&mut io, fresh_table(), AUTHOR)?;

        for block in [30, 31] {
            for k in 0..40 {
                io.bus_mut().flip_bit(TEST_LAYOUT.first_page(block), k * 5)?;
            }
        }

        assert!(matches!(
            BbtSync::load(&mut io, AUTHOR),
            Err(Error::TableUnreadable { block: 31 })
        ));
        Ok(())
    }
}
