//! The on-medium header identifying a bad block table copy
//!
//! The header is written at the start of the last page of the block holding the copy:
//!
//! ```text
//! signature[4] version reserved[3] schema[4] private_schema[4] ecc_byte_count[4] author[64]
//! ```
//!
//! The rest of the page is left at 0xFF.

use deku::prelude::*;

use crate::error::Error;

pub const PRIMARY_SIGNATURE: [u8; 4] = *b"Bbt0";
pub const MIRROR_SIGNATURE: [u8; 4] = *b"1tbB";
pub const BASE_SCHEMA: [u8; 4] = [0x10; 4];
pub const PRIVATE_SCHEMA: [u8; 4] = [0x10; 4];

/// Size of the encoded header
pub const HEADER_SIZE: usize = 84;
const AUTHOR_SIZE: usize = 64;

/// Which of the two table copies
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Role {
    Primary,
    Mirror,
}

impl Role {
    pub fn signature(self) -> [u8; 4] {
        match self {
            Role::Primary => PRIMARY_SIGNATURE,
            Role::Mirror => MIRROR_SIGNATURE,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Role::Primary => Role::Mirror,
            Role::Mirror => Role::Primary,
        }
    }
}

/// The raw header, field for field
#[derive(Debug, Eq, PartialEq, Clone, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct TableHdr {
    pub signature: [u8; 4],
    pub version: u8,
    pub reserved: [u8; 3],
    pub schema: [u8; 4],
    pub private_schema: [u8; 4],
    pub ecc_size: [u8; 4],
    pub author: [u8; AUTHOR_SIZE],
}

/// This represents the specific fields we care about in a table header
///
/// This is meant to be more ergonomic to work with than TableHdr, which represents the raw data
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct TableHeader {
    pub role: Role,
    pub version: u8,
    pub ecc_size: u8,
    pub author: String,
}

impl TableHeader {
    /// Convert from a byte slice, if it holds a valid header
    ///
    /// Signature and both schemas must match exactly.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, hdr) = TableHdr::from_bytes((bytes, 0)).ok()?;

        let role = match hdr.signature {
            PRIMARY_SIGNATURE => Role::Primary,
            MIRROR_SIGNATURE => Role::Mirror,
            _ => return None,
        };
        if hdr.schema != BASE_SCHEMA || hdr.private_schema != PRIVATE_SCHEMA {
            return None;
        }

        let author_len = hdr
            .author
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(AUTHOR_SIZE);

        Some(Self {
            role,
            version: hdr.version,
            ecc_size: hdr.ecc_size[0],
            author: String::from_utf8_lossy(&hdr.author[..author_len]).into_owned(),
        })
    }

    /// Write into a byte slice
    pub fn encode(&self, out_bytes: &mut [u8]) -> crate::error::Result<()> {
        let bytes = TableHdr::from(self).to_bytes()?;
        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or_else(|| Error::Incompatible("page too small for table header".into()))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<&TableHeader> for TableHdr {
    fn from(value: &TableHeader) -> Self {
        // NUL-padded; an over-long author is truncated, keeping the terminator
        let mut author = [0u8; AUTHOR_SIZE];
        let len = value.author.len().min(AUTHOR_SIZE - 1);
        author[..len].copy_from_slice(&value.author.as_bytes()[..len]);

        Self {
            signature: value.role.signature(),
            version: value.version,
            reserved: [0; 3],
            schema: BASE_SCHEMA,
            private_schema: PRIVATE_SCHEMA,
            ecc_size: [value.ecc_size; 4],
            author,
        }
    }
}

#[test]
fn test_header_layout() -> anyhow::Result<()> {
    let header = TableHeader {
        role: Role::Mirror,
        version: 0xA7,
        ecc_size: 32,
        author: "nand-bch test".into(),
    };

    assert_eq!(TableHdr::from(&header).to_bytes()?.len(), HEADER_SIZE);

    let mut page = vec![0xFF; 2048];
    header.encode(&mut page)?;

    assert_eq!(&page[..4], b"1tbB");
    assert_eq!(page[4], 0xA7);
    assert_eq!(&page[5..8], &[0, 0, 0]);
    assert_eq!(&page[8..16], &[0x10; 8]);
    assert_eq!(&page[16..20], &[32; 4]);
    assert_eq!(&page[20..33], b"nand-bch test");
    assert_eq!(page[33], 0);
    assert_eq!(page[HEADER_SIZE - 1], 0);
    assert!(page[HEADER_SIZE..].iter().all(|&x| x == 0xFF));

    assert_eq!(TableHeader::decode(&page), Some(header));
    Ok(())
}

#[test]
fn test_header_rejects_near_misses() -> anyhow::Result<()> {
    let header = TableHeader {
        role: Role::Primary,
        version: 1,
        ecc_size: 54,
        author: "x".repeat(100),
    };

    let mut page = vec![0xFF; 512];
    header.encode(&mut page)?;
    let decoded = TableHeader::decode(&page).expect("valid header");
    assert_eq!(decoded.author.len(), AUTHOR_SIZE - 1);

    for (offset, bit) in [(0, 0x01), (9, 0x10), (14, 0x02)] {
        let mut damaged = page.clone();
        damaged[offset] ^= bit;
        assert_eq!(TableHeader::decode(&damaged), None);
    }

    assert_eq!(TableHeader::decode(&[0xFF; 512]), None);
    assert_eq!(TableHeader::decode(&page[..40]), None);
    Ok(())
}
