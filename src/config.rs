//! Attach-time configuration of the controller

use std::str::FromStr;
use std::time::Duration;

use crate::bbt::BbmScheme;
use crate::ecc::{EccMode, SECTOR_SIZE};
use crate::error::{Error, Result};
use crate::nand::NandLayout;

/// How to pick the ECC mode
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum EccSelect {
    /// The strongest BCH mode the OOB area can hold
    #[default]
    Auto,
    Fixed(EccMode),
}

impl EccSelect {
    /// Settle on a mode for a device with `layout`
    pub fn select(self, layout: &NandLayout) -> Result<EccMode> {
        match self {
            EccSelect::Fixed(mode) => Ok(mode),
            EccSelect::Auto => {
                let sectors = layout.bytes_per_page / SECTOR_SIZE;
                if sectors == 0 {
                    return Err(Error::Incompatible(format!(
                        "page size {} is smaller than a sector",
                        layout.bytes_per_page
                    )));
                }
                EccMode::strongest_fitting(layout.oob_bytes_per_page / sectors).ok_or_else(|| {
                    Error::Incompatible("insufficient OOB for BCH ECC".into())
                })
            }
        }
    }
}

/// Parse "auto", "none", "18" or "30"
impl FromStr for EccSelect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "auto" => EccSelect::Auto,
            "none" | "off" => EccSelect::Fixed(EccMode::NoEcc),
            "18" | "bch18" => EccSelect::Fixed(EccMode::Bch18),
            "30" | "bch30" => EccSelect::Fixed(EccMode::Bch30),
            other => anyhow::bail!("unknown ECC mode {other:?} (expected auto, none, 18 or 30)"),
        })
    }
}

/// Everything a controller needs to know besides the bus and the geometry
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub ecc: EccSelect,

    /// Report pages with at least this many corrected bits in one sector as needing a scrub;
    /// defaults to the ECC strength
    pub bitflip_threshold: Option<u32>,

    /// How long one hardware program may wait for the device
    pub timeout: Duration,

    /// Pause between ready polls
    pub poll_interval: Duration,

    /// Where factory bad block markers live, for when no table is found
    pub bbm: BbmScheme,

    /// Written into every table header
    pub author: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ecc: EccSelect::Auto,
            bitflip_threshold: None,
            timeout: Duration::from_millis(500),
            poll_interval: Duration::from_micros(10),
            bbm: BbmScheme::default(),
            author: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

impl ControllerConfig {
    pub fn ecc(mut self, ecc: EccSelect) -> Self {
        self.ecc = ecc;
        self
    }

    pub fn bitflip_threshold(mut self, threshold: u32) -> Self {
        self.bitflip_threshold = Some(threshold);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bbm(mut self, bbm: BbmScheme) -> Self {
        self.bbm = bbm;
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }
}

#[test]
fn test_ecc_select() -> anyhow::Result<()> {
    assert_eq!("auto".parse::<EccSelect>()?, EccSelect::Auto);
    assert_eq!("None".parse::<EccSelect>()?, EccSelect::Fixed(EccMode::NoEcc));
    assert_eq!("30".parse::<EccSelect>()?, EccSelect::Fixed(EccMode::Bch30));
    assert!("24".parse::<EccSelect>().is_err());

    let layout: NandLayout = "64x64x4096+224".parse()?;
    assert_eq!(EccSelect::Auto.select(&layout)?, EccMode::Bch30);

    let layout: NandLayout = "64x64x2048+64".parse()?;
    assert_eq!(EccSelect::Auto.select(&layout)?, EccMode::Bch18);
    assert_eq!(
        EccSelect::Fixed(EccMode::NoEcc).select(&layout)?,
        EccMode::NoEcc
    );

    let layout: NandLayout = "64x64x2048+32".parse()?;
    assert!(EccSelect::Auto.select(&layout).is_err());

    let layout: NandLayout = "64x64x512+16".parse()?;
    assert!(EccSelect::Auto.select(&layout).is_err());
    Ok(())
}

#[test]
fn test_config_defaults() {
    let config = ControllerConfig::default();
    assert_eq!(config.ecc, EccSelect::Auto);
    assert_eq!(config.timeout, Duration::from_millis(500));
    assert!(config.author.starts_with("nand-bch "));

    let config = config.author("someone").bitflip_threshold(4);
    assert_eq!(config.author, "someone");
    assert_eq!(config.bitflip_threshold, Some(4));
}
