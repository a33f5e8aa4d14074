//! Per-sector BCH error correction
//!
//! Every 1024-byte sector of a page carries its own ECC record in the page's OOB area. The
//! codec computes those records, checks and repairs sectors against them, and recognizes
//! erased pages (which carry no valid record at all).

use std::fmt;

use crate::nand::PageUtil;

mod bch;

use bch::Bch;

/// The unit of ECC protection, in bytes
pub const SECTOR_SIZE: usize = 1024;

/// The ECC modes supported by the controller
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum EccMode {
    /// 18 correctable bits per sector, 32 ECC bytes per sector
    Bch18,
    /// 30 correctable bits per sector, 54 ECC bytes per sector
    Bch30,
    /// No protection
    NoEcc,
}

impl EccMode {
    /// Size of one sector's ECC record
    pub fn ecc_bytes(self) -> usize {
        match self {
            EccMode::Bch18 => 32,
            EccMode::Bch30 => 54,
            EccMode::NoEcc => 0,
        }
    }

    /// Correctable bits per sector
    pub fn strength(self) -> u32 {
        match self {
            EccMode::Bch18 => 18,
            EccMode::Bch30 => 30,
            EccMode::NoEcc => 0,
        }
    }

    /// The strongest BCH mode whose records fit into `oob_per_sector` bytes
    pub fn strongest_fitting(oob_per_sector: usize) -> Option<Self> {
        [EccMode::Bch30, EccMode::Bch18]
            .into_iter()
            .find(|mode| mode.ecc_bytes() <= oob_per_sector)
    }
}

impl fmt::Display for EccMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EccMode::Bch18 => write!(f, "18-bit BCH"),
            EccMode::Bch30 => write!(f, "30-bit BCH"),
            EccMode::NoEcc => write!(f, "no ECC"),
        }
    }
}

/// The result of checking one sector
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Outcome {
    /// No errors
    Ok,
    /// This many bits were wrong and have been repaired
    Corrected(u32),
    /// Too many bits were wrong; the sector was left as read
    Uncorrectable,
}

/// Computes and checks ECC records for one [EccMode]
#[derive(Debug, Clone)]
pub struct EccCodec {
    mode: EccMode,
    bch: Option<Bch>,
}

impl EccCodec {
    pub fn new(mode: EccMode) -> Self {
        let bch = match mode {
            EccMode::NoEcc => None,
            mode => Some(Bch::new(mode.strength() as usize)),
        };
        debug_assert!(bch
            .as_ref()
            .map_or(true, |bch| bch.parity_bits() <= mode.ecc_bytes() * 8));

        Self { mode, bch }
    }

    pub fn mode(&self) -> EccMode {
        self.mode
    }

    pub fn ecc_bytes(&self) -> usize {
        self.mode.ecc_bytes()
    }

    pub fn strength(&self) -> u32 {
        self.mode.strength()
    }

    /// Compute the ECC record of `sector`
    pub fn compute(&self, sector: &[u8]) -> Vec<u8> {
        let mut code = vec![0; self.ecc_bytes()];
        self.compute_into(sector, &mut code);
        code
    }

    /// Compute the ECC record of `sector` into `code`, which must be `ecc_bytes()` long
    pub fn compute_into(&self, sector: &[u8], code: &mut [u8]) {
        if let Some(bch) = &self.bch {
            bch.encode(sector, code);
        }
    }

    /// Check `sector` against the record read from the medium, repairing it if possible
    ///
    /// `calc_code` is the record recomputed from `sector` as read.
    pub fn correct(&self, sector: &mut [u8], read_code: &[u8], calc_code: &[u8]) -> Outcome {
        let Some(bch) = &self.bch else {
            return Outcome::Ok;
        };

        match bch.decode(sector, read_code, calc_code) {
            Some(0) => Outcome::Ok,
            Some(n) => Outcome::Corrected(n),
            None => Outcome::Uncorrectable,
        }
    }

    /// Does this page (and its ECC records) look erased, tolerating a few stuck-at-0 bits?
    ///
    /// An erased page is normalized to all-ones; see [EccCodec::erased_bitflips].
    pub fn is_erased(page: &mut [u8], oob_records: &mut [u8], max_zero_bits: usize) -> bool {
        Self::erased_bitflips(page, oob_records, max_zero_bits).is_some()
    }

    /// Count the zero bits in `page` and `oob_records`
    ///
    /// Returns `None` as soon as more than `max_zero_bits` are found. Otherwise both buffers are
    /// reset to all-ones and the zero-bit count is returned.
    pub fn erased_bitflips(
        page: &mut [u8],
        oob_records: &mut [u8],
        max_zero_bits: usize,
    ) -> Option<usize> {
        let mut zeros = 0;
        for chunk in page.chunks(64).chain(oob_records.chunks(64)) {
            zeros += chunk.zero_bits();
            if zeros > max_zero_bits {
                return None;
            }
        }

        page.fill(0xFF);
        oob_records.fill(0xFF);
        Some(zeros)
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_sector(rng: &mut StdRng) -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        rng.fill(&mut sector[..]);
        sector
    }

    /// Flip `count` distinct random bits of `sector`
    fn flip_bits(rng: &mut StdRng, sector: &mut [u8], count: usize) {
        for bit in rand::seq::index::sample(rng, sector.len() * 8, count) {
            sector[bit / 8] ^= 0x80 >> (bit % 8);
        }
    }

    fn check(codec: &EccCodec, sector: &mut [u8], read_code: &[u8]) -> Outcome {
        let calc = codec.compute(sector);
        codec.correct(sector, read_code, &calc)
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(EccMode::strongest_fitting(64), Some(EccMode::Bch30));
        assert_eq!(EccMode::strongest_fitting(54), Some(EccMode::Bch30));
        assert_eq!(EccMode::strongest_fitting(53), Some(EccMode::Bch18));
        assert_eq!(EccMode::strongest_fitting(32), Some(EccMode::Bch18));
        assert_eq!(EccMode::strongest_fitting(16), None);
    }

    #[test]
    fn test_record_sizes() {
        let mut rng = StdRng::seed_from_u64(1);
        let sector = random_sector(&mut rng);

        for mode in [EccMode::Bch18, EccMode::Bch30, EccMode::NoEcc] {
            let codec = EccCodec::new(mode);
            assert_eq!(codec.compute(&sector).len(), mode.ecc_bytes());
            assert_eq!(codec.compute(&sector), codec.compute(&sector));
        }
    }

    #[test]
    fn test_clean_sector() {
        let mut rng = StdRng::seed_from_u64(2);
        let codec = EccCodec::new(EccMode::Bch18);
        let mut sector = random_sector(&mut rng);
        let code = codec.compute(&sector);
        assert_eq!(check(&codec, &mut sector, &code), Outcome::Ok);
    }

    #[test]
    fn test_three_flips_corrected() {
        let mut rng = StdRng::seed_from_u64(3);
        let codec = EccCodec::new(EccMode::Bch18);
        let original = random_sector(&mut rng);
        let code = codec.compute(&original);

        let mut sector = original.clone();
        flip_bits(&mut rng, &mut sector, 3);
        assert_eq!(check(&codec, &mut sector, &code), Outcome::Corrected(3));
        assert_eq!(sector, original);
    }

    #[test]
    fn test_too_many_flips_untouched() {
        let mut rng = StdRng::seed_from_u64(4);
        let codec = EccCodec::new(EccMode::Bch18);
        let original = random_sector(&mut rng);
        let code = codec.compute(&original);

        let mut sector = original.clone();
        flip_bits(&mut rng, &mut sector, 25);
        let damaged = sector.clone();
        assert_eq!(check(&codec, &mut sector, &code), Outcome::Uncorrectable);
        assert_eq!(sector, damaged);
    }

    #[test]
    fn test_bch30_full_strength() {
        let mut rng = StdRng::seed_from_u64(5);
        let codec = EccCodec::new(EccMode::Bch30);
        let original = random_sector(&mut rng);
        let code = codec.compute(&original);

        let mut sector = original.clone();
        flip_bits(&mut rng, &mut sector, 30);
        assert_eq!(check(&codec, &mut sector, &code), Outcome::Corrected(30));
        assert_eq!(sector, original);
    }

    #[test]
    fn test_errors_in_record() {
        let mut rng = StdRng::seed_from_u64(6);
        let codec = EccCodec::new(EccMode::Bch18);
        let original = random_sector(&mut rng);
        let mut code = codec.compute(&original);
        code[0] ^= 0x81;

        let mut sector = original.clone();
        flip_bits(&mut rng, &mut sector, 2);
        assert_eq!(check(&codec, &mut sector, &code), Outcome::Corrected(4));
        assert_eq!(sector, original);
    }

    #[test]
    fn test_no_ecc() {
        let codec = EccCodec::new(EccMode::NoEcc);
        let mut sector = vec![0x12u8; SECTOR_SIZE];
        assert!(codec.compute(&sector).is_empty());
        assert_eq!(codec.correct(&mut sector, &[], &[]), Outcome::Ok);
    }

    #[test]
    fn test_erased_tolerance() {
        let mut page = vec![0xFFu8; 2 * SECTOR_SIZE];
        let mut oob = vec![0xFFu8; 64];
        assert_eq!(EccCodec::erased_bitflips(&mut page, &mut oob, 2), Some(0));

        page[100] = 0xFE;
        oob[3] = 0x7F;
        assert_eq!(EccCodec::erased_bitflips(&mut page, &mut oob, 2), Some(2));
        assert!(page.is_erased());
        assert!(oob.is_erased());

        page[100] = 0xFE;
        page[1500] = 0xFE;
        oob[3] = 0x7F;
        assert!(!EccCodec::is_erased(&mut page, &mut oob, 2));
        assert_eq!(page[100], 0xFE);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn bounded_correction(
            data in prop::collection::vec(any::<u8>(), SECTOR_SIZE),
            flips in prop::collection::hash_set(0..SECTOR_SIZE * 8, 0..=18),
        ) {
            let codec = EccCodec::new(EccMode::Bch18);
            let code = codec.compute(&data);

            let mut sector = data.clone();
            for bit in &flips {
                sector[bit / 8] ^= 0x80 >> (bit % 8);
            }

            let expected = match flips.len() {
                0 => Outcome::Ok,
                n => Outcome::Corrected(n as u32),
            };
            prop_assert_eq!(check(&codec, &mut sector, &code), expected);
            prop_assert_eq!(sector, data);
        }

        #[test]
        fn failure_containment(
            data in prop::collection::vec(any::<u8>(), SECTOR_SIZE),
            flips in prop::collection::hash_set(0..SECTOR_SIZE * 8, 19..=40),
        ) {
            let codec = EccCodec::new(EccMode::Bch18);
            let code = codec.compute(&data);

            let mut sector = data.clone();
            for bit in &flips {
                sector[bit / 8] ^= 0x80 >> (bit % 8);
            }
            let damaged = sector.clone();

            prop_assert_eq!(check(&codec, &mut sector, &code), Outcome::Uncorrectable);
            prop_assert_eq!(sector, damaged);
        }
    }
}
