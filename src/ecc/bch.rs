//! Binary BCH code over GF(2^14), shortened to one sector.
//!
//! Codeword layout (as a polynomial): the sector's bits, first byte MSB first, occupy the
//! highest degrees; the parity (remainder of `data * x^deg` by the generator) occupies degrees
//! `deg-1..=0`. Parity is stored MSB-first, so stored bit `p` holds the coefficient of
//! `x^(deg-1-p)`; stored bits beyond `deg` are padding and kept at 1.

/// GF(2^14) primitive polynomial: x^14 + x^5 + x^3 + x + 1
const GF_M: u32 = 14;
const GF_PRIM_POLY: u32 = 0x402B;

/// Log/antilog tables for GF(2^m)
#[derive(Debug, Clone)]
struct GaloisField {
    /// Multiplicative group order, 2^m - 1
    n: usize,
    /// alpha^i, for i in 0..2n
    exp: Vec<u16>,
    /// log_alpha(x), for x in 1..=n
    log: Vec<u16>,
}

impl GaloisField {
    fn new(m: u32, prim_poly: u32) -> Self {
        let n = (1usize << m) - 1;
        let mut exp = vec![0u16; 2 * n];
        let mut log = vec![0u16; n + 1];

        let mut x: u32 = 1;
        for i in 0..n {
            exp[i] = x as u16;
            log[x as usize] = i as u16;
            x <<= 1;
            if x & (1 << m) != 0 {
                x ^= prim_poly;
            }
        }
        for i in n..2 * n {
            exp[i] = exp[i - n];
        }

        Self { n, exp, log }
    }

    fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
    }

    fn div(&self, a: u16, b: u16) -> u16 {
        debug_assert_ne!(b, 0);
        if a == 0 {
            return 0;
        }
        self.exp[self.log[a as usize] as usize + self.n - self.log[b as usize] as usize]
    }

    /// alpha^e, for any non-negative exponent
    fn alpha_pow(&self, e: usize) -> u16 {
        self.exp[e % self.n]
    }
}

/// A t-error-correcting binary BCH code for fixed-size data blocks
#[derive(Debug, Clone)]
pub(crate) struct Bch {
    gf: GaloisField,
    t: usize,
    /// Degree of the generator polynomial, i.e. number of parity bits
    deg: usize,
    /// Generator polynomial without its x^deg term, as little-endian bit limbs
    gen: Vec<u64>,
}

impl Bch {
    /// Build the code correcting `t` bit errors
    pub(crate) fn new(t: usize) -> Self {
        let gf = GaloisField::new(GF_M, GF_PRIM_POLY);

        // The roots of the generator are the union of the cyclotomic cosets of the odd
        // powers alpha^1, alpha^3, ..., alpha^(2t-1).
        let mut is_root = vec![false; gf.n];
        for i in (1..2 * t).step_by(2) {
            let mut r = i % gf.n;
            while !is_root[r] {
                is_root[r] = true;
                r = (r * 2) % gf.n;
            }
        }

        // g(x) = product of (x - alpha^r) over all roots; coefficients end up in GF(2).
        let mut poly: Vec<u16> = vec![1];
        for r in (0..gf.n).filter(|&r| is_root[r]) {
            let root = gf.alpha_pow(r);
            let mut next = vec![0u16; poly.len() + 1];
            for (i, &c) in poly.iter().enumerate() {
                next[i + 1] ^= c;
                next[i] ^= gf.mul(c, root);
            }
            poly = next;
        }

        let deg = poly.len() - 1;
        let mut gen = vec![0u64; deg.div_ceil(64)];
        for (j, &c) in poly[..deg].iter().enumerate() {
            debug_assert!(c <= 1, "generator coefficient outside GF(2)");
            if c != 0 {
                gen[j / 64] |= 1 << (j % 64);
            }
        }

        Self { gf, t, deg, gen }
    }

    /// Number of parity bits
    pub(crate) fn parity_bits(&self) -> usize {
        self.deg
    }

    /// Compute the parity of `data` into `code` (which must hold at least `parity_bits` bits)
    pub(crate) fn encode(&self, data: &[u8], code: &mut [u8]) {
        let rem = self.remainder(data);

        code.fill(0xFF);
        for p in 0..self.deg {
            let j = self.deg - 1 - p;
            if (rem[j / 64] >> (j % 64)) & 1 == 0 {
                code[p / 8] &= !(0x80 >> (p % 8));
            }
        }
    }

    /// Correct `data` given the code read from the medium and the code recomputed from `data`
    ///
    /// Returns the number of bit errors found (in the data or the stored code), or `None` if the
    /// errors are beyond the code's strength, in which case `data` is untouched.
    pub(crate) fn decode(
        &self,
        data: &mut [u8],
        read_code: &[u8],
        calc_code: &[u8],
    ) -> Option<u32> {
        let diff = self
            .unpack(read_code)
            .into_iter()
            .zip(self.unpack(calc_code))
            .map(|(a, b)| a ^ b)
            .collect::<Vec<_>>();
        if diff.iter().all(|&x| x == 0) {
            return Some(0);
        }

        let syndromes = self.syndromes(&diff);
        if syndromes.iter().all(|&s| s == 0) {
            return Some(0);
        }

        let lambda = self.berlekamp_massey(&syndromes);
        let errors = lambda.len() - 1;
        if errors > self.t {
            return None;
        }

        let data_bits = data.len() * 8;
        let roots = self.chien_search(&lambda, self.deg + data_bits);
        if roots.len() != errors {
            return None;
        }

        for e in roots.into_iter().filter(|&e| e >= self.deg) {
            let k = data_bits - 1 - (e - self.deg);
            data[k / 8] ^= 0x80 >> (k % 8);
        }

        Some(errors as u32)
    }

    /// Compute `data * x^deg mod g`, processing bits highest-degree first
    fn remainder(&self, data: &[u8]) -> Vec<u64> {
        let limbs = self.gen.len();
        let top = self.deg - 1;
        let top_mask = match self.deg % 64 {
            0 => u64::MAX,
            bits => (1u64 << bits) - 1,
        };

        let mut rem = vec![0u64; limbs];
        for &byte in data {
            for shift in (0..8).rev() {
                let bit = (byte >> shift) & 1 == 1;
                let feedback = bit ^ ((rem[top / 64] >> (top % 64)) & 1 == 1);

                let mut carry = 0;
                for limb in rem.iter_mut() {
                    let next = *limb >> 63;
                    *limb = (*limb << 1) | carry;
                    carry = next;
                }
                rem[limbs - 1] &= top_mask;

                if feedback {
                    for (limb, g) in rem.iter_mut().zip(&self.gen) {
                        *limb ^= g;
                    }
                }
            }
        }

        rem
    }

    /// Convert a stored code back into coefficient limbs, ignoring padding bits
    fn unpack(&self, code: &[u8]) -> Vec<u64> {
        let mut limbs = vec![0u64; self.gen.len()];
        for p in 0..self.deg {
            if code[p / 8] & (0x80 >> (p % 8)) != 0 {
                let j = self.deg - 1 - p;
                limbs[j / 64] |= 1 << (j % 64);
            }
        }
        limbs
    }

    /// S_i = r(alpha^i) for i in 1..=2t, where r is congruent to the received word mod g
    fn syndromes(&self, diff: &[u64]) -> Vec<u16> {
        let mut syndromes = vec![0u16; 2 * self.t];
        for j in (0..self.deg).filter(|&j| (diff[j / 64] >> (j % 64)) & 1 != 0) {
            for (i, s) in syndromes.iter_mut().enumerate() {
                *s ^= self.gf.alpha_pow((i + 1) * j);
            }
        }
        syndromes
    }

    /// Find the error locator polynomial Lambda(x), lowest degree first
    fn berlekamp_massey(&self, syndromes: &[u16]) -> Vec<u16> {
        let gf = &self.gf;
        let len = syndromes.len() + 1;

        let mut c = vec![0u16; len];
        c[0] = 1;
        let mut b = c.clone();
        let mut l = 0usize;
        let mut m = 1usize;
        let mut last_d: u16 = 1;

        for n in 0..syndromes.len() {
            let mut d = syndromes[n];
            for i in 1..=l {
                d ^= gf.mul(c[i], syndromes[n - i]);
            }

            if d == 0 {
                m += 1;
                continue;
            }

            let coef = gf.div(d, last_d);
            let prev = c.clone();
            for i in 0..len.saturating_sub(m) {
                c[i + m] ^= gf.mul(coef, b[i]);
            }

            if 2 * l <= n {
                l = n + 1 - l;
                b = prev;
                last_d = d;
                m = 1;
            } else {
                m += 1;
            }
        }

        c.truncate(l + 1);
        c
    }

    /// Find the codeword degrees `e` with Lambda(alpha^-e) == 0, for `e` in `0..length`
    fn chien_search(&self, lambda: &[u16], length: usize) -> Vec<usize> {
        let gf = &self.gf;
        let wanted = lambda.len() - 1;
        let logs: Vec<Option<usize>> = lambda
            .iter()
            .map(|&c| (c != 0).then(|| gf.log[c as usize] as usize))
            .collect();

        let mut roots = Vec::with_capacity(wanted);
        for e in 0..length {
            let mut sum = 0u16;
            for (i, log) in logs.iter().enumerate() {
                if let Some(log) = log {
                    sum ^= gf.alpha_pow(log + gf.n - (e * i) % gf.n);
                }
            }

            if sum == 0 {
                roots.push(e);
                if roots.len() == wanted {
                    break;
                }
            }
        }

        roots
    }
}
