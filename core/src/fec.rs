//! Reed-Solomon error correction over GF(2^8)
//!
//! Systematic code with primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
//! (0x11D), generator 2 and first consecutive root 0. Polynomials are stored
//! highest degree first, matching byte order in the codeword. The decoder
//! corrects any mix of `e` errors and `f` erasures with `2e + f <= nsym`.

use crate::error::{ModemError, Result};
use crate::{RS_DATA_BYTES, RS_ECC_BYTES, RS_TOTAL_BYTES};

const PRIM_POLY: u16 = 0x11D;
const GF_ORDER: usize = 255;

/// Exponential table, doubled so products of two logs need no reduction
static GF_EXP: [u8; 512] = {
    let mut t = [0u8; 512];
    let mut v: u16 = 1;
    let mut i = 0;
    while i < 512 {
        t[i] = v as u8;
        v <<= 1;
        if v & 0x100 != 0 {
            v ^= PRIM_POLY;
        }
        i += 1;
    }
    t
};

/// Logarithm table; `GF_LOG[0]` is unused
static GF_LOG: [u8; 256] = {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < GF_ORDER {
        t[GF_EXP[i] as usize] = i as u8;
        i += 1;
    }
    t
};

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF_EXP[GF_LOG[a as usize] as usize + GF_LOG[b as usize] as usize]
}

fn gf_div(a: u8, b: u8) -> Result<u8> {
    if b == 0 {
        return Err(ModemError::EccUnrecoverable("division by zero in GF(256)"));
    }
    if a == 0 {
        return Ok(0);
    }
    Ok(GF_EXP[(GF_LOG[a as usize] as usize + GF_ORDER - GF_LOG[b as usize] as usize) % GF_ORDER])
}

/// `alpha^power`
fn gf_alpha(power: usize) -> u8 {
    GF_EXP[power % GF_ORDER]
}

fn gf_inverse(a: u8) -> u8 {
    GF_EXP[GF_ORDER - GF_LOG[a as usize] as usize]
}

fn poly_scale(p: &[u8], x: u8) -> Vec<u8> {
    p.iter().map(|&c| gf_mul(c, x)).collect()
}

/// Sum of two polynomials, aligned on their constant terms
fn poly_add(p: &[u8], q: &[u8]) -> Vec<u8> {
    let len = p.len().max(q.len());
    let mut r = vec![0u8; len];
    for (i, &c) in p.iter().enumerate() {
        r[i + len - p.len()] = c;
    }
    for (i, &c) in q.iter().enumerate() {
        r[i + len - q.len()] ^= c;
    }
    r
}

fn poly_mul(p: &[u8], q: &[u8]) -> Vec<u8> {
    if p.is_empty() || q.is_empty() {
        return Vec::new();
    }
    let mut r = vec![0u8; p.len() + q.len() - 1];
    for (j, &qj) in q.iter().enumerate() {
        for (i, &pi) in p.iter().enumerate() {
            r[i + j] ^= gf_mul(pi, qj);
        }
    }
    r
}

/// Horner evaluation
fn poly_eval(p: &[u8], x: u8) -> u8 {
    p.iter().fold(0u8, |acc, &c| gf_mul(acc, x) ^ c)
}

/// `g(x) = (x - alpha^0)(x - alpha^1)..(x - alpha^(nsym-1))`
fn generator_poly(nsym: usize) -> Vec<u8> {
    (0..nsym).fold(vec![1u8], |g, i| poly_mul(&g, &[1, gf_alpha(i)]))
}

/// Reed-Solomon codec for codewords of up to 255 bytes with `nsym` parity bytes.
#[derive(Debug, Clone)]
pub struct ReedSolomon {
    nsym: usize,
    generator: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(nsym: usize) -> Result<Self> {
        if nsym == 0 || nsym >= GF_ORDER {
            return Err(ModemError::InvalidConfig(format!(
                "Reed-Solomon parity length {} out of range",
                nsym
            )));
        }
        Ok(Self::build(nsym))
    }

    fn build(nsym: usize) -> Self {
        Self {
            nsym,
            generator: generator_poly(nsym),
        }
    }

    /// Append `nsym` parity bytes to `msg`.
    pub fn encode(&self, msg: &[u8]) -> Result<Vec<u8>> {
        if msg.len() + self.nsym > GF_ORDER {
            return Err(ModemError::InvalidInputSize);
        }

        let mut out = msg.to_vec();
        out.resize(msg.len() + self.nsym, 0);
        for i in 0..msg.len() {
            let coef = out[i];
            if coef != 0 {
                for (j, &g) in self.generator.iter().enumerate().skip(1) {
                    out[i + j] ^= gf_mul(g, coef);
                }
            }
        }
        out[..msg.len()].copy_from_slice(msg);
        Ok(out)
    }

    /// Syndromes with a leading zero, so index `i + 1` holds `r(alpha^i)`
    fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        let mut synd = Vec::with_capacity(self.nsym + 1);
        synd.push(0);
        synd.extend((0..self.nsym).map(|i| poly_eval(codeword, gf_alpha(i))));
        synd
    }

    /// True if `codeword` has no detectable errors.
    pub fn check(&self, codeword: &[u8]) -> bool {
        self.syndromes(codeword).iter().all(|&s| s == 0)
    }

    /// Correct `codeword` and return its message part.
    ///
    /// `erasures` lists byte positions known to be unreliable.
    pub fn decode(&self, codeword: &[u8], erasures: &[usize]) -> Result<Vec<u8>> {
        let n = codeword.len();
        if n > GF_ORDER || n <= self.nsym {
            return Err(ModemError::InvalidInputSize);
        }
        if erasures.len() > self.nsym {
            return Err(ModemError::EccUnrecoverable("too many erasures"));
        }
        if erasures.iter().any(|&p| p >= n) {
            return Err(ModemError::InvalidInputSize);
        }

        let mut msg = codeword.to_vec();
        for &p in erasures {
            msg[p] = 0;
        }

        let synd = self.syndromes(&msg);
        if synd.iter().all(|&s| s == 0) {
            msg.truncate(n - self.nsym);
            return Ok(msg);
        }

        let fsynd = forney_syndromes(&synd, erasures, n);
        let err_loc = self.error_locator(&fsynd, erasures.len())?;
        let rev: Vec<u8> = err_loc.iter().rev().copied().collect();
        let errors = find_errors(&rev, n)?;

        let mut positions = erasures.to_vec();
        positions.extend(errors);
        correct_errata(&mut msg, &synd, &positions)?;

        if !self.check(&msg) {
            return Err(ModemError::EccUnrecoverable("could not correct message"));
        }
        msg.truncate(n - self.nsym);
        Ok(msg)
    }

    /// Berlekamp-Massey over the erasure-free syndromes
    fn error_locator(&self, synd: &[u8], erase_count: usize) -> Result<Vec<u8>> {
        let mut err_loc = vec![1u8];
        let mut old_loc = vec![1u8];
        let shift = synd.len().saturating_sub(self.nsym);

        for i in 0..self.nsym - erase_count {
            let k = i + shift;
            let mut delta = synd[k];
            for j in 1..err_loc.len().min(k + 1) {
                delta ^= gf_mul(err_loc[err_loc.len() - 1 - j], synd[k - j]);
            }

            old_loc.push(0);
            if delta != 0 {
                if old_loc.len() > err_loc.len() {
                    let new_loc = poly_scale(&old_loc, delta);
                    old_loc = poly_scale(&err_loc, gf_inverse(delta));
                    err_loc = new_loc;
                }
                err_loc = poly_add(&err_loc, &poly_scale(&old_loc, delta));
            }
        }

        let leading = err_loc.iter().take_while(|&&c| c == 0).count();
        err_loc.drain(..leading);
        if err_loc.is_empty() {
            return Err(ModemError::EccUnrecoverable("degenerate error locator"));
        }

        let errors = err_loc.len() - 1;
        if errors * 2 + erase_count > self.nsym {
            return Err(ModemError::EccUnrecoverable("too many errors to correct"));
        }
        Ok(err_loc)
    }
}

/// Syndromes with the erasure contributions removed
fn forney_syndromes(synd: &[u8], erasures: &[usize], n: usize) -> Vec<u8> {
    let mut fsynd = synd[1..].to_vec();
    for &p in erasures {
        let x = gf_alpha(n - 1 - p);
        for j in 0..fsynd.len().saturating_sub(1) {
            fsynd[j] = gf_mul(fsynd[j], x) ^ fsynd[j + 1];
        }
    }
    fsynd
}

/// Chien search on the reversed locator polynomial
fn find_errors(err_loc: &[u8], n: usize) -> Result<Vec<usize>> {
    let count = err_loc.len() - 1;
    let positions: Vec<usize> = (0..n)
        .filter(|&i| poly_eval(err_loc, gf_alpha(i)) == 0)
        .map(|i| n - 1 - i)
        .collect();
    if positions.len() != count {
        return Err(ModemError::EccUnrecoverable("error locator roots do not match error count"));
    }
    Ok(positions)
}

/// Forney algorithm: compute and apply the magnitudes at `positions`
fn correct_errata(msg: &mut [u8], synd: &[u8], positions: &[usize]) -> Result<()> {
    let n = msg.len();
    let coef_pos: Vec<usize> = positions.iter().map(|&p| n - 1 - p).collect();

    let err_loc = coef_pos
        .iter()
        .fold(vec![1u8], |loc, &i| poly_mul(&loc, &[gf_alpha(i), 1]));

    let synd_rev: Vec<u8> = synd.iter().rev().copied().collect();
    let product = poly_mul(&synd_rev, &err_loc);
    let err_eval = &product[product.len().saturating_sub(err_loc.len())..];

    let x: Vec<u8> = coef_pos.iter().map(|&c| gf_alpha(c)).collect();
    for (i, &xi) in x.iter().enumerate() {
        let xi_inv = gf_inverse(xi);
        let err_loc_prime = x
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .fold(1u8, |acc, (_, &xj)| gf_mul(acc, 1 ^ gf_mul(xi_inv, xj)));

        let y = gf_mul(xi, poly_eval(err_eval, xi_inv));
        msg[positions[i]] ^= gf_div(y, err_loc_prime)?;
    }
    Ok(())
}

/// Encodes 223-byte blocks into 255-byte codewords.
pub struct FecEncoder {
    rs: ReedSolomon,
}

/// Decodes 255-byte codewords, correcting up to 16 byte errors.
pub struct FecDecoder {
    rs: ReedSolomon,
}

impl FecEncoder {
    pub fn new() -> Self {
        Self {
            rs: ReedSolomon::build(RS_ECC_BYTES),
        }
    }

    /// Encode up to RS_DATA_BYTES of data, zero-padded, into RS_TOTAL_BYTES
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() > RS_DATA_BYTES {
            return Err(ModemError::InvalidInputSize);
        }
        let mut block = data.to_vec();
        block.resize(RS_DATA_BYTES, 0);
        self.rs.encode(&block)
    }
}

impl FecDecoder {
    pub fn new() -> Self {
        Self {
            rs: ReedSolomon::build(RS_ECC_BYTES),
        }
    }

    /// Decode RS_TOTAL_BYTES and return the RS_DATA_BYTES message
    pub fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        self.decode_with_erasures(encoded, &[])
    }

    /// Decode with known-bad byte positions, which cost half as much
    /// correction capacity as unknown errors.
    pub fn decode_with_erasures(&self, encoded: &[u8], erasures: &[usize]) -> Result<Vec<u8>> {
        if encoded.len() != RS_TOTAL_BYTES {
            return Err(ModemError::InvalidInputSize);
        }
        self.rs.decode(encoded, erasures)
    }
}

impl Default for FecEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for FecDecoder {
    fn default() -> Self {
        Self::new()
    }
}
