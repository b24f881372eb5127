//! Shamir's Secret Sharing over GF(2^8).
//!
//! Uses the AES irreducible polynomial (0x11B) and generator 3. Log/anti-log
//! tables are computed once by `init()` at startup, not lazily; the
//! anti-log table is extended to 512 entries so multiplication and division
//! never need a mod-255 reduction on the exponent sum.

use std::sync::OnceLock;

use rand_core::{OsRng, RngCore};

use crate::error::VaultError;

const POLY: u16 = 0x11B;
const GENERATOR: u8 = 3;

struct GfTables {
    exp: [u8; 512],
    log: [u8; 256],
}

/// Carry-less multiply in GF(2^8) reduced by `POLY`, used only to bootstrap
/// the log/anti-log tables; the hot path uses the tables exclusively.
fn gf_mul_slow(mut a: u16, mut b: u16) -> u8 {
    let mut result: u16 = 0;
    while b != 0 {
        if b & 1 != 0 {
            result ^= a;
        }
        b >>= 1;
        a <<= 1;
        if a & 0x100 != 0 {
            a ^= POLY;
        }
    }
    result as u8
}

fn gf_tables_init() -> GfTables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut current: u8 = 1;
    for i in 0..255usize {
        exp[i] = current;
        log[current as usize] = i as u8;
        current = gf_mul_slow(current as u16, GENERATOR as u16);
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }
    GfTables { exp, log }
}

static TABLES: OnceLock<GfTables> = OnceLock::new();

fn tables() -> &'static GfTables {
    TABLES.get().expect("shamir::init() must run before any GF(2^8) arithmetic")
}

/// Computes the log/anti-log tables. Must run once at process startup
/// (`SealService::new` calls this) so `split`/`reconstruct` never pay an
/// initialization cost on the request path.
pub fn init() {
    TABLES.get_or_init(gf_tables_init);
}

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = tables();
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0, "division by zero in GF(2^8)");
    if a == 0 {
        return 0;
    }
    let t = tables();
    let shifted = t.log[a as usize] as usize + 255 - t.log[b as usize] as usize;
    t.exp[shifted]
}

/// Splits `secret` into `n` shares with threshold `m`: any `m` of the `n`
/// shares reconstruct the secret; fewer do not. Requires `2 <= m <= n <= 255`.
pub fn split(secret: &[u8], n: u8, m: u8) -> Result<Vec<(u8, Vec<u8>)>, VaultError> {
    if m < 2 {
        return Err(VaultError::validation("Shamir threshold must be >= 2"));
    }
    if m > n {
        return Err(VaultError::validation("Shamir threshold cannot exceed share count"));
    }
    // n is a u8, so n <= 255 always holds.

    let mut shares: Vec<(u8, Vec<u8>)> = (1..=n).map(|i| (i, Vec::with_capacity(secret.len()))).collect();

    for &byte in secret {
        let mut coeffs = vec![0u8; m as usize];
        coeffs[0] = byte;
        for c in coeffs.iter_mut().skip(1) {
            let mut buf = [0u8; 1];
            OsRng.fill_bytes(&mut buf);
            *c = buf[0];
        }

        for (index, out) in shares.iter_mut() {
            out.push(horner_eval(&coeffs, *index));
        }
    }

    Ok(shares)
}

fn horner_eval(coeffs: &[u8], x: u8) -> u8 {
    let mut result = 0u8;
    for &coeff in coeffs.iter().rev() {
        result = gf_mul(result, x) ^ coeff;
    }
    result
}

/// Reconstructs the original byte string from `K >= M` shares using
/// Lagrange interpolation at x = 0. Any `M`-subset of a valid `N`-share
/// split recovers the same bytes; this function does not know `M` and
/// simply interpolates whatever shares it's given.
pub fn reconstruct(shares: &[(u8, Vec<u8>)]) -> Result<Vec<u8>, VaultError> {
    if shares.len() < 2 {
        return Err(VaultError::validation("Shamir reconstruction requires at least 2 shares"));
    }
    let len = shares[0].1.len();
    if shares.iter().any(|(_, bytes)| bytes.len() != len) {
        return Err(VaultError::validation("Shamir shares have mismatched lengths"));
    }
    let indices: Vec<u8> = shares.iter().map(|(i, _)| *i).collect();
    if indices.iter().any(|&i| i == 0) {
        return Err(VaultError::validation("Shamir share index must be 1..=255"));
    }
    for (pos, &i) in indices.iter().enumerate() {
        if indices[..pos].contains(&i) {
            return Err(VaultError::validation("Shamir shares must have distinct indices"));
        }
    }

    let mut secret = vec![0u8; len];
    for byte_pos in 0..len {
        let mut acc = 0u8;
        for (i, (xi, ys)) in shares.iter().enumerate() {
            let yi = ys[byte_pos];
            let mut numerator = 1u8;
            let mut denominator = 1u8;
            for (j, (xj, _)) in shares.iter().enumerate() {
                if i == j {
                    continue;
                }
                // Evaluating at x = 0: term is xj / (xj XOR xi).
                numerator = gf_mul(numerator, *xj);
                denominator = gf_mul(denominator, xj ^ xi);
            }
            acc ^= gf_mul(yi, gf_div(numerator, denominator));
        }
        secret[byte_pos] = acc;
    }
    Ok(secret)
}

/// All k-element subsets of `items`, used by tests to exhaustively check
/// that every threshold-sized combination reconstructs the same secret.
#[cfg(test)]
fn combinations<T: Clone>(items: &[T], k: usize) -> Vec<Vec<T>> {
    if k == 0 {
        return vec![Vec::new()];
    }
    if items.is_empty() {
        return Vec::new();
    }
    let mut result = Vec::new();
    let (head, rest) = (items[0].clone(), &items[1..]);
    for mut combo in combinations(rest, k - 1) {
        combo.insert(0, head.clone());
        result.push(combo);
    }
    result.extend(combinations(rest, k));
    result
}
