//! HKDF (RFC 5869), SHA-256.
//!
//! Two-step extract/expand, deterministic and cache-free:
//!   PRK = extract(salt, ikm) = HMAC-SHA256(salt, ikm)
//!   OKM = expand(PRK, info, L)
//!
//! `salt` absent is treated as a 32-byte zero block, per RFC 5869 §2.2.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoValidationError;

type HmacSha256 = Hmac<Sha256>;

const HASH_LEN: usize = 32;
const MAX_OUTPUT_LEN: usize = 255 * HASH_LEN;

/// HKDF-Extract: HMAC(salt, ikm). `salt = None` uses a 32-byte zero block.
pub fn extract(salt: Option<&[u8]>, ikm: &[u8]) -> [u8; HASH_LEN] {
    let zero_salt = [0u8; HASH_LEN];
    let salt = salt.unwrap_or(&zero_salt);

    // HMAC accepts any key length.
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts keys of any length");
    mac.update(ikm);
    let prk = mac.finalize().into_bytes();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&prk);
    out
}

/// HKDF-Expand: T(i) = HMAC(prk, T(i-1) || info || i), concatenated and
/// truncated to `length` bytes. Rejects `length == 0` or `length >
/// 255 * HashLen`.
pub fn expand(prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, CryptoValidationError> {
    if length == 0 {
        return Err(CryptoValidationError::new("HKDF expand length must be > 0"));
    }
    if length > MAX_OUTPUT_LEN {
        return Err(CryptoValidationError::new(format!(
            "HKDF expand length {length} exceeds maximum of {MAX_OUTPUT_LEN}"
        )));
    }

    let n = length.div_ceil(HASH_LEN);
    let mut okm = Vec::with_capacity(n * HASH_LEN);
    let mut t_prev: Vec<u8> = Vec::new();

    for i in 1..=n {
        let mut mac =
            HmacSha256::new_from_slice(prk).expect("HMAC accepts keys of any length");
        mac.update(&t_prev);
        mac.update(info);
        mac.update(&[i as u8]);
        let t_i = mac.finalize().into_bytes();
        okm.extend_from_slice(&t_i);
        t_prev = t_i.to_vec();
    }

    okm.truncate(length);
    Ok(okm)
}

/// One-shot extract-then-expand.
pub fn derive(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
    length: usize,
) -> Result<Vec<u8>, CryptoValidationError> {
    let prk = extract(salt, ikm);
    expand(&prk, info, length)
}
