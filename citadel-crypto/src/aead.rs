//! AEAD: AES-256-GCM

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use getrandom::getrandom;

use crate::error::CryptoError;

/// Generate a random 12-byte nonce/IV.
pub fn random_nonce() -> Result<[u8; 12], CryptoError> {
    let mut n = [0u8; 12];
    getrandom(&mut n).map_err(|_| CryptoError::Rng)?;
    Ok(n)
}

/// Generate `n` random bytes from the process CSPRNG.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut out = vec![0u8; n];
    getrandom(&mut out).map_err(|_| CryptoError::Rng)?;
    Ok(out)
}

/// AEAD seal (encrypt path). `aad` is bound but not encrypted.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::Validation(crate::error::CryptoValidationError::new("invalid AES-256 key length")))?;
    let n = Nonce::from_slice(nonce);
    let payload = Payload { msg: plaintext, aad };
    cipher
        .encrypt(n, payload)
        .map_err(|_| CryptoError::Validation(crate::error::CryptoValidationError::new("AEAD seal failed")))
}

/// AEAD open (decrypt path). Tag mismatch or tamper surfaces as `CryptoAuthError`.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::Validation(crate::error::CryptoValidationError::new("invalid AES-256 key length")))?;
    let n = Nonce::from_slice(nonce);
    let payload = Payload { msg: ciphertext, aad };
    cipher
        .decrypt(n, payload)
        .map_err(|_| CryptoError::Auth(crate::error::CryptoAuthError))
}
