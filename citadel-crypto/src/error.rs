//! Error types for the envelope crypto core.

use core::fmt;

/// GCM tag mismatch: wrong key, or tampered ciphertext. Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoAuthError;

impl fmt::Display for CryptoAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decryption failed: authentication tag mismatch")
    }
}

impl std::error::Error for CryptoAuthError {}

/// Structural decode failure: bad version byte, out-of-range lengths,
/// truncated envelope, malformed transit keyId, and similar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEnvelopeError(pub String);

impl fmt::Display for MalformedEnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed envelope: {}", self.0)
    }
}

impl std::error::Error for MalformedEnvelopeError {}

impl MalformedEnvelopeError {
    pub fn new(msg: impl Into<String>) -> Self {
        MalformedEnvelopeError(msg.into())
    }
}

/// Bad input to a crypto primitive: out-of-range HKDF length, an unusable
/// Shamir threshold, a zero-length random string request, and similar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoValidationError(pub String);

impl fmt::Display for CryptoValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CryptoValidationError {}

impl CryptoValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        CryptoValidationError(msg.into())
    }
}

/// Unified error surface for the `citadel-crypto` crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    Auth(CryptoAuthError),
    Malformed(MalformedEnvelopeError),
    Validation(CryptoValidationError),
    /// RNG or system entropy source failure. Always fatal to the caller.
    Rng,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::Auth(e) => write!(f, "{e}"),
            CryptoError::Malformed(e) => write!(f, "{e}"),
            CryptoError::Validation(e) => write!(f, "{e}"),
            CryptoError::Rng => write!(f, "secure random number generation failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<CryptoAuthError> for CryptoError {
    fn from(e: CryptoAuthError) -> Self {
        CryptoError::Auth(e)
    }
}

impl From<MalformedEnvelopeError> for CryptoError {
    fn from(e: MalformedEnvelopeError) -> Self {
        CryptoError::Malformed(e)
    }
}

impl From<CryptoValidationError> for CryptoError {
    fn from(e: CryptoValidationError) -> Self {
        CryptoError::Validation(e)
    }
}
