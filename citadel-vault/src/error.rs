//! Error types for the vault.

use std::fmt;

use citadel_crypto::CryptoError;

/// The resource kind a `NotFound`/`AlreadyExists` error refers to, for
/// structured logging and audit detail without string-matching the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Secret,
    SecretVersion,
    TransitKey,
    Policy,
    PolicyBinding,
    RotationPolicy,
    Lease,
    Team,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Secret => "secret",
            Self::SecretVersion => "secret version",
            Self::TransitKey => "transit key",
            Self::Policy => "policy",
            Self::PolicyBinding => "policy binding",
            Self::RotationPolicy => "rotation policy",
            Self::Lease => "lease",
            Self::Team => "team",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub enum VaultError {
    NotFound { kind: ResourceKind, key: String },
    AlreadyExists { kind: ResourceKind, key: String },
    Conflict(String),
    Validation(String),
    CryptoAuth,
    MalformedEnvelope(String),
    Sealed,
    UnsealVerifyFailed(String),
    RotationFailed(String),
    NotImplemented(String),
    Internal(String),
    /// Ciphertext was wrapped under a transit key version below the key's
    /// current `minDecryptionVersion`.
    TransitVersionBelowMin { version: u32, min_decryption_version: u32 },
}

impl fmt::Display for VaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { kind, key } => write!(f, "{kind} not found: {key}"),
            Self::AlreadyExists { kind, key } => write!(f, "{kind} already exists: {key}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::CryptoAuth => write!(f, "decryption failed: authentication tag mismatch"),
            Self::MalformedEnvelope(msg) => write!(f, "malformed envelope: {msg}"),
            Self::Sealed => write!(f, "vault is sealed"),
            Self::UnsealVerifyFailed(msg) => write!(f, "unseal verification failed: {msg}"),
            Self::RotationFailed(msg) => write!(f, "rotation failed: {msg}"),
            Self::NotImplemented(msg) => write!(f, "not implemented: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
            Self::TransitVersionBelowMin { version, min_decryption_version } => write!(
                f,
                "transit key version {version} is below minDecryptionVersion {min_decryption_version}"
            ),
        }
    }
}

impl std::error::Error for VaultError {}

impl VaultError {
    pub fn not_found(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self::NotFound { kind, key: key.into() }
    }

    pub fn already_exists(kind: ResourceKind, key: impl Into<String>) -> Self {
        Self::AlreadyExists { kind, key: key.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// The error kind name used in audit entries and logs, stable across
    /// message text changes.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::Conflict(_) => "Conflict",
            Self::Validation(_) => "Validation",
            Self::CryptoAuth => "CryptoAuth",
            Self::MalformedEnvelope(_) => "MalformedEnvelope",
            Self::Sealed => "Sealed",
            Self::UnsealVerifyFailed(_) => "UnsealVerifyFailed",
            Self::RotationFailed(_) => "RotationFailed",
            Self::NotImplemented(_) => "NotImplemented",
            Self::Internal(_) => "Internal",
            Self::TransitVersionBelowMin { .. } => "TransitVersionBelowMin",
        }
    }
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Auth(_) => Self::CryptoAuth,
            CryptoError::Malformed(inner) => Self::MalformedEnvelope(inner.0),
            CryptoError::Validation(inner) => Self::Validation(inner.0),
            CryptoError::Rng => Self::Internal("secure random generation failed".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Specific operation errors (type-safe, mirrors the teacher's per-op wrappers)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SealError(pub VaultError);
impl fmt::Display for SealError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for SealError {}
impl From<VaultError> for SealError {
    fn from(e: VaultError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct SecretError(pub VaultError);
impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for SecretError {}
impl From<VaultError> for SecretError {
    fn from(e: VaultError) -> Self { Self(e) }
}
impl From<CryptoError> for SecretError {
    fn from(e: CryptoError) -> Self { Self(VaultError::from(e)) }
}

#[derive(Debug)]
pub struct TransitError(pub VaultError);
impl fmt::Display for TransitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for TransitError {}
impl From<VaultError> for TransitError {
    fn from(e: VaultError) -> Self { Self(e) }
}
impl From<CryptoError> for TransitError {
    fn from(e: CryptoError) -> Self { Self(VaultError::from(e)) }
}

#[derive(Debug)]
pub struct PolicyError(pub VaultError);
impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for PolicyError {}
impl From<VaultError> for PolicyError {
    fn from(e: VaultError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct RotationError(pub VaultError);
impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for RotationError {}
impl From<VaultError> for RotationError {
    fn from(e: VaultError) -> Self { Self(e) }
}

#[derive(Debug)]
pub struct LeaseError(pub VaultError);
impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}
impl std::error::Error for LeaseError {}
impl From<VaultError> for LeaseError {
    fn from(e: VaultError) -> Self { Self(e) }
}
impl From<CryptoError> for LeaseError {
    fn from(e: CryptoError) -> Self { Self(VaultError::from(e)) }
}
