//! Core domain types: secrets, transit keys, policies, rotation and leases.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generates a short random hex id, used for bindings, policies, and leases
/// that don't have a natural business key.
pub fn random_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretType {
    Static,
    Dynamic,
    Reference,
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => write!(f, "STATIC"),
            Self::Dynamic => write!(f, "DYNAMIC"),
            Self::Reference => write!(f, "REFERENCE"),
        }
    }
}

/// Identified by (teamId, path). Path is unique per team.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Secret {
    pub team_id: String,
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    pub secret_type: SecretType,
    pub current_version: u32,
    pub max_versions: Option<u32>,
    pub retention_days: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub owner_user_id: String,
    pub reference_arn: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn key(team_id: &str, path: &str) -> String {
        format!("{team_id}:{path}")
    }

    pub fn id(&self) -> String {
        Self::key(&self.team_id, &self.path)
    }

    /// Splits a secret id back into `(teamId, path)`. Team ids are assumed
    /// not to contain `:`.
    pub fn split_id(id: &str) -> Option<(&str, &str)> {
        id.split_once(':')
    }
}

/// Child of exactly one Secret. (secret, versionNumber) unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecretVersion {
    pub secret_id: String,
    pub version_number: u32,
    pub encrypted_value: String,
    pub encryption_key_id: String,
    pub change_description: Option<String>,
    pub created_by_user_id: String,
    pub is_destroyed: bool,
    pub created_at: DateTime<Utc>,
}

/// The fixed sentinel written over `encrypted_value` once a version is destroyed.
pub const DESTROYED_SENTINEL: &str = "DESTROYED";

/// (secret, key) -> value, replaced wholesale.
pub type SecretMetadata = std::collections::HashMap<String, String>;

// ---------------------------------------------------------------------------
// TransitKey
// ---------------------------------------------------------------------------

/// One entry in a transit key's material list: a version and its raw 32-byte key.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransitKeyMaterialEntry {
    pub version: u32,
    pub key_base64: String,
}

impl fmt::Debug for TransitKeyMaterialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitKeyMaterialEntry")
            .field("version", &self.version)
            .field("key_base64", &"<redacted>")
            .finish()
    }
}

/// Identified by (teamId, name). `key_material` is the envelope-encrypted
/// JSON encoding of `Vec<TransitKeyMaterialEntry>`; plaintext key bytes
/// never leave the process that decrypts it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitKey {
    pub team_id: String,
    pub name: String,
    pub current_version: u32,
    pub min_decryption_version: u32,
    pub key_material: String,
    pub algorithm: String,
    pub is_deletable: bool,
    pub is_exportable: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransitKey {
    pub fn key(team_id: &str, name: &str) -> String {
        format!("{team_id}:{name}")
    }

    pub fn id(&self) -> String {
        Self::key(&self.team_id, &self.name)
    }
}

// ---------------------------------------------------------------------------
// AccessPolicy / PolicyBinding
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    List,
    Delete,
    Rotate,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::List => "LIST",
            Self::Delete => "DELETE",
            Self::Rotate => "ROTATE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Ok(Self::Read),
            "WRITE" => Ok(Self::Write),
            "LIST" => Ok(Self::List),
            "DELETE" => Ok(Self::Delete),
            "ROTATE" => Ok(Self::Rotate),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Canonicalizes a set of permissions into a sorted, comma-separated string
/// for wire storage.
pub fn permissions_to_string(perms: &BTreeSet<Permission>) -> String {
    perms.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

pub fn permissions_from_string(s: &str) -> Result<BTreeSet<Permission>, String> {
    if s.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    s.split(',').map(|p| p.parse()).collect()
}

/// (teamId, name) unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub path_pattern: String,
    pub permissions: BTreeSet<Permission>,
    pub is_deny_policy: bool,
    pub is_active: bool,
    pub created_by_user_id: String,
    pub created_at: DateTime<Utc>,
}

impl AccessPolicy {
    pub fn key(team_id: &str, name: &str) -> String {
        format!("{team_id}:{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingType {
    User,
    Team,
    Service,
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "USER"),
            Self::Team => write!(f, "TEAM"),
            Self::Service => write!(f, "SERVICE"),
        }
    }
}

/// Child of AccessPolicy. (policy, bindingType, bindingTargetId) unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub id: String,
    pub policy_id: String,
    pub binding_type: BindingType,
    pub binding_target_id: String,
    pub created_at: DateTime<Utc>,
}

impl PolicyBinding {
    pub fn dedupe_key(policy_id: &str, binding_type: BindingType, target: &str) -> String {
        format!("{policy_id}:{binding_type}:{target}")
    }
}

// ---------------------------------------------------------------------------
// RotationPolicy / RotationHistory
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationStrategy {
    RandomGenerate,
    ExternalApi,
    CustomScript,
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RandomGenerate => write!(f, "RANDOM_GENERATE"),
            Self::ExternalApi => write!(f, "EXTERNAL_API"),
            Self::CustomScript => write!(f, "CUSTOM_SCRIPT"),
        }
    }
}

/// One per Secret (optional).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub secret_id: String,
    pub strategy: RotationStrategy,
    pub rotation_interval_hours: u32,
    pub random_length: Option<u32>,
    pub random_charset: Option<String>,
    pub external_api_url: Option<String>,
    pub external_api_headers_json: Option<String>,
    pub script_command: Option<String>,
    pub is_active: bool,
    pub failure_count: u32,
    pub max_failures: u32,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub next_rotation_at: DateTime<Utc>,
}

/// Append-only audit of rotation attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RotationHistory {
    pub id: String,
    pub secret_id: String,
    pub path_snapshot: String,
    pub strategy: RotationStrategy,
    pub previous_version: u32,
    pub new_version: Option<u32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub triggered_by_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DynamicLease
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseStatus {
    Active,
    Expired,
    Revoked,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// Identified by a human-recognisable leaseId ("lease-<uuid>").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DynamicLease {
    pub lease_id: String,
    pub secret_id: String,
    pub secret_path: String,
    pub backend_type: String,
    pub encrypted_credentials: String,
    pub status: LeaseStatus,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by_user_id: Option<String>,
    pub requested_by_user_id: String,
    /// Unencrypted lease annotations (host, port, database, username,
    /// backendType). Never contains the password.
    pub metadata_json: String,
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub team_id: Option<String>,
    pub user_id: Option<String>,
    pub operation: String,
    pub path: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub ip_address: String,
    pub correlation_id: String,
    pub details_json: String,
    pub created_at: DateTime<Utc>,
    /// Monotonic sequence within the integrity chain, set by
    /// [`crate::audit::IntegrityChainAudit`]. Zero when unset.
    pub sequence: u64,
    /// SHA-256 of the previous entry in the chain, hex-encoded.
    pub prev_hash: String,
}
