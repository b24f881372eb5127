//! Storage backends: where secrets, transit keys, policies, and leases live.
//!
//! Each entity gets its own narrow repository trait so a production
//! deployment can back some entities with a database and others (e.g.
//! rotation history) with an append-only log, without one god-trait.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::error::{ResourceKind, VaultError};
use crate::types::{
    AccessPolicy, DynamicLease, PolicyBinding, RotationHistory, RotationPolicy, Secret,
    SecretMetadata, SecretVersion, TransitKey,
};

// ---------------------------------------------------------------------------
// Repository traits
// ---------------------------------------------------------------------------

pub trait SecretRepository: Send + Sync {
    fn get(&self, team_id: &str, path: &str) -> Result<Option<Secret>, VaultError>;
    fn put(&self, secret: &Secret) -> Result<(), VaultError>;
    fn delete(&self, team_id: &str, path: &str) -> Result<(), VaultError>;
    fn list_by_team(&self, team_id: &str) -> Result<Vec<Secret>, VaultError>;
    fn list_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Secret>, VaultError>;
}

pub trait SecretVersionRepository: Send + Sync {
    fn get(&self, secret_id: &str, version: u32) -> Result<Option<SecretVersion>, VaultError>;
    fn put(&self, version: &SecretVersion) -> Result<(), VaultError>;
    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<SecretVersion>, VaultError>;
    fn delete_by_secret(&self, secret_id: &str) -> Result<(), VaultError>;
}

pub trait SecretMetadataRepository: Send + Sync {
    fn get(&self, secret_id: &str) -> Result<SecretMetadata, VaultError>;
    fn put(&self, secret_id: &str, metadata: SecretMetadata) -> Result<(), VaultError>;
    fn delete(&self, secret_id: &str) -> Result<(), VaultError>;
}

pub trait TransitKeyRepository: Send + Sync {
    fn get(&self, team_id: &str, name: &str) -> Result<Option<TransitKey>, VaultError>;
    fn put(&self, key: &TransitKey) -> Result<(), VaultError>;
    fn delete(&self, team_id: &str, name: &str) -> Result<(), VaultError>;
    fn list_by_team(&self, team_id: &str) -> Result<Vec<TransitKey>, VaultError>;
}

pub trait PolicyRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<AccessPolicy>, VaultError>;
    fn get_by_name(&self, team_id: &str, name: &str) -> Result<Option<AccessPolicy>, VaultError>;
    fn put(&self, policy: &AccessPolicy) -> Result<(), VaultError>;
    fn delete(&self, id: &str) -> Result<(), VaultError>;
    fn list_by_team(&self, team_id: &str) -> Result<Vec<AccessPolicy>, VaultError>;
}

pub trait PolicyBindingRepository: Send + Sync {
    fn put(&self, binding: &PolicyBinding) -> Result<(), VaultError>;
    fn delete(&self, id: &str) -> Result<(), VaultError>;
    fn list_by_policy(&self, policy_id: &str) -> Result<Vec<PolicyBinding>, VaultError>;
    fn delete_by_policy(&self, policy_id: &str) -> Result<(), VaultError>;
}

pub trait RotationPolicyRepository: Send + Sync {
    fn get(&self, secret_id: &str) -> Result<Option<RotationPolicy>, VaultError>;
    fn put(&self, policy: &RotationPolicy) -> Result<(), VaultError>;
    fn delete(&self, secret_id: &str) -> Result<(), VaultError>;
    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RotationPolicy>, VaultError>;
}

pub trait RotationHistoryRepository: Send + Sync {
    fn append(&self, entry: &RotationHistory) -> Result<(), VaultError>;
    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<RotationHistory>, VaultError>;
}

pub trait LeaseRepository: Send + Sync {
    fn get(&self, lease_id: &str) -> Result<Option<DynamicLease>, VaultError>;
    fn put(&self, lease: &DynamicLease) -> Result<(), VaultError>;
    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<DynamicLease>, VaultError>;
    fn list_active_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<DynamicLease>, VaultError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// In-memory storage for every entity. Implements all repository traits so
/// a `Vault` can be wired up with a single `Arc<InMemoryStore>`.
#[derive(Default)]
pub struct InMemoryStore {
    secrets: RwLock<HashMap<String, Secret>>,
    versions: RwLock<HashMap<String, Vec<SecretVersion>>>,
    metadata: RwLock<HashMap<String, SecretMetadata>>,
    transit_keys: RwLock<HashMap<String, TransitKey>>,
    policies: RwLock<HashMap<String, AccessPolicy>>,
    bindings: RwLock<HashMap<String, Vec<PolicyBinding>>>,
    rotation_policies: RwLock<HashMap<String, RotationPolicy>>,
    rotation_history: RwLock<Vec<RotationHistory>>,
    leases: RwLock<HashMap<String, DynamicLease>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn rlock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn wlock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl SecretRepository for InMemoryStore {
    fn get(&self, team_id: &str, path: &str) -> Result<Option<Secret>, VaultError> {
        Ok(rlock(&self.secrets).get(&Secret::key(team_id, path)).cloned())
    }

    fn put(&self, secret: &Secret) -> Result<(), VaultError> {
        wlock(&self.secrets).insert(secret.id(), secret.clone());
        Ok(())
    }

    fn delete(&self, team_id: &str, path: &str) -> Result<(), VaultError> {
        wlock(&self.secrets).remove(&Secret::key(team_id, path));
        Ok(())
    }

    fn list_by_team(&self, team_id: &str) -> Result<Vec<Secret>, VaultError> {
        Ok(rlock(&self.secrets)
            .values()
            .filter(|s| s.team_id == team_id)
            .cloned()
            .collect())
    }

    fn list_expiring_before(&self, before: DateTime<Utc>) -> Result<Vec<Secret>, VaultError> {
        Ok(rlock(&self.secrets)
            .values()
            .filter(|s| s.expires_at.map(|e| e <= before).unwrap_or(false))
            .cloned()
            .collect())
    }
}

impl SecretVersionRepository for InMemoryStore {
    fn get(&self, secret_id: &str, version: u32) -> Result<Option<SecretVersion>, VaultError> {
        Ok(rlock(&self.versions)
            .get(secret_id)
            .and_then(|vs| vs.iter().find(|v| v.version_number == version).cloned()))
    }

    fn put(&self, version: &SecretVersion) -> Result<(), VaultError> {
        let mut versions = wlock(&self.versions);
        let entry = versions.entry(version.secret_id.clone()).or_default();
        if let Some(existing) = entry.iter_mut().find(|v| v.version_number == version.version_number) {
            *existing = version.clone();
        } else {
            entry.push(version.clone());
        }
        Ok(())
    }

    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<SecretVersion>, VaultError> {
        let mut vs = rlock(&self.versions).get(secret_id).cloned().unwrap_or_default();
        vs.sort_by_key(|v| v.version_number);
        Ok(vs)
    }

    fn delete_by_secret(&self, secret_id: &str) -> Result<(), VaultError> {
        wlock(&self.versions).remove(secret_id);
        Ok(())
    }
}

impl SecretMetadataRepository for InMemoryStore {
    fn get(&self, secret_id: &str) -> Result<SecretMetadata, VaultError> {
        Ok(rlock(&self.metadata).get(secret_id).cloned().unwrap_or_default())
    }

    fn put(&self, secret_id: &str, metadata: SecretMetadata) -> Result<(), VaultError> {
        wlock(&self.metadata).insert(secret_id.to_string(), metadata);
        Ok(())
    }

    fn delete(&self, secret_id: &str) -> Result<(), VaultError> {
        wlock(&self.metadata).remove(secret_id);
        Ok(())
    }
}

impl TransitKeyRepository for InMemoryStore {
    fn get(&self, team_id: &str, name: &str) -> Result<Option<TransitKey>, VaultError> {
        Ok(rlock(&self.transit_keys).get(&TransitKey::key(team_id, name)).cloned())
    }

    fn put(&self, key: &TransitKey) -> Result<(), VaultError> {
        wlock(&self.transit_keys).insert(key.id(), key.clone());
        Ok(())
    }

    fn delete(&self, team_id: &str, name: &str) -> Result<(), VaultError> {
        wlock(&self.transit_keys).remove(&TransitKey::key(team_id, name));
        Ok(())
    }

    fn list_by_team(&self, team_id: &str) -> Result<Vec<TransitKey>, VaultError> {
        Ok(rlock(&self.transit_keys)
            .values()
            .filter(|k| k.team_id == team_id)
            .cloned()
            .collect())
    }
}

impl PolicyRepository for InMemoryStore {
    fn get(&self, id: &str) -> Result<Option<AccessPolicy>, VaultError> {
        Ok(rlock(&self.policies).get(id).cloned())
    }

    fn get_by_name(&self, team_id: &str, name: &str) -> Result<Option<AccessPolicy>, VaultError> {
        Ok(rlock(&self.policies)
            .values()
            .find(|p| p.team_id == team_id && p.name == name)
            .cloned())
    }

    fn put(&self, policy: &AccessPolicy) -> Result<(), VaultError> {
        wlock(&self.policies).insert(policy.id.clone(), policy.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), VaultError> {
        wlock(&self.policies).remove(id);
        Ok(())
    }

    fn list_by_team(&self, team_id: &str) -> Result<Vec<AccessPolicy>, VaultError> {
        Ok(rlock(&self.policies)
            .values()
            .filter(|p| p.team_id == team_id)
            .cloned()
            .collect())
    }
}

impl PolicyBindingRepository for InMemoryStore {
    fn put(&self, binding: &PolicyBinding) -> Result<(), VaultError> {
        let mut bindings = wlock(&self.bindings);
        let entry = bindings.entry(binding.policy_id.clone()).or_default();
        if entry.iter().any(|b| {
            b.binding_type == binding.binding_type && b.binding_target_id == binding.binding_target_id
        }) {
            return Err(VaultError::already_exists(
                ResourceKind::PolicyBinding,
                PolicyBinding::dedupe_key(&binding.policy_id, binding.binding_type, &binding.binding_target_id),
            ));
        }
        entry.push(binding.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), VaultError> {
        let mut bindings = wlock(&self.bindings);
        for list in bindings.values_mut() {
            list.retain(|b| b.id != id);
        }
        Ok(())
    }

    fn list_by_policy(&self, policy_id: &str) -> Result<Vec<PolicyBinding>, VaultError> {
        Ok(rlock(&self.bindings).get(policy_id).cloned().unwrap_or_default())
    }

    fn delete_by_policy(&self, policy_id: &str) -> Result<(), VaultError> {
        wlock(&self.bindings).remove(policy_id);
        Ok(())
    }
}

impl RotationPolicyRepository for InMemoryStore {
    fn get(&self, secret_id: &str) -> Result<Option<RotationPolicy>, VaultError> {
        Ok(rlock(&self.rotation_policies).get(secret_id).cloned())
    }

    fn put(&self, policy: &RotationPolicy) -> Result<(), VaultError> {
        wlock(&self.rotation_policies).insert(policy.secret_id.clone(), policy.clone());
        Ok(())
    }

    fn delete(&self, secret_id: &str) -> Result<(), VaultError> {
        wlock(&self.rotation_policies).remove(secret_id);
        Ok(())
    }

    fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RotationPolicy>, VaultError> {
        Ok(rlock(&self.rotation_policies)
            .values()
            .filter(|p| p.is_active && p.next_rotation_at <= now)
            .cloned()
            .collect())
    }
}

impl RotationHistoryRepository for InMemoryStore {
    fn append(&self, entry: &RotationHistory) -> Result<(), VaultError> {
        wlock(&self.rotation_history).push(entry.clone());
        Ok(())
    }

    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<RotationHistory>, VaultError> {
        Ok(rlock(&self.rotation_history)
            .iter()
            .filter(|h| h.secret_id == secret_id)
            .cloned()
            .collect())
    }
}

impl LeaseRepository for InMemoryStore {
    fn get(&self, lease_id: &str) -> Result<Option<DynamicLease>, VaultError> {
        Ok(rlock(&self.leases).get(lease_id).cloned())
    }

    fn put(&self, lease: &DynamicLease) -> Result<(), VaultError> {
        wlock(&self.leases).insert(lease.lease_id.clone(), lease.clone());
        Ok(())
    }

    fn list_by_secret(&self, secret_id: &str) -> Result<Vec<DynamicLease>, VaultError> {
        Ok(rlock(&self.leases)
            .values()
            .filter(|l| l.secret_id == secret_id)
            .cloned()
            .collect())
    }

    fn list_active_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<DynamicLease>, VaultError> {
        use crate::types::LeaseStatus;
        Ok(rlock(&self.leases)
            .values()
            .filter(|l| l.status == LeaseStatus::Active && l.expires_at <= before)
            .cloned()
            .collect())
    }
}
