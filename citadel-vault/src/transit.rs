//! Transit service: named, versioned encryption keys as a service. Raw key
//! material never leaves this module — every response type here must omit
//! `TransitKey::key_material`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use citadel_crypto::CryptoService;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditContext, AuditRecordBuilder, AuditSink};
use crate::error::{ResourceKind, TransitError, VaultError};
use crate::seal::SealService;
use crate::storage::TransitKeyRepository;
use crate::types::TransitKey;

/// One entry in a transit key's decrypted material list.
#[derive(Clone, Serialize, Deserialize)]
struct MaterialEntry {
    version: u32,
    key_base64: String,
}

/// Public view of a transit key: everything except `key_material`.
#[derive(Clone, Debug, Serialize)]
pub struct TransitKeyInfo {
    pub team_id: String,
    pub name: String,
    pub current_version: u32,
    pub min_decryption_version: u32,
    pub algorithm: String,
    pub is_deletable: bool,
    pub is_exportable: bool,
    pub is_active: bool,
}

impl From<&TransitKey> for TransitKeyInfo {
    fn from(k: &TransitKey) -> Self {
        Self {
            team_id: k.team_id.clone(),
            name: k.name.clone(),
            current_version: k.current_version,
            min_decryption_version: k.min_decryption_version,
            algorithm: k.algorithm.clone(),
            is_deletable: k.is_deletable,
            is_exportable: k.is_exportable,
            is_active: k.is_active,
        }
    }
}

pub struct TransitService {
    seal: Arc<SealService>,
    keys: Arc<dyn TransitKeyRepository>,
    audit: Arc<dyn AuditSink>,
}

impl TransitService {
    pub fn new(seal: Arc<SealService>, keys: Arc<dyn TransitKeyRepository>, audit: Arc<dyn AuditSink>) -> Self {
        Self { seal, keys, audit }
    }

    fn audit_record(&self, builder: AuditRecordBuilder, result: &Result<(), String>) {
        let entry = match result {
            Ok(()) => builder.success(),
            Err(msg) => builder.failure(msg.clone()),
        };
        crate::audit::record_safely(self.audit.as_ref(), entry);
    }

    fn load_material(crypto: &CryptoService, key: &TransitKey) -> Result<Vec<MaterialEntry>, VaultError> {
        let plaintext = crypto.decrypt(&key.key_material)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Internal(format!("corrupt transit key material: {e}")))
    }

    fn save_material(crypto: &CryptoService, key: &mut TransitKey, entries: &[MaterialEntry]) -> Result<(), VaultError> {
        let json = serde_json::to_vec(entries).map_err(|e| VaultError::Internal(e.to_string()))?;
        key.key_material = crypto.encrypt(&json)?;
        Ok(())
    }

    fn raw_key_for_version(entries: &[MaterialEntry], version: u32) -> Result<[u8; 32], VaultError> {
        let entry = entries
            .iter()
            .find(|e| e.version == version)
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, format!("version {version}")))?;
        let raw = BASE64
            .decode(&entry.key_base64)
            .map_err(|e| VaultError::Internal(format!("corrupt transit key version {version}: {e}")))?;
        raw.try_into().map_err(|_| VaultError::Internal(format!("transit key version {version} is not 32 bytes")))
    }

    /// Parses `"<name>:v<N>"`, splitting on the *last* `":v"` occurrence so
    /// key names may themselves contain colons.
    fn parse_key_id(key_id: &str) -> Result<(&str, u32), VaultError> {
        let idx = key_id
            .rfind(":v")
            .ok_or_else(|| VaultError::MalformedEnvelope(format!("transit keyId '{key_id}' has no version suffix")))?;
        let (name, rest) = key_id.split_at(idx);
        let version_str = &rest[2..];
        let version: u32 = version_str
            .parse()
            .map_err(|_| VaultError::MalformedEnvelope(format!("transit keyId '{key_id}' has a non-numeric version")))?;
        Ok((name, version))
    }

    pub fn create_key(
        &self,
        team_id: &str,
        name: &str,
        is_deletable: bool,
        is_exportable: bool,
        ctx: AuditContext,
    ) -> Result<TransitKeyInfo, TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.create_key", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.create_key_inner(&crypto, team_id, name, is_deletable, is_exportable);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn create_key_inner(
        &self,
        crypto: &CryptoService,
        team_id: &str,
        name: &str,
        is_deletable: bool,
        is_exportable: bool,
    ) -> Result<TransitKeyInfo, TransitError> {
        if self.keys.get(team_id, name)?.is_some() {
            return Err(VaultError::already_exists(ResourceKind::TransitKey, TransitKey::key(team_id, name)).into());
        }

        let raw = CryptoService::generate_data_key()?;
        let entries = vec![MaterialEntry { version: 1, key_base64: BASE64.encode(raw) }];
        let json = serde_json::to_vec(&entries).map_err(|e| VaultError::Internal(e.to_string()))?;
        let key_material = crypto.encrypt(&json)?;

        let now = Utc::now();
        let key = TransitKey {
            team_id: team_id.to_string(),
            name: name.to_string(),
            current_version: 1,
            min_decryption_version: 1,
            key_material,
            algorithm: "AES-256-GCM".to_string(),
            is_deletable,
            is_exportable,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.keys.put(&key)?;
        Ok(TransitKeyInfo::from(&key))
    }

    pub fn get(&self, team_id: &str, name: &str) -> Result<TransitKeyInfo, VaultError> {
        self.seal.require_unsealed()?;
        let key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;
        Ok(TransitKeyInfo::from(&key))
    }

    pub fn list(&self, team_id: &str) -> Result<Vec<TransitKeyInfo>, VaultError> {
        self.seal.require_unsealed()?;
        Ok(self.keys.list_by_team(team_id)?.iter().map(TransitKeyInfo::from).collect())
    }

    /// Appends a new random key version and advances `currentVersion`.
    pub fn rotate(&self, team_id: &str, name: &str, ctx: AuditContext) -> Result<u32, TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.rotate", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.rotate_inner(&crypto, team_id, name);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn rotate_inner(&self, crypto: &CryptoService, team_id: &str, name: &str) -> Result<u32, TransitError> {
        let mut key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;

        let mut entries = Self::load_material(crypto, &key)?;
        let new_version = key.current_version + 1;
        let raw = CryptoService::generate_data_key()?;
        entries.push(MaterialEntry { version: new_version, key_base64: BASE64.encode(raw) });
        Self::save_material(crypto, &mut key, &entries)?;

        key.current_version = new_version;
        key.updated_at = Utc::now();
        self.keys.put(&key)?;
        Ok(new_version)
    }

    /// Raises `minDecryptionVersion`. Lowering is rejected: once a floor is
    /// set, data below it stays unreadable.
    pub fn set_min_decryption_version(
        &self,
        team_id: &str,
        name: &str,
        new_min: u32,
    ) -> Result<(), VaultError> {
        self.seal.require_unsealed()?;
        let mut key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;

        if new_min < key.min_decryption_version {
            return Err(VaultError::validation("minDecryptionVersion can only be raised"));
        }
        if new_min > key.current_version {
            return Err(VaultError::validation("minDecryptionVersion cannot exceed currentVersion"));
        }
        key.min_decryption_version = new_min;
        key.updated_at = Utc::now();
        self.keys.put(&key)
    }

    pub fn encrypt(&self, team_id: &str, name: &str, plaintext: &[u8], ctx: AuditContext) -> Result<String, TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.encrypt", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.encrypt_inner(&crypto, team_id, name, plaintext);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn encrypt_inner(&self, crypto: &CryptoService, team_id: &str, name: &str, plaintext: &[u8]) -> Result<String, TransitError> {
        let key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;
        let entries = Self::load_material(crypto, &key)?;
        let raw = Self::raw_key_for_version(&entries, key.current_version)?;
        let key_id = format!("{name}:v{}", key.current_version);
        Ok(crypto.encrypt_with_key(plaintext, &key_id, &raw)?)
    }

    pub fn decrypt(&self, team_id: &str, name: &str, ciphertext: &str, ctx: AuditContext) -> Result<Vec<u8>, TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.decrypt", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.decrypt_inner(&crypto, team_id, name, ciphertext);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn decrypt_inner(&self, crypto: &CryptoService, team_id: &str, name: &str, ciphertext: &str) -> Result<Vec<u8>, TransitError> {
        let key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;

        let embedded_key_id = CryptoService::extract_key_id(ciphertext)?;
        let (embedded_name, version) = Self::parse_key_id(&embedded_key_id)?;
        if embedded_name != name {
            return Err(VaultError::MalformedEnvelope(format!(
                "ciphertext was wrapped under transit key '{embedded_name}', not '{name}'"
            ))
            .into());
        }
        if version < key.min_decryption_version {
            return Err(VaultError::TransitVersionBelowMin {
                version,
                min_decryption_version: key.min_decryption_version,
            }
            .into());
        }

        let entries = Self::load_material(crypto, &key)?;
        let raw = Self::raw_key_for_version(&entries, version)?;
        Ok(crypto.decrypt_with_key(ciphertext, &raw)?)
    }

    /// Re-wraps `ciphertext` under the key's current version. Afterward the
    /// ciphertext no longer decrypts under the source version's raw key.
    pub fn rewrap(&self, team_id: &str, name: &str, ciphertext: &str, ctx: AuditContext) -> Result<String, TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.rewrap", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.rewrap_inner(&crypto, team_id, name, ciphertext);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn rewrap_inner(&self, crypto: &CryptoService, team_id: &str, name: &str, ciphertext: &str) -> Result<String, TransitError> {
        let key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;

        let embedded_key_id = CryptoService::extract_key_id(ciphertext)?;
        let (embedded_name, source_version) = Self::parse_key_id(&embedded_key_id)?;
        if embedded_name != name {
            return Err(VaultError::MalformedEnvelope(format!(
                "ciphertext was wrapped under transit key '{embedded_name}', not '{name}'"
            ))
            .into());
        }

        let entries = Self::load_material(crypto, &key)?;
        let old_raw = Self::raw_key_for_version(&entries, source_version)?;
        let new_raw = Self::raw_key_for_version(&entries, key.current_version)?;
        let new_key_id = format!("{name}:v{}", key.current_version);
        Ok(crypto.rewrap(ciphertext, &old_raw, &new_raw, &new_key_id)?)
    }

    /// Fresh 32-byte DEK, wrapped under the key's current version.
    pub fn issue_data_key(&self, team_id: &str, name: &str, ctx: AuditContext) -> Result<(String, String), TransitError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.issue_data_key", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = self.issue_data_key_inner(&crypto, team_id, name);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn issue_data_key_inner(&self, crypto: &CryptoService, team_id: &str, name: &str) -> Result<(String, String), TransitError> {
        let key = self
            .keys
            .get(team_id, name)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;
        let entries = Self::load_material(crypto, &key)?;
        let raw = Self::raw_key_for_version(&entries, key.current_version)?;

        let dek = CryptoService::generate_data_key()?;
        let plaintext_b64 = BASE64.encode(dek);
        let key_id = format!("{name}:v{}", key.current_version);
        let envelope = crypto.encrypt_with_key(&dek, &key_id, &raw)?;
        Ok((plaintext_b64, envelope))
    }

    pub fn delete_key(&self, team_id: &str, name: &str, ctx: AuditContext) -> Result<(), TransitError> {
        self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("transit.delete_key", "transit_key")
            .team(team_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome: Result<(), TransitError> = (|| {
            let key = self
                .keys
                .get(team_id, name)?
                .ok_or_else(|| VaultError::not_found(ResourceKind::TransitKey, TransitKey::key(team_id, name)))?;
            if !key.is_deletable {
                return Err(VaultError::validation(format!("transit key '{name}' is not deletable")).into());
            }
            self.keys.delete(team_id, name)?;
            Ok(())
        })();
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::storage::InMemoryStore;

    fn service() -> (Arc<SealService>, TransitService) {
        let seal = Arc::new(SealService::new(vec![0x11u8; 32], 5, 3, true).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        (seal.clone(), TransitService::new(seal, store, audit))
    }

    #[test]
    fn encrypt_decrypt_round_trip_uses_current_version() {
        let (_seal, svc) = service();
        svc.create_key("t1", "orders-key", true, false, AuditContext::default()).unwrap();
        let ct = svc.encrypt("t1", "orders-key", b"card-number", AuditContext::default()).unwrap();
        let pt = svc.decrypt("t1", "orders-key", &ct, AuditContext::default()).unwrap();
        assert_eq!(pt, b"card-number");
        assert!(!ct.is_empty());
    }

    #[test]
    fn rotate_advances_current_version_and_old_ciphertext_still_decrypts() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        let ct_v1 = svc.encrypt("t1", "k", b"v1-data", AuditContext::default()).unwrap();

        let new_version = svc.rotate("t1", "k", AuditContext::default()).unwrap();
        assert_eq!(new_version, 2);

        let pt_v1 = svc.decrypt("t1", "k", &ct_v1, AuditContext::default()).unwrap();
        assert_eq!(pt_v1, b"v1-data");

        let ct_v2 = svc.encrypt("t1", "k", b"v2-data", AuditContext::default()).unwrap();
        assert_eq!(CryptoService::extract_key_id(&ct_v2).unwrap(), "k:v2");
    }

    #[test]
    fn decrypt_below_min_decryption_version_fails() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        let ct_v1 = svc.encrypt("t1", "k", b"old", AuditContext::default()).unwrap();
        svc.rotate("t1", "k", AuditContext::default()).unwrap();
        svc.set_min_decryption_version("t1", "k", 2).unwrap();

        let err = svc.decrypt("t1", "k", &ct_v1, AuditContext::default()).unwrap_err();
        assert!(matches!(err.0, VaultError::TransitVersionBelowMin { .. }));
    }

    #[test]
    fn min_decryption_version_cannot_be_lowered() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        svc.rotate("t1", "k", AuditContext::default()).unwrap();
        svc.set_min_decryption_version("t1", "k", 2).unwrap();
        assert!(svc.set_min_decryption_version("t1", "k", 1).is_err());
    }

    #[test]
    fn rewrap_invalidates_source_version_key() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        let ct_v1 = svc.encrypt("t1", "k", b"payload", AuditContext::default()).unwrap();
        svc.rotate("t1", "k", AuditContext::default()).unwrap();

        let rewrapped = svc.rewrap("t1", "k", &ct_v1, AuditContext::default()).unwrap();
        assert_eq!(CryptoService::extract_key_id(&rewrapped).unwrap(), "k:v2");
        let pt = svc.decrypt("t1", "k", &rewrapped, AuditContext::default()).unwrap();
        assert_eq!(pt, b"payload");
    }

    #[test]
    fn issue_data_key_returns_plaintext_and_envelope() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        let (plaintext_b64, envelope) = svc.issue_data_key("t1", "k", AuditContext::default()).unwrap();
        let raw = BASE64.decode(&plaintext_b64).unwrap();
        assert_eq!(raw.len(), 32);
        let recovered = svc.decrypt_raw_for_test(&envelope);
        assert_eq!(BASE64.encode(recovered), plaintext_b64);
    }

    #[test]
    fn delete_non_deletable_key_fails() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", false, false, AuditContext::default()).unwrap();
        assert!(svc.delete_key("t1", "k", AuditContext::default()).is_err());
    }

    #[test]
    fn delete_deletable_key_succeeds() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k", true, false, AuditContext::default()).unwrap();
        assert!(svc.delete_key("t1", "k", AuditContext::default()).is_ok());
        assert!(svc.get("t1", "k").is_err());
    }

    #[test]
    fn decrypt_rejects_ciphertext_from_a_different_key_name() {
        let (_seal, svc) = service();
        svc.create_key("t1", "k1", true, false, AuditContext::default()).unwrap();
        svc.create_key("t1", "k2", true, false, AuditContext::default()).unwrap();
        let ct = svc.encrypt("t1", "k1", b"data", AuditContext::default()).unwrap();
        let err = svc.decrypt("t1", "k2", &ct, AuditContext::default()).unwrap_err();
        assert!(matches!(err.0, VaultError::MalformedEnvelope(_)));
    }

    impl TransitService {
        fn decrypt_raw_for_test(&self, envelope: &str) -> Vec<u8> {
            let crypto = self.seal.require_unsealed().unwrap();
            let key_id = CryptoService::extract_key_id(envelope).unwrap();
            let (name, version) = Self::parse_key_id(&key_id).unwrap();
            let key = self.keys.get("t1", name).unwrap().unwrap();
            let entries = Self::load_material(&crypto, &key).unwrap();
            let raw = Self::raw_key_for_version(&entries, version).unwrap();
            crypto.decrypt_with_key(envelope, &raw).unwrap()
        }
    }
}
