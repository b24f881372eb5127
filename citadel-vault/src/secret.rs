//! Secret service: create, read, update, retain, delete and list secrets.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use citadel_crypto::CryptoService;

use crate::audit::{AuditContext, AuditRecordBuilder, AuditSink};
use crate::error::{ResourceKind, SecretError, VaultError};
use crate::seal::SealService;
use crate::storage::{SecretMetadataRepository, SecretRepository, SecretVersionRepository};
use crate::types::{Secret, SecretMetadata, SecretType, SecretVersion, DESTROYED_SENTINEL};

/// Request to create a new secret. `value` is required for STATIC/DYNAMIC,
/// ignored for REFERENCE (use `reference_arn` instead).
pub struct CreateSecretRequest {
    pub team_id: String,
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    pub secret_type: SecretType,
    pub value: Option<Vec<u8>>,
    pub reference_arn: Option<String>,
    pub metadata: Option<SecretMetadata>,
    pub max_versions: Option<u32>,
    pub retention_days: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub owner_user_id: String,
}

/// Partial update; only `Some` fields are applied. A `Some(value)` creates
/// a new version; `metadata: Some(_)` fully replaces the metadata set.
#[derive(Default)]
pub struct UpdateSecretRequest {
    pub value: Option<Vec<u8>>,
    pub change_description: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<SecretMetadata>,
    pub max_versions: Option<Option<u32>>,
    pub retention_days: Option<Option<u32>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub updated_by_user_id: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub enum SecretListFilter<'a> {
    #[default]
    Unfiltered,
    SecretType(SecretType),
    PathPrefix(&'a str),
    ActiveOnly,
}

pub struct SecretService {
    seal: Arc<SealService>,
    secrets: Arc<dyn SecretRepository>,
    versions: Arc<dyn SecretVersionRepository>,
    metadata_repo: Arc<dyn SecretMetadataRepository>,
    audit: Arc<dyn AuditSink>,
}

impl SecretService {
    pub fn new(
        seal: Arc<SealService>,
        secrets: Arc<dyn SecretRepository>,
        versions: Arc<dyn SecretVersionRepository>,
        metadata_repo: Arc<dyn SecretMetadataRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { seal, secrets, versions, metadata_repo, audit }
    }

    fn audit_record(
        &self,
        builder: AuditRecordBuilder,
        result: &Result<(), String>,
    ) {
        let entry = match result {
            Ok(()) => builder.success(),
            Err(msg) => builder.failure(msg.clone()),
        };
        crate::audit::record_safely(self.audit.as_ref(), entry);
    }

    pub fn create(&self, req: CreateSecretRequest, ctx: AuditContext) -> Result<Secret, SecretError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.create", "secret")
            .team(req.team_id.clone())
            .user(req.owner_user_id.clone())
            .path(req.path.clone())
            .context(ctx);

        let outcome = self.create_inner(&crypto, req);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn create_inner(&self, crypto: &CryptoService, req: CreateSecretRequest) -> Result<Secret, SecretError> {
        if self.secrets.get(&req.team_id, &req.path)?.is_some() {
            return Err(VaultError::already_exists(ResourceKind::Secret, Secret::key(&req.team_id, &req.path)).into());
        }

        let now = Utc::now();
        let current_version = match req.secret_type {
            SecretType::Reference => 0,
            SecretType::Static | SecretType::Dynamic => 1,
        };

        let secret = Secret {
            team_id: req.team_id.clone(),
            path: req.path.clone(),
            name: req.name,
            description: req.description,
            secret_type: req.secret_type,
            current_version,
            max_versions: req.max_versions,
            retention_days: req.retention_days,
            expires_at: req.expires_at,
            last_accessed_at: None,
            last_rotated_at: None,
            owner_user_id: req.owner_user_id.clone(),
            reference_arn: req.reference_arn,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        if !matches!(req.secret_type, SecretType::Reference) {
            let value = req
                .value
                .ok_or_else(|| VaultError::validation("value is required for STATIC/DYNAMIC secrets"))?;
            let encrypted_value = crypto.encrypt(&value)?;
            self.versions.put(&SecretVersion {
                secret_id: secret.id(),
                version_number: 1,
                encrypted_value,
                encryption_key_id: citadel_crypto::envelope::DEFAULT_KEY_ID.to_string(),
                change_description: Some("initial version".into()),
                created_by_user_id: req.owner_user_id,
                is_destroyed: false,
                created_at: now,
            })?;
        }

        if let Some(metadata) = req.metadata {
            self.metadata_repo.put(&secret.id(), metadata)?;
        }

        self.secrets.put(&secret)?;
        Ok(secret)
    }

    pub fn get_metadata(&self, team_id: &str, path: &str) -> Result<Secret, SecretError> {
        self.seal.require_unsealed()?;
        self.secrets
            .get(team_id, path)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)).into())
    }

    /// Stamps `lastRotatedAt`. Called by the rotation service after a
    /// successful rotation commits a new version.
    pub fn mark_rotated(&self, team_id: &str, path: &str) -> Result<(), VaultError> {
        self.seal.require_unsealed()?;
        let mut secret = self
            .secrets
            .get(team_id, path)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;
        secret.last_rotated_at = Some(Utc::now());
        self.secrets.put(&secret)
    }

    pub fn read_value(&self, team_id: &str, path: &str, ctx: AuditContext) -> Result<Vec<u8>, SecretError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.read_value", "secret")
            .team(team_id.to_string())
            .path(path.to_string())
            .context(ctx);

        let outcome = self.read_value_inner(&crypto, team_id, path);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn read_value_inner(&self, crypto: &CryptoService, team_id: &str, path: &str) -> Result<Vec<u8>, SecretError> {
        let mut secret = self
            .secrets
            .get(team_id, path)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;

        let version = self
            .versions
            .get(&secret.id(), secret.current_version)?
            .ok_or_else(|| VaultError::validation("secret version row is missing"))?;

        let plaintext = crypto.decrypt(&version.encrypted_value)?;
        secret.last_accessed_at = Some(Utc::now());
        self.secrets.put(&secret)?;
        Ok(plaintext)
    }

    pub fn read_historical_version(
        &self,
        team_id: &str,
        path: &str,
        version_number: u32,
        ctx: AuditContext,
    ) -> Result<Vec<u8>, SecretError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.read_version", "secret")
            .team(team_id.to_string())
            .path(path.to_string())
            .context(ctx);

        let outcome = self.read_historical_inner(&crypto, team_id, path, version_number);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn read_historical_inner(
        &self,
        crypto: &CryptoService,
        team_id: &str,
        path: &str,
        version_number: u32,
    ) -> Result<Vec<u8>, SecretError> {
        let mut secret = self
            .secrets
            .get(team_id, path)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;

        let version = self
            .versions
            .get(&secret.id(), version_number)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::SecretVersion, version_number.to_string()))?;

        if version.is_destroyed {
            return Err(VaultError::validation(format!("version {version_number} has been destroyed")).into());
        }

        let plaintext = crypto.decrypt(&version.encrypted_value)?;
        secret.last_accessed_at = Some(Utc::now());
        self.secrets.put(&secret)?;
        Ok(plaintext)
    }

    pub fn update(
        &self,
        team_id: &str,
        path: &str,
        req: UpdateSecretRequest,
        ctx: AuditContext,
    ) -> Result<Secret, SecretError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.update", "secret")
            .team(team_id.to_string())
            .user(req.updated_by_user_id.clone())
            .path(path.to_string())
            .context(ctx);

        let outcome = self.update_inner(&crypto, team_id, path, req);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn update_inner(
        &self,
        crypto: &CryptoService,
        team_id: &str,
        path: &str,
        req: UpdateSecretRequest,
    ) -> Result<Secret, SecretError> {
        let mut secret = self
            .secrets
            .get(team_id, path)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;

        if let Some(value) = req.value {
            let new_version_number = secret.current_version + 1;
            let encrypted_value = crypto.encrypt(&value)?;
            self.versions.put(&SecretVersion {
                secret_id: secret.id(),
                version_number: new_version_number,
                encrypted_value,
                encryption_key_id: citadel_crypto::envelope::DEFAULT_KEY_ID.to_string(),
                change_description: req.change_description,
                created_by_user_id: req.updated_by_user_id,
                is_destroyed: false,
                created_at: Utc::now(),
            })?;
            secret.current_version = new_version_number;
        }

        if let Some(description) = req.description {
            secret.description = Some(description);
        }
        if let Some(max_versions) = req.max_versions {
            secret.max_versions = max_versions;
        }
        if let Some(retention_days) = req.retention_days {
            secret.retention_days = retention_days;
        }
        if let Some(expires_at) = req.expires_at {
            secret.expires_at = expires_at;
        }
        if let Some(metadata) = req.metadata {
            self.metadata_repo.put(&secret.id(), metadata)?;
        }

        secret.updated_at = Utc::now();
        self.secrets.put(&secret)?;
        self.apply_retention(&secret)?;
        Ok(secret)
    }

    /// Runs retention after any new version is committed, and on demand.
    /// Never destroys the current version.
    pub fn apply_retention(&self, secret: &Secret) -> Result<(), VaultError> {
        let mut versions = self.versions.list_by_secret(&secret.id())?;
        versions.sort_by(|a, b| b.version_number.cmp(&a.version_number));

        if let Some(max_versions) = secret.max_versions {
            let mut seen = 0u32;
            for version in versions.iter_mut() {
                if version.is_destroyed {
                    continue;
                }
                seen += 1;
                if seen > max_versions && version.version_number != secret.current_version {
                    self.destroy_version(version)?;
                }
            }
        }

        if let Some(retention_days) = secret.retention_days {
            let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
            for version in versions.iter_mut() {
                if version.is_destroyed || version.version_number == secret.current_version {
                    continue;
                }
                if version.created_at < cutoff {
                    self.destroy_version(version)?;
                }
            }
        }

        Ok(())
    }

    fn destroy_version(&self, version: &mut SecretVersion) -> Result<(), VaultError> {
        version.is_destroyed = true;
        version.encrypted_value = DESTROYED_SENTINEL.to_string();
        self.versions.put(version)
    }

    pub fn soft_delete(&self, team_id: &str, path: &str, ctx: AuditContext) -> Result<(), SecretError> {
        self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.soft_delete", "secret")
            .team(team_id.to_string())
            .path(path.to_string())
            .context(ctx);

        let outcome: Result<(), SecretError> = (|| {
            let mut secret = self
                .secrets
                .get(team_id, path)?
                .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;
            secret.is_active = false;
            secret.updated_at = Utc::now();
            self.secrets.put(&secret)?;
            Ok(())
        })();
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    pub fn hard_delete(&self, team_id: &str, path: &str, ctx: AuditContext) -> Result<(), SecretError> {
        self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("secret.hard_delete", "secret")
            .team(team_id.to_string())
            .path(path.to_string())
            .context(ctx);

        let outcome: Result<(), SecretError> = (|| {
            let secret = self
                .secrets
                .get(team_id, path)?
                .ok_or_else(|| VaultError::not_found(ResourceKind::Secret, Secret::key(team_id, path)))?;
            self.versions.delete_by_secret(&secret.id())?;
            self.metadata_repo.delete(&secret.id())?;
            self.secrets.delete(team_id, path)?;
            Ok(())
        })();
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    pub fn list(&self, team_id: &str, filter: SecretListFilter<'_>, name_search: Option<&str>) -> Result<Vec<Secret>, VaultError> {
        self.seal.require_unsealed()?;
        let mut secrets = self.secrets.list_by_team(team_id)?;
        match filter {
            SecretListFilter::SecretType(t) => secrets.retain(|s| s.secret_type == t),
            SecretListFilter::PathPrefix(prefix) => secrets.retain(|s| s.path.starts_with(prefix)),
            SecretListFilter::ActiveOnly => secrets.retain(|s| s.is_active),
            SecretListFilter::Unfiltered => {}
        }
        if let Some(query) = name_search {
            let query = query.to_lowercase();
            secrets.retain(|s| s.name.to_lowercase().contains(&query));
        }
        Ok(secrets)
    }

    /// Deduplicated, sorted paths under `prefix` among active secrets only.
    pub fn list_paths(&self, team_id: &str, prefix: &str) -> Result<Vec<String>, VaultError> {
        self.seal.require_unsealed()?;
        let mut paths: Vec<String> = self
            .secrets
            .list_by_team(team_id)?
            .into_iter()
            .filter(|s| s.is_active && s.path.starts_with(prefix))
            .map(|s| s.path)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Active secrets whose `expiresAt` falls in `[now, now + hours)`.
    pub fn get_expiring_secrets(&self, team_id: &str, hours: i64) -> Result<Vec<Secret>, VaultError> {
        self.seal.require_unsealed()?;
        let now = Utc::now();
        let horizon = now + ChronoDuration::hours(hours);
        Ok(self
            .secrets
            .list_by_team(team_id)?
            .into_iter()
            .filter(|s| s.is_active)
            .filter(|s| s.expires_at.map(|e| e >= now && e < horizon).unwrap_or(false))
            .collect())
    }
}
