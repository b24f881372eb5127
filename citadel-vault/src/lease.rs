//! Dynamic leases: short-lived, auto-expiring backend credentials minted
//! from a DYNAMIC secret's connection metadata.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use citadel_crypto::CryptoService;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::{AuditContext, AuditRecordBuilder, AuditSink};
use crate::error::{LeaseError, ResourceKind, VaultError};
use crate::seal::SealService;
use crate::secret::SecretService;
use crate::storage::LeaseRepository;
use crate::types::{random_id, DynamicLease, LeaseStatus, SecretType};

/// Required connection fields a DYNAMIC secret's value must carry as JSON.
#[derive(Deserialize)]
struct BackendConnection {
    #[serde(rename = "backendType")]
    backend_type: String,
    host: String,
    port: Value,
    database: String,
    #[serde(rename = "adminUser")]
    admin_user: String,
    #[serde(rename = "adminPassword")]
    admin_password: String,
}

impl BackendConnection {
    fn port_str(&self) -> String {
        match &self.port {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Serialize)]
struct LeaseCredentials {
    username: String,
    password: String,
    host: String,
    port: String,
    database: String,
}

pub struct LeaseServiceConfig {
    pub username_prefix: String,
    pub password_length: usize,
    pub default_ttl_seconds: u64,
    pub max_ttl_seconds: u64,
    pub execute_sql: bool,
}

impl Default for LeaseServiceConfig {
    fn default() -> Self {
        Self {
            username_prefix: "citadel_".to_string(),
            password_length: 24,
            default_ttl_seconds: 3600,
            max_ttl_seconds: 24 * 3600,
            execute_sql: false,
        }
    }
}

pub struct LeaseService {
    seal: Arc<SealService>,
    secrets: Arc<SecretService>,
    leases: Arc<dyn LeaseRepository>,
    audit: Arc<dyn AuditSink>,
    config: LeaseServiceConfig,
}

impl LeaseService {
    pub fn new(
        seal: Arc<SealService>,
        secrets: Arc<SecretService>,
        leases: Arc<dyn LeaseRepository>,
        audit: Arc<dyn AuditSink>,
        config: LeaseServiceConfig,
    ) -> Self {
        Self { seal, secrets, leases, audit, config }
    }

    fn audit_record(&self, builder: AuditRecordBuilder, result: &Result<(), String>) {
        let entry = match result {
            Ok(()) => builder.success(),
            Err(msg) => builder.failure(msg.clone()),
        };
        crate::audit::record_safely(self.audit.as_ref(), entry);
    }

    /// Replaces runs of non-identifier characters with `_` and lowercases.
    fn sanitize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_was_separator = false;
        for c in name.chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c.to_ascii_lowercase());
                last_was_separator = false;
            } else if !last_was_separator {
                out.push('_');
                last_was_separator = true;
            }
        }
        out.trim_matches('_').to_string()
    }

    fn build_username(&self, secret_name: &str) -> String {
        let short_uuid = uuid::Uuid::new_v4().to_string().replace('-', "");
        let short_uuid = &short_uuid[..8];
        let mut username = format!("{}{}_{}", self.config.username_prefix, Self::sanitize(secret_name), short_uuid);
        username.truncate(63);
        username
    }

    fn create_backend_sql(backend_type: &str, username: &str, password: &str, database: &str) -> Result<Vec<String>, VaultError> {
        match backend_type {
            "postgresql" => Ok(vec![
                format!("CREATE ROLE \"{username}\" WITH LOGIN PASSWORD '{password}'"),
                format!("GRANT CONNECT ON DATABASE \"{database}\" TO \"{username}\""),
                format!("GRANT USAGE ON SCHEMA public TO \"{username}\""),
            ]),
            "mysql" => Ok(vec![
                format!("CREATE USER '{username}'@'%' IDENTIFIED BY '{password}'"),
                format!("GRANT SELECT, INSERT, UPDATE, DELETE ON {database}.* TO '{username}'@'%'"),
                "FLUSH PRIVILEGES".to_string(),
            ]),
            other => Err(VaultError::validation(format!("unsupported backend '{other}'"))),
        }
    }

    fn drop_backend_sql(backend_type: &str, username: &str) -> Result<Vec<String>, VaultError> {
        match backend_type {
            "postgresql" => Ok(vec![format!("DROP ROLE IF EXISTS \"{username}\";")]),
            "mysql" => Ok(vec![format!("DROP USER IF EXISTS '{username}'@'%';")]),
            other => Err(VaultError::validation(format!("unsupported backend '{other}'"))),
        }
    }

    /// Best-effort: logs and swallows any error, never propagates to the
    /// caller. Revocation and expiry must succeed even if the backend is
    /// unreachable.
    fn best_effort_drop(&self, backend_type: &str, username: &str) {
        if !self.config.execute_sql {
            return;
        }
        match Self::drop_backend_sql(backend_type, username) {
            Ok(statements) => {
                for stmt in statements {
                    tracing::debug!(sql = %stmt, "would execute backend credential drop (no SQL driver wired in)");
                }
            }
            Err(e) => tracing::warn!(error = %e, username, "failed to build backend drop statement"),
        }
    }

    pub fn create(
        &self,
        team_id: &str,
        path: &str,
        ttl_seconds: Option<u64>,
        requested_by_user_id: &str,
        ctx: AuditContext,
    ) -> Result<DynamicLease, LeaseError> {
        let crypto = self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("lease.create", "lease")
            .team(team_id.to_string())
            .user(requested_by_user_id.to_string())
            .path(path.to_string())
            .context(ctx.clone());

        let outcome = self.create_inner(&crypto, team_id, path, ttl_seconds, requested_by_user_id, ctx);
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    fn create_inner(
        &self,
        crypto: &CryptoService,
        team_id: &str,
        path: &str,
        ttl_seconds: Option<u64>,
        requested_by_user_id: &str,
        ctx: AuditContext,
    ) -> Result<DynamicLease, LeaseError> {
        let secret = self.secrets.get_metadata(team_id, path).map_err(|e| e.0)?;
        if !matches!(secret.secret_type, SecretType::Dynamic) {
            return Err(VaultError::validation("leases can only be issued from a DYNAMIC secret").into());
        }

        let value = self.secrets.read_value(team_id, path, ctx).map_err(|e| e.0)?;
        let conn: BackendConnection = serde_json::from_slice(&value)
            .map_err(|e| VaultError::validation(format!("DYNAMIC secret value is not valid connection metadata: {e}")))?;
        if conn.backend_type.trim().is_empty()
            || conn.host.trim().is_empty()
            || conn.database.trim().is_empty()
            || conn.admin_user.trim().is_empty()
            || conn.admin_password.trim().is_empty()
        {
            return Err(VaultError::validation("DYNAMIC secret connection metadata has a blank required field").into());
        }

        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_seconds).min(self.config.max_ttl_seconds);
        let username = self.build_username(&secret.name);
        let password = CryptoService::generate_random_string(self.config.password_length, "alphanumeric")?;

        if self.config.execute_sql {
            let statements = Self::create_backend_sql(&conn.backend_type, &username, &password, &conn.database)?;
            for stmt in statements {
                tracing::debug!(sql = %stmt, "would execute backend credential provisioning (no SQL driver wired in)");
            }
        }

        let credentials = LeaseCredentials {
            username: username.clone(),
            password,
            host: conn.host.clone(),
            port: conn.port_str(),
            database: conn.database.clone(),
        };
        let credentials_json = serde_json::to_vec(&credentials).map_err(|e| VaultError::Internal(e.to_string()))?;
        let encrypted_credentials = crypto.encrypt(&credentials_json)?;

        let mut metadata = HashMap::new();
        metadata.insert("host".to_string(), conn.host.clone());
        metadata.insert("port".to_string(), conn.port_str());
        metadata.insert("database".to_string(), conn.database.clone());
        metadata.insert("username".to_string(), username.clone());
        metadata.insert("backendType".to_string(), conn.backend_type.clone());
        let metadata_json = serde_json::to_string(&metadata).map_err(|e| VaultError::Internal(e.to_string()))?;

        let now = Utc::now();
        let lease = DynamicLease {
            lease_id: random_id("lease"),
            secret_id: secret.id(),
            secret_path: path.to_string(),
            backend_type: conn.backend_type,
            encrypted_credentials,
            status: LeaseStatus::Active,
            ttl_seconds: ttl,
            expires_at: now + ChronoDuration::seconds(ttl as i64),
            revoked_at: None,
            revoked_by_user_id: None,
            requested_by_user_id: requested_by_user_id.to_string(),
            metadata_json,
        };
        self.leases.put(&lease)?;
        Ok(lease)
    }

    pub fn get(&self, lease_id: &str) -> Result<DynamicLease, VaultError> {
        self.seal.require_unsealed()?;
        self.leases
            .get(lease_id)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Lease, lease_id.to_string()))
    }

    pub fn revoke(&self, lease_id: &str, revoked_by_user_id: Option<&str>, ctx: AuditContext) -> Result<(), LeaseError> {
        self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("lease.revoke", "lease")
            .resource_id(lease_id.to_string())
            .context(ctx);

        let outcome: Result<(), LeaseError> = (|| {
            let mut lease = self
                .leases
                .get(lease_id)?
                .ok_or_else(|| VaultError::not_found(ResourceKind::Lease, lease_id.to_string()))?;
            if lease.status != LeaseStatus::Active {
                return Err(VaultError::Conflict(format!("lease '{lease_id}' is not active")).into());
            }
            lease.status = LeaseStatus::Revoked;
            lease.revoked_at = Some(Utc::now());
            lease.revoked_by_user_id = revoked_by_user_id.map(|s| s.to_string());
            self.leases.put(&lease)?;

            let username = lease_username(&lease.metadata_json);
            self.best_effort_drop(&lease.backend_type, &username);
            Ok(())
        })();
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    /// Expires every ACTIVE lease whose `expiresAt` has passed.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        self.seal.require_unsealed()?;
        let due = self.leases.list_active_expiring_before(now)?;
        let mut count = 0;
        for mut lease in due {
            lease.status = LeaseStatus::Expired;
            self.leases.put(&lease)?;
            let username = lease_username(&lease.metadata_json);
            self.best_effort_drop(&lease.backend_type, &username);
            count += 1;
        }
        Ok(count)
    }
}

fn lease_username(metadata_json: &str) -> String {
    serde_json::from_str::<HashMap<String, String>>(metadata_json)
        .ok()
        .and_then(|m| m.get("username").cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::secret::CreateSecretRequest;
    use crate::storage::InMemoryStore;

    fn setup() -> (Arc<SecretService>, LeaseService) {
        let seal = Arc::new(SealService::new(vec![0x44u8; 32], 5, 3, true).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let secrets = Arc::new(SecretService::new(seal.clone(), store.clone(), store.clone(), store.clone(), audit.clone()));
        let lease = LeaseService::new(seal, secrets.clone(), store, audit, LeaseServiceConfig::default());
        (secrets, lease)
    }

    fn dynamic_secret(secrets: &SecretService, port: Value) {
        let conn = serde_json::json!({
            "backendType": "postgresql",
            "host": "db.internal",
            "port": port,
            "database": "orders",
            "adminUser": "admin",
            "adminPassword": "supersecret",
        });
        secrets
            .create(
                CreateSecretRequest {
                    team_id: "t1".into(),
                    path: "db/orders".into(),
                    name: "orders-db".into(),
                    description: None,
                    secret_type: SecretType::Dynamic,
                    value: Some(serde_json::to_vec(&conn).unwrap()),
                    reference_arn: None,
                    metadata: None,
                    max_versions: None,
                    retention_days: None,
                    expires_at: None,
                    owner_user_id: "u1".into(),
                },
                AuditContext::default(),
            )
            .unwrap();
    }

    #[test]
    fn create_lease_mints_unique_username_and_excludes_password_from_metadata() {
        let (secrets, lease_svc) = setup();
        dynamic_secret(&secrets, Value::from(5432));

        let lease = lease_svc.create("t1", "db/orders", None, "u1", AuditContext::default()).unwrap();
        assert_eq!(lease.status, LeaseStatus::Active);
        assert!(!lease.metadata_json.contains("supersecret"));
        assert!(lease.metadata_json.contains("username"));
    }

    #[test]
    fn port_accepts_both_string_and_integer_json_forms() {
        let (secrets, lease_svc) = setup();
        dynamic_secret(&secrets, Value::from("5432"));
        let lease = lease_svc.create("t1", "db/orders", None, "u1", AuditContext::default()).unwrap();
        assert!(lease.metadata_json.contains("5432"));
    }

    #[test]
    fn ttl_is_capped_at_configured_maximum() {
        let (secrets, lease_svc) = setup();
        dynamic_secret(&secrets, Value::from(5432));
        let lease = lease_svc.create("t1", "db/orders", Some(999_999_999), "u1", AuditContext::default()).unwrap();
        assert_eq!(lease.ttl_seconds, lease_svc.config.max_ttl_seconds);
    }

    #[test]
    fn revoke_is_idempotent_guard_against_double_revoke() {
        let (secrets, lease_svc) = setup();
        dynamic_secret(&secrets, Value::from(5432));
        let lease = lease_svc.create("t1", "db/orders", None, "u1", AuditContext::default()).unwrap();
        lease_svc.revoke(&lease.lease_id, Some("admin"), AuditContext::default()).unwrap();
        let err = lease_svc.revoke(&lease.lease_id, Some("admin"), AuditContext::default()).unwrap_err();
        assert!(matches!(err.0, VaultError::Conflict(_)));
    }

    #[test]
    fn expire_due_flips_active_expired_leases_only() {
        let (secrets, lease_svc) = setup();
        dynamic_secret(&secrets, Value::from(5432));
        let lease = lease_svc.create("t1", "db/orders", Some(1), "u1", AuditContext::default()).unwrap();

        let future = Utc::now() + ChronoDuration::seconds(5);
        let expired_count = lease_svc.expire_due(future).unwrap();
        assert_eq!(expired_count, 1);

        let reloaded = lease_svc.get(&lease.lease_id).unwrap();
        assert_eq!(reloaded.status, LeaseStatus::Expired);
    }

    #[test]
    fn create_from_static_secret_is_rejected() {
        let (secrets, lease_svc) = setup();
        secrets
            .create(
                CreateSecretRequest {
                    team_id: "t1".into(),
                    path: "static/one".into(),
                    name: "static-one".into(),
                    description: None,
                    secret_type: SecretType::Static,
                    value: Some(b"v".to_vec()),
                    reference_arn: None,
                    metadata: None,
                    max_versions: None,
                    retention_days: None,
                    expires_at: None,
                    owner_user_id: "u1".into(),
                },
                AuditContext::default(),
            )
            .unwrap();
        let err = lease_svc.create("t1", "static/one", None, "u1", AuditContext::default()).unwrap_err();
        assert!(matches!(err.0, VaultError::Validation(_)));
    }
}
