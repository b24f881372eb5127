//! # Citadel Vault
//!
//! Multi-tenant secrets management: envelope-encrypted secret storage with
//! versioning and retention, transit encryption-as-a-service, deny-overrides
//! -allow policy gating, scheduled rotation with a failure budget, and
//! short-lived dynamic database credentials.
//!
//! Every data-plane operation is gated behind the seal/unseal state machine
//! in [`seal`]; nothing in [`secret`], [`transit`], [`policy`], [`rotation`]
//! or [`lease`] can touch plaintext while sealed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use citadel_vault::*;
//! use std::sync::Arc;
//!
//! let seal = Arc::new(SealService::new(master_key, 5, 3, true).unwrap());
//! let store = Arc::new(InMemoryStore::new());
//! let audit = Arc::new(InMemoryAuditSink::new());
//! let secrets = Arc::new(SecretService::new(seal, store.clone(), store.clone(), store.clone(), audit));
//!
//! let secret = secrets.create(CreateSecretRequest { /* ... */ }, AuditContext::default()).unwrap();
//! let value = secrets.read_value(&secret.team_id, &secret.path, AuditContext::default()).unwrap();
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod lease;
pub mod policy;
pub mod rotation;
pub mod scheduler;
pub mod seal;
pub mod secret;
pub mod shamir;
pub mod storage;
pub mod transit;
pub mod types;

pub use audit::{
    AuditContext, AuditRecordBuilder, AuditSink, FileAuditSink, InMemoryAuditSink,
    IntegrityChainAudit, TracingAuditSink,
};
pub use config::VaultConfig;
pub use error::{
    LeaseError, PolicyError, ResourceKind, RotationError, SealError, SecretError, TransitError,
    VaultError,
};
pub use lease::{LeaseService, LeaseServiceConfig};
pub use policy::{path_matches, Decision, PolicyService, Subject};
pub use rotation::RotationService;
pub use scheduler::Scheduler;
pub use seal::{SealService, SealState, SealStatus};
pub use secret::{CreateSecretRequest, SecretListFilter, SecretService, UpdateSecretRequest};
pub use storage::InMemoryStore;
pub use transit::{TransitKeyInfo, TransitService};
pub use types::{
    AccessPolicy, BindingType, DynamicLease, LeaseStatus, Permission, PolicyBinding,
    RotationHistory, RotationPolicy, RotationStrategy, Secret, SecretType, SecretVersion,
    TransitKey,
};

// ---------------------------------------------------------------------------
// End-to-end integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    struct Harness {
        secrets: Arc<SecretService>,
        transit: Arc<TransitService>,
        policies: Arc<PolicyService>,
        rotation: Arc<RotationService>,
        leases: Arc<LeaseService>,
    }

    fn harness() -> Harness {
        let seal = Arc::new(SealService::new(vec![0x42u8; 32], 5, 3, true).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());

        let secrets = Arc::new(SecretService::new(
            seal.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            audit.clone(),
        ));
        let transit = Arc::new(TransitService::new(seal.clone(), store.clone(), audit.clone()));
        let policies = Arc::new(PolicyService::new(seal.clone(), store.clone(), store.clone(), audit.clone()));
        let rotation = Arc::new(RotationService::new(secrets.clone(), store.clone(), store.clone(), audit.clone()));
        let leases = Arc::new(LeaseService::new(
            seal,
            secrets.clone(),
            store,
            audit,
            LeaseServiceConfig::default(),
        ));

        Harness { secrets, transit, policies, rotation, leases }
    }

    /// A full lifecycle exercised against a real (in-memory) wiring of every
    /// service: create a secret, read it back, rotate it, gate access to it
    /// with a deny-overrides-allow policy, and mint + revoke a dynamic
    /// lease from a sibling DYNAMIC secret.
    #[test]
    fn full_secret_lifecycle_across_every_service() {
        let h = harness();

        let secret = h
            .secrets
            .create(
                CreateSecretRequest {
                    team_id: "acme".into(),
                    path: "db/password".into(),
                    name: "primary-db-password".into(),
                    description: Some("postgres primary password".into()),
                    secret_type: SecretType::Static,
                    value: Some(b"hunter2".to_vec()),
                    reference_arn: None,
                    metadata: None,
                    max_versions: Some(3),
                    retention_days: None,
                    expires_at: None,
                    owner_user_id: "alice".into(),
                },
                AuditContext::default(),
            )
            .unwrap();
        assert_eq!(secret.current_version, 1);

        let value = h.secrets.read_value("acme", "db/password", AuditContext::default()).unwrap();
        assert_eq!(value, b"hunter2");

        let mut policy = RotationPolicy {
            secret_id: secret.id(),
            strategy: RotationStrategy::RandomGenerate,
            rotation_interval_hours: 24,
            random_length: Some(20),
            random_charset: Some("alphanumeric".into()),
            external_api_url: None,
            external_api_headers_json: None,
            script_command: None,
            is_active: true,
            failure_count: 0,
            max_failures: 3,
            last_rotated_at: None,
            next_rotation_at: chrono::Utc::now(),
        };
        h.rotation.rotate_one(policy.clone(), AuditContext::default()).unwrap();
        let rotated = h.secrets.get_metadata("acme", "db/password").unwrap();
        assert_eq!(rotated.current_version, 2);
        assert_ne!(
            h.secrets.read_value("acme", "db/password", AuditContext::default()).unwrap(),
            b"hunter2"
        );
        policy.failure_count = 0;

        let allow = h
            .policies
            .create_policy(
                "acme",
                "db-readers",
                "db/*",
                BTreeSet::from([Permission::Read]),
                false,
                "alice",
                AuditContext::default(),
            )
            .unwrap();
        h.policies.bind(&allow.id, BindingType::User, "bob").unwrap();
        let deny = h
            .policies
            .create_policy(
                "acme",
                "db-readers-deny",
                "db/password",
                BTreeSet::from([Permission::Read]),
                true,
                "alice",
                AuditContext::default(),
            )
            .unwrap();
        h.policies.bind(&deny.id, BindingType::User, "bob").unwrap();

        let bob = Subject::User { user_id: "bob".into(), team_id: "acme".into() };
        let decision = h.policies.evaluate(&bob, "db/password", Permission::Read).unwrap();
        assert!(!decision.is_allowed(), "a deny policy must win over an overlapping allow");

        let key = h.transit.create_key("acme", "app-transit-key", true, false, AuditContext::default()).unwrap();
        assert_eq!(key.current_version, 1);
        let ciphertext = h.transit.encrypt("acme", "app-transit-key", b"payload", AuditContext::default()).unwrap();
        let new_version = h.transit.rotate("acme", "app-transit-key", AuditContext::default()).unwrap();
        assert_eq!(new_version, 2);
        let plaintext = h.transit.decrypt("acme", "app-transit-key", &ciphertext, AuditContext::default()).unwrap();
        assert_eq!(plaintext, b"payload");

        h.secrets
            .create(
                CreateSecretRequest {
                    team_id: "acme".into(),
                    path: "db/dynamic-creds".into(),
                    name: "orders-db-dynamic".into(),
                    description: None,
                    secret_type: SecretType::Dynamic,
                    value: Some(
                        serde_json::json!({
                            "backendType": "postgresql",
                            "host": "orders-db.acme.internal",
                            "port": 5432,
                            "database": "orders",
                            "adminUser": "postgres",
                            "adminPassword": "admin-secret",
                        })
                        .to_string()
                        .into_bytes(),
                    ),
                    reference_arn: None,
                    metadata: None,
                    max_versions: None,
                    retention_days: None,
                    expires_at: None,
                    owner_user_id: "alice".into(),
                },
                AuditContext::default(),
            )
            .unwrap();

        let lease = h
            .leases
            .create("acme", "db/dynamic-creds", Some(300), "bob", AuditContext::default())
            .unwrap();
        assert_eq!(lease.status, LeaseStatus::Active);
        assert!(!lease.metadata_json.contains("admin-secret"));

        h.leases.revoke(&lease.lease_id, Some("bob"), AuditContext::default()).unwrap();
        let revoked = h.leases.get(&lease.lease_id).unwrap();
        assert_eq!(revoked.status, LeaseStatus::Revoked);
    }

    #[test]
    fn sealed_vault_rejects_every_data_plane_call() {
        let seal = Arc::new(SealService::new(vec![0x11u8; 32], 5, 3, false).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let secrets = SecretService::new(seal, store.clone(), store.clone(), store, audit);

        let result = secrets.create(
            CreateSecretRequest {
                team_id: "acme".into(),
                path: "x".into(),
                name: "x".into(),
                description: None,
                secret_type: SecretType::Static,
                value: Some(b"v".to_vec()),
                reference_arn: None,
                metadata: None,
                max_versions: None,
                retention_days: None,
                expires_at: None,
                owner_user_id: "alice".into(),
            },
            AuditContext::default(),
        );
        assert!(matches!(result, Err(SecretError(VaultError::Sealed))));
    }
}
