//! Rotation: generates a fresh secret value per a policy's strategy and
//! commits it as a new secret version, tracking a failure budget so a
//! persistently broken policy disables itself instead of retrying forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use citadel_crypto::CryptoService;

use crate::audit::{AuditContext, AuditRecordBuilder, AuditSink};
use crate::error::{RotationError, VaultError};
use crate::secret::{SecretService, UpdateSecretRequest};
use crate::storage::{RotationHistoryRepository, RotationPolicyRepository};
use crate::types::{random_id, RotationHistory, RotationPolicy, RotationStrategy};

/// Bound on how long an EXTERNAL_API rotation call may run before it's
/// treated as a failure. Chosen to comfortably cover a slow credential
/// provider without blocking a rotation tick indefinitely.
pub const EXTERNAL_API_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RotationService {
    secrets: Arc<SecretService>,
    policies: Arc<dyn RotationPolicyRepository>,
    history: Arc<dyn RotationHistoryRepository>,
    audit: Arc<dyn AuditSink>,
    http_timeout: Duration,
}

impl RotationService {
    pub fn new(
        secrets: Arc<SecretService>,
        policies: Arc<dyn RotationPolicyRepository>,
        history: Arc<dyn RotationHistoryRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { secrets, policies, history, audit, http_timeout: EXTERNAL_API_TIMEOUT }
    }

    pub fn set_policy(&self, policy: RotationPolicy) -> Result<(), VaultError> {
        self.policies.put(&policy)
    }

    pub fn get_policy(&self, secret_id: &str) -> Result<Option<RotationPolicy>, VaultError> {
        self.policies.get(secret_id)
    }

    fn generate_value(&self, policy: &RotationPolicy) -> Result<Vec<u8>, VaultError> {
        match policy.strategy {
            RotationStrategy::RandomGenerate => {
                let length = policy.random_length.unwrap_or(32) as usize;
                let charset = policy.random_charset.as_deref().unwrap_or("alphanumeric");
                Ok(CryptoService::generate_random_string(length, charset)?.into_bytes())
            }
            RotationStrategy::ExternalApi => self.fetch_external_value(policy),
            RotationStrategy::CustomScript => {
                Err(VaultError::NotImplemented("CUSTOM_SCRIPT rotation strategy is not yet implemented".into()))
            }
        }
    }

    fn fetch_external_value(&self, policy: &RotationPolicy) -> Result<Vec<u8>, VaultError> {
        let url = policy
            .external_api_url
            .as_deref()
            .ok_or_else(|| VaultError::validation("externalApiUrl is required for EXTERNAL_API rotation"))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| VaultError::RotationFailed(format!("failed to build HTTP client: {e}")))?;
        let mut request = client.get(url);

        if let Some(headers_json) = &policy.external_api_headers_json {
            let headers: HashMap<String, String> = serde_json::from_str(headers_json)
                .map_err(|e| VaultError::validation(format!("externalApiHeadersJson is not valid JSON: {e}")))?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .map_err(|e| VaultError::RotationFailed(format!("external API request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(VaultError::RotationFailed(format!(
                "external API returned status {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .map_err(|e| VaultError::RotationFailed(format!("failed to read external API response: {e}")))?
            .to_vec();
        if body.is_empty() {
            return Err(VaultError::RotationFailed("external API returned an empty body".into()));
        }
        Ok(body)
    }

    /// Rotates one secret per its policy. Always advances `nextRotationAt`
    /// so a failing policy doesn't retry on every tick; tracks a failure
    /// budget and deactivates the policy once `maxFailures` is reached.
    pub fn rotate_one(&self, mut policy: RotationPolicy, ctx: AuditContext) -> Result<(), RotationError> {
        let (team_id, path) = crate::types::Secret::split_id(&policy.secret_id)
            .ok_or_else(|| VaultError::Internal(format!("malformed secret id '{}'", policy.secret_id)))?;
        let builder = AuditRecordBuilder::new("rotation.rotate", "secret")
            .team(team_id.to_string())
            .path(path.to_string())
            .context(ctx);

        let secret = self.secrets.get_metadata(team_id, path).map_err(|e| e.0)?;
        let previous_version = secret.current_version;
        let started = Utc::now();

        let result = self
            .generate_value(&policy)
            .and_then(|value| {
                self.secrets
                    .update(
                        team_id,
                        path,
                        UpdateSecretRequest {
                            value: Some(value),
                            change_description: Some(format!("rotated by {}", policy.strategy)),
                            updated_by_user_id: "system-rotation".to_string(),
                            ..Default::default()
                        },
                        AuditContext::default(),
                    )
                    .map_err(|e| e.0)
            })
            .and_then(|updated| {
                self.secrets.mark_rotated(team_id, path)?;
                Ok(updated.current_version)
            });

        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;
        let now = Utc::now();
        policy.next_rotation_at = now + chrono::Duration::hours(policy.rotation_interval_hours as i64);

        let outcome = match &result {
            Ok(new_version) => {
                policy.failure_count = 0;
                policy.last_rotated_at = Some(now);
                self.history.append(&RotationHistory {
                    id: random_id("rotation"),
                    secret_id: policy.secret_id.clone(),
                    path_snapshot: path.to_string(),
                    strategy: policy.strategy,
                    previous_version,
                    new_version: Some(*new_version),
                    success: true,
                    error_message: None,
                    duration_ms,
                    triggered_by_user_id: None,
                    created_at: now,
                })?;
                Ok(())
            }
            Err(e) => {
                policy.failure_count += 1;
                if policy.max_failures > 0 && policy.failure_count >= policy.max_failures {
                    policy.is_active = false;
                }
                self.history.append(&RotationHistory {
                    id: random_id("rotation"),
                    secret_id: policy.secret_id.clone(),
                    path_snapshot: path.to_string(),
                    strategy: policy.strategy,
                    previous_version,
                    new_version: None,
                    success: false,
                    error_message: Some(e.to_string()),
                    duration_ms,
                    triggered_by_user_id: None,
                    created_at: now,
                })?;
                Err(e.to_string())
            }
        };

        self.policies.put(&policy)?;
        self.audit_record(builder, &outcome);
        result.map(|_| ()).map_err(RotationError)
    }

    fn audit_record(&self, builder: AuditRecordBuilder, outcome: &Result<(), String>) {
        let entry = match outcome {
            Ok(()) => builder.success(),
            Err(msg) => builder.failure(msg.clone()),
        };
        crate::audit::record_safely(self.audit.as_ref(), entry);
    }

    /// Rotates every policy due at `now`. One policy's failure never stops
    /// the rest.
    pub fn rotate_due(&self, now: chrono::DateTime<Utc>) -> Result<(), VaultError> {
        for policy in self.policies.list_due(now)? {
            if let Err(e) = self.rotate_one(policy, AuditContext::default()) {
                tracing::warn!(error = %e, "scheduled rotation failed");
            }
        }
        Ok(())
    }
}
