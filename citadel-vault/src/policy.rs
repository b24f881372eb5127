//! Access-control engine: wildcard path matching with deny-overrides-allow
//! evaluation.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::audit::{AuditContext, AuditRecordBuilder, AuditSink};
use crate::error::{PolicyError, ResourceKind, VaultError};
use crate::seal::SealService;
use crate::storage::{PolicyBindingRepository, PolicyRepository};
use crate::types::{random_id, AccessPolicy, BindingType, Permission, PolicyBinding};

/// Who is asking. A user carries their own id plus their team; a service
/// principal carries only its own id plus the team it's acting for.
#[derive(Clone, Debug)]
pub enum Subject {
    User { user_id: String, team_id: String },
    Service { service_id: String, team_id: String },
}

impl Subject {
    fn team_id(&self) -> &str {
        match self {
            Self::User { team_id, .. } => team_id,
            Self::Service { team_id, .. } => team_id,
        }
    }

    /// The (bindingType, targetId) pairs a subject resolves to: a user
    /// matches bindings on their own id and on their team; a service
    /// matches bindings on its own id and the team it's acting for.
    fn binding_targets(&self) -> Vec<(BindingType, String)> {
        match self {
            Self::User { user_id, team_id } => {
                vec![(BindingType::User, user_id.clone()), (BindingType::Team, team_id.clone())]
            }
            Self::Service { service_id, team_id } => {
                vec![(BindingType::Service, service_id.clone()), (BindingType::Team, team_id.clone())]
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub enum Decision {
    Allowed { policy_id: String, policy_name: String },
    Denied { policy_id: String, policy_name: String },
    DefaultDenied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn explanation(&self) -> String {
        match self {
            Self::Allowed { policy_name, .. } => format!("allowed by policy '{policy_name}'"),
            Self::Denied { policy_name, .. } => format!("denied by policy '{policy_name}'"),
            Self::DefaultDenied => "denied: no matching allow policy (default deny)".to_string(),
        }
    }
}

/// Matches a policy's `/`-separated path pattern against a request path.
/// Patterns and paths must have the same segment count; `*` matches exactly
/// one non-empty segment and never crosses a `/`. A single trailing slash is
/// normalized away; an empty pattern or path never matches.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() || path.is_empty() {
        return false;
    }
    let norm = |s: &str| s.strip_suffix('/').unwrap_or(s).to_string();
    let pattern = norm(pattern);
    let path = norm(path);

    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments.iter().zip(path_segments.iter()).all(|(p, s)| {
        if *p == "*" {
            !s.is_empty()
        } else {
            p == s
        }
    })
}

pub struct PolicyService {
    seal: Arc<SealService>,
    policies: Arc<dyn PolicyRepository>,
    bindings: Arc<dyn PolicyBindingRepository>,
    audit: Arc<dyn AuditSink>,
}

impl PolicyService {
    pub fn new(
        seal: Arc<SealService>,
        policies: Arc<dyn PolicyRepository>,
        bindings: Arc<dyn PolicyBindingRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { seal, policies, bindings, audit }
    }

    fn audit_record(&self, builder: AuditRecordBuilder, result: &Result<(), String>) {
        let entry = match result {
            Ok(()) => builder.success(),
            Err(msg) => builder.failure(msg.clone()),
        };
        crate::audit::record_safely(self.audit.as_ref(), entry);
    }

    pub fn create_policy(
        &self,
        team_id: &str,
        name: &str,
        path_pattern: &str,
        permissions: std::collections::BTreeSet<Permission>,
        is_deny_policy: bool,
        created_by_user_id: &str,
        ctx: AuditContext,
    ) -> Result<AccessPolicy, PolicyError> {
        self.seal.require_unsealed()?;
        let builder = AuditRecordBuilder::new("policy.create", "policy")
            .team(team_id.to_string())
            .user(created_by_user_id.to_string())
            .resource_id(name.to_string())
            .context(ctx);

        let outcome = (|| -> Result<AccessPolicy, PolicyError> {
            if self.policies.get_by_name(team_id, name)?.is_some() {
                return Err(VaultError::already_exists(ResourceKind::Policy, AccessPolicy::key(team_id, name)).into());
            }
            let policy = AccessPolicy {
                id: random_id("policy"),
                team_id: team_id.to_string(),
                name: name.to_string(),
                path_pattern: path_pattern.to_string(),
                permissions,
                is_deny_policy,
                is_active: true,
                created_by_user_id: created_by_user_id.to_string(),
                created_at: Utc::now(),
            };
            self.policies.put(&policy)?;
            Ok(policy)
        })();
        self.audit_record(builder, &outcome.as_ref().map(|_| ()).map_err(|e| e.to_string()));
        outcome
    }

    pub fn update_policy(
        &self,
        id: &str,
        path_pattern: Option<String>,
        permissions: Option<std::collections::BTreeSet<Permission>>,
        is_deny_policy: Option<bool>,
        is_active: Option<bool>,
    ) -> Result<AccessPolicy, VaultError> {
        self.seal.require_unsealed()?;
        let mut policy = self
            .policies
            .get(id)?
            .ok_or_else(|| VaultError::not_found(ResourceKind::Policy, id.to_string()))?;
        if let Some(p) = path_pattern {
            policy.path_pattern = p;
        }
        if let Some(p) = permissions {
            policy.permissions = p;
        }
        if let Some(d) = is_deny_policy {
            policy.is_deny_policy = d;
        }
        if let Some(a) = is_active {
            policy.is_active = a;
        }
        self.policies.put(&policy)?;
        Ok(policy)
    }

    /// Deletes a policy and cascades its bindings.
    pub fn delete_policy(&self, id: &str) -> Result<(), VaultError> {
        self.seal.require_unsealed()?;
        self.bindings.delete_by_policy(id)?;
        self.policies.delete(id)
    }

    pub fn list_policies(&self, team_id: &str, active_only: bool) -> Result<Vec<AccessPolicy>, VaultError> {
        self.seal.require_unsealed()?;
        let mut policies = self.policies.list_by_team(team_id)?;
        if active_only {
            policies.retain(|p| p.is_active);
        }
        Ok(policies)
    }

    pub fn bind(
        &self,
        policy_id: &str,
        binding_type: BindingType,
        binding_target_id: &str,
    ) -> Result<PolicyBinding, VaultError> {
        self.seal.require_unsealed()?;
        let binding = PolicyBinding {
            id: random_id("binding"),
            policy_id: policy_id.to_string(),
            binding_type,
            binding_target_id: binding_target_id.to_string(),
            created_at: Utc::now(),
        };
        self.bindings.put(&binding)?;
        Ok(binding)
    }

    pub fn unbind(&self, binding_id: &str) -> Result<(), VaultError> {
        self.seal.require_unsealed()?;
        self.bindings.delete(binding_id)
    }

    pub fn list_bindings(&self, policy_id: &str) -> Result<Vec<PolicyBinding>, VaultError> {
        self.seal.require_unsealed()?;
        self.bindings.list_by_policy(policy_id)
    }

    /// Resolves every active policy bound (directly or via team) to `subject`
    /// whose path pattern matches `path`.
    fn matching_policies(&self, subject: &Subject, path: &str) -> Result<Vec<AccessPolicy>, VaultError> {
        let targets = subject.binding_targets();
        let candidates = self.policies.list_by_team(subject.team_id())?;

        let mut matched = Vec::new();
        for policy in candidates {
            if !policy.is_active || !path_matches(&policy.path_pattern, path) {
                continue;
            }
            let bindings = self.bindings.list_by_policy(&policy.id)?;
            let bound = bindings
                .iter()
                .any(|b| targets.iter().any(|(t, id)| *t == b.binding_type && id == &b.binding_target_id));
            if bound {
                matched.push(policy);
            }
        }
        Ok(matched)
    }

    /// Deny-overrides-allow: any matching deny policy granting `permission`
    /// wins outright; otherwise any matching allow policy granting it wins;
    /// otherwise default-deny.
    pub fn evaluate(&self, subject: &Subject, path: &str, permission: Permission) -> Result<Decision, VaultError> {
        self.seal.require_unsealed()?;
        let matched = self.matching_policies(subject, path)?;

        if let Some(deny) = matched.iter().find(|p| p.is_deny_policy && p.permissions.contains(&permission)) {
            return Ok(Decision::Denied { policy_id: deny.id.clone(), policy_name: deny.name.clone() });
        }
        if let Some(allow) = matched.iter().find(|p| !p.is_deny_policy && p.permissions.contains(&permission)) {
            return Ok(Decision::Allowed { policy_id: allow.id.clone(), policy_name: allow.name.clone() });
        }
        Ok(Decision::DefaultDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::storage::InMemoryStore;
    use std::collections::BTreeSet;

    fn service() -> PolicyService {
        let seal = Arc::new(SealService::new(vec![0x22u8; 32], 5, 3, true).unwrap());
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        PolicyService::new(seal, store.clone(), store, audit)
    }

    fn perms(ps: &[Permission]) -> BTreeSet<Permission> {
        ps.iter().copied().collect()
    }

    #[test]
    fn path_matches_single_wildcard_segment() {
        assert!(path_matches("team/*/db-password", "team/prod/db-password"));
        assert!(!path_matches("team/*/db-password", "team/prod/staging/db-password"));
        assert!(!path_matches("team/*/db-password", "team//db-password"));
    }

    #[test]
    fn path_matches_requires_equal_segment_count() {
        assert!(!path_matches("a/b", "a/b/c"));
        assert!(!path_matches("a/b/c", "a/b"));
    }

    #[test]
    fn path_matches_normalizes_single_trailing_slash() {
        assert!(path_matches("team/prod/", "team/prod"));
        assert!(path_matches("team/prod", "team/prod/"));
    }

    #[test]
    fn path_matches_rejects_empty_pattern_or_path() {
        assert!(!path_matches("", "team/prod"));
        assert!(!path_matches("team/prod", ""));
    }

    #[test]
    fn deny_overrides_allow_even_with_multiple_matches() {
        let svc = service();
        let ctx = AuditContext::default();
        let allow = svc
            .create_policy("t1", "allow-all", "team/*", perms(&[Permission::Read]), false, "u1", ctx.clone())
            .unwrap();
        let deny = svc
            .create_policy("t1", "deny-prod", "team/prod", perms(&[Permission::Read]), true, "u1", ctx)
            .unwrap();
        svc.bind(&allow.id, BindingType::User, "alice").unwrap();
        svc.bind(&deny.id, BindingType::User, "alice").unwrap();

        let subject = Subject::User { user_id: "alice".into(), team_id: "t1".into() };
        let decision = svc.evaluate(&subject, "team/prod", Permission::Read).unwrap();
        assert!(!decision.is_allowed());
        assert!(matches!(decision, Decision::Denied { .. }));
    }

    #[test]
    fn no_matching_policy_is_default_denied() {
        let svc = service();
        let subject = Subject::User { user_id: "alice".into(), team_id: "t1".into() };
        let decision = svc.evaluate(&subject, "team/prod/secret", Permission::Read).unwrap();
        assert!(matches!(decision, Decision::DefaultDenied));
    }

    #[test]
    fn team_binding_grants_access_to_every_team_member() {
        let svc = service();
        let ctx = AuditContext::default();
        let allow = svc
            .create_policy("t1", "team-read", "team/*", perms(&[Permission::Read]), false, "u1", ctx)
            .unwrap();
        svc.bind(&allow.id, BindingType::Team, "t1").unwrap();

        let subject = Subject::User { user_id: "bob".into(), team_id: "t1".into() };
        let decision = svc.evaluate(&subject, "team/staging", Permission::Read).unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let svc = service();
        let ctx = AuditContext::default();
        let allow = svc
            .create_policy("t1", "p", "team/*", perms(&[Permission::Read]), false, "u1", ctx)
            .unwrap();
        svc.bind(&allow.id, BindingType::User, "alice").unwrap();
        let err = svc.bind(&allow.id, BindingType::User, "alice").unwrap_err();
        assert!(matches!(err, VaultError::AlreadyExists { .. }));
    }

    #[test]
    fn inactive_policy_never_matches() {
        let svc = service();
        let ctx = AuditContext::default();
        let allow = svc
            .create_policy("t1", "p", "team/*", perms(&[Permission::Read]), false, "u1", ctx)
            .unwrap();
        svc.bind(&allow.id, BindingType::User, "alice").unwrap();
        svc.update_policy(&allow.id, None, None, None, Some(false)).unwrap();

        let subject = Subject::User { user_id: "alice".into(), team_id: "t1".into() };
        let decision = svc.evaluate(&subject, "team/prod", Permission::Read).unwrap();
        assert!(matches!(decision, Decision::DefaultDenied));
    }
}
