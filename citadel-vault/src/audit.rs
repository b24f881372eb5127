//! Audit logging: every service operation emits a record on success or
//! failure, never both, and audit failures are swallowed and logged so they
//! never roll back the primary operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::types::AuditEntry;

/// Request-scoped context the caller attaches to an audit record.
/// Defaults match the spec's fallbacks when no request is active.
#[derive(Clone, Debug)]
pub struct AuditContext {
    pub ip_address: String,
    pub correlation_id: String,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            ip_address: "system".into(),
            correlation_id: "no-correlation-id".into(),
        }
    }
}

/// Builder for a single audit record, filled in by the service method that
/// performs the operation.
pub struct AuditRecordBuilder {
    pub team_id: Option<String>,
    pub user_id: Option<String>,
    pub operation: String,
    pub path: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details_json: String,
    pub context: AuditContext,
}

impl AuditRecordBuilder {
    pub fn new(operation: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            team_id: None,
            user_id: None,
            operation: operation.into(),
            path: None,
            resource_type: resource_type.into(),
            resource_id: None,
            details_json: "{}".into(),
            context: AuditContext::default(),
        }
    }

    pub fn team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn details(mut self, details_json: impl Into<String>) -> Self {
        self.details_json = details_json.into();
        self
    }

    pub fn context(mut self, context: AuditContext) -> Self {
        self.context = context;
        self
    }

    fn finish(self, success: bool, error_message: Option<String>) -> AuditEntry {
        AuditEntry {
            id: 0,
            team_id: self.team_id,
            user_id: self.user_id,
            operation: self.operation,
            path: self.path,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            success,
            error_message,
            ip_address: self.context.ip_address,
            correlation_id: self.context.correlation_id,
            details_json: self.details_json,
            created_at: Utc::now(),
            sequence: 0,
            prev_hash: String::new(),
        }
    }

    pub fn success(self) -> AuditEntry {
        self.finish(true, None)
    }

    pub fn failure(self, error_message: impl Into<String>) -> AuditEntry {
        self.finish(false, Some(error_message.into()))
    }
}

/// Where audit entries go. Implement this for your SIEM/log system.
///
/// Synchronous to avoid an `async_trait` dependency; sinks that need async
/// I/O should buffer internally (e.g. a channel) and flush on their own
/// schedule.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Records via `record()`, catching and logging any panic in a sink so a
/// misbehaving sink never takes down the primary operation.
pub fn record_safely(sink: &dyn AuditSink, entry: AuditEntry) {
    let entry_desc = format!("{}:{}", entry.operation, entry.resource_type);
    if let Err(_panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.record(entry))) {
        tracing::error!(operation = %entry_desc, "audit sink panicked; entry dropped");
    }
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Logs entries via the `tracing` crate.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            team_id = ?entry.team_id,
            user_id = ?entry.user_id,
            operation = %entry.operation,
            path = ?entry.path,
            resource_type = %entry.resource_type,
            resource_id = ?entry.resource_id,
            success = entry.success,
            error = ?entry.error_message,
            correlation_id = %entry.correlation_id,
            "audit"
        );
    }
}

/// Collects entries in memory, for testing.
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
    next_id: AtomicU64,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scoped query per §4.7: team-scoped, then at most one of
    /// (resourceType+resourceId) | userId | operation | path | time range |
    /// successOnly, applied in that priority order.
    pub fn query(&self, filter: &AuditQuery) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|e| filter.team_id.as_deref().map(|t| e.team_id.as_deref() == Some(t)).unwrap_or(true))
            .filter(|e| filter.matches_priority(e))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, mut entry: AuditEntry) {
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().push(entry);
    }
}

/// A single, at-most-one-active query filter, per §4.7's priority list.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    pub team_id: Option<String>,
    pub resource_type_and_id: Option<(String, String)>,
    pub user_id: Option<String>,
    pub operation: Option<String>,
    pub path: Option<String>,
    pub time_range: Option<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)>,
    pub success_only: Option<bool>,
}

impl AuditQuery {
    fn matches_priority(&self, e: &AuditEntry) -> bool {
        if let Some((rt, rid)) = &self.resource_type_and_id {
            return &e.resource_type == rt && e.resource_id.as_deref() == Some(rid.as_str());
        }
        if let Some(uid) = &self.user_id {
            return e.user_id.as_deref() == Some(uid.as_str());
        }
        if let Some(op) = &self.operation {
            return &e.operation == op;
        }
        if let Some(path) = &self.path {
            return e.path.as_deref() == Some(path.as_str());
        }
        if let Some((start, end)) = &self.time_range {
            return e.created_at >= *start && e.created_at < *end;
        }
        if let Some(success_only) = self.success_only {
            return e.success == success_only;
        }
        true
    }
}

/// Writes JSON entries to a file (append-only).
pub struct FileAuditSink {
    path: std::path::PathBuf,
    next_id: AtomicU64,
}

impl FileAuditSink {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into(), next_id: AtomicU64::new(1) }
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, mut entry: AuditEntry) {
        use std::io::Write;
        entry.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => match serde_json::to_string(&entry) {
                Ok(json) => {
                    if let Err(e) = writeln!(file, "{json}") {
                        tracing::error!(error = %e, "audit file write failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "audit entry serialize failed"),
            },
            Err(e) => tracing::error!(error = %e, path = ?self.path, "cannot open audit file"),
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity chain (tamper-evident audit log)
// ---------------------------------------------------------------------------

/// Wraps any `AuditSink` and adds a SHA-256 hash chain: each entry gets a
/// monotonic `sequence` and a `prev_hash` over the previous entry's JSON.
/// Genesis hash is `SHA-256("citadel-audit-genesis")`.
pub struct IntegrityChainAudit {
    inner: Arc<dyn AuditSink>,
    state: std::sync::Mutex<ChainState>,
}

struct ChainState {
    sequence: u64,
    prev_hash: String,
}

impl IntegrityChainAudit {
    pub fn new(inner: Arc<dyn AuditSink>) -> Self {
        use sha2::{Digest, Sha256};
        let genesis = format!("{:x}", Sha256::digest(b"citadel-audit-genesis"));
        Self {
            inner,
            state: std::sync::Mutex::new(ChainState { sequence: 0, prev_hash: genesis }),
        }
    }
}

impl AuditSink for IntegrityChainAudit {
    fn record(&self, mut entry: AuditEntry) {
        use sha2::{Digest, Sha256};

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        entry.sequence = state.sequence;
        entry.prev_hash = state.prev_hash.clone();

        if let Ok(json) = serde_json::to_string(&entry) {
            state.prev_hash = format!("{:x}", Sha256::digest(json.as_bytes()));
        }
        state.sequence += 1;
        drop(state);

        self.inner.record(entry);
    }
}
