// Audit trail for namespace and lifecycle operations.
//
// Every mutating operation and access-checked read appends exactly one
// entry per successful attempt. Entries are retained in a bounded
// in-memory trail with monotonic sequence numbers and can be forwarded to
// the injected sink; transient sink failures are retried with bounded
// backoff.

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ports::{AuditSink, Clock};

/// Value recorded in place of sensitive payloads.
pub const REDACTED: &str = "[REDACTED]";

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Monotonic sequence number within this trail
    pub seq: u64,
    /// Namespace the operation touched, when applicable
    pub namespace: Option<Uuid>,
    /// Operation name, e.g. "namespace.create", "config.write"
    pub op: String,
    pub principal: Option<String>,
    pub ts: DateTime<Utc>,
    pub details: Value,
    pub success: bool,
    pub error: Option<String>,
}

/// Builder for audit entries; the trail assigns id, seq and timestamp.
pub struct AuditEntryBuilder {
    namespace: Option<Uuid>,
    op: String,
    principal: Option<String>,
    details: Value,
    success: bool,
    error: Option<String>,
}

impl AuditEntryBuilder {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            namespace: None,
            op: op.into(),
            principal: None,
            details: Value::Null,
            success: true,
            error: None,
        }
    }

    pub fn namespace(mut self, namespace: Uuid) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn principal(mut self, principal: Option<&str>) -> Self {
        self.principal = principal.map(|p| p.to_string());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Bounded in-memory audit trail.
pub struct AuditTrail {
    entries: Mutex<VecDeque<AuditEntry>>,
    /// Entries recorded but not yet forwarded to the sink
    pending: Mutex<VecDeque<AuditEntry>>,
    seq: AtomicU64,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl AuditTrail {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            capacity,
            clock,
        }
    }

    /// Append an entry; returns the assigned sequence number.
    pub fn record(&self, builder: AuditEntryBuilder) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            seq,
            namespace: builder.namespace,
            op: builder.op,
            principal: builder.principal,
            ts: self.clock.now(),
            details: builder.details,
            success: builder.success,
            error: builder.error,
        };

        let mut entries = self.entries.lock();
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        drop(entries);

        self.pending.lock().push_back(entry);
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Entries for one namespace inside a time range.
    pub fn entries_for(
        &self,
        namespace: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.namespace == Some(namespace) && e.ts >= from && e.ts <= to)
            .cloned()
            .collect()
    }

    /// Entries matching an operation prefix (e.g. "config.").
    pub fn entries_matching(&self, op_prefix: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.op.starts_with(op_prefix))
            .cloned()
            .collect()
    }

    /// Forward pending entries to the sink. Transient failures are retried
    /// up to `max_attempts` with doubling backoff starting at
    /// `initial_backoff`; an entry that keeps failing goes back to the
    /// front of the pending queue for the next flush.
    pub async fn flush_to_sink(
        &self,
        sink: &dyn AuditSink,
        max_attempts: u32,
        initial_backoff: Duration,
    ) -> usize {
        let mut flushed = 0;
        loop {
            let entry = match self.pending.lock().pop_front() {
                Some(entry) => entry,
                None => break,
            };

            let mut backoff = initial_backoff;
            let mut delivered = false;
            for attempt in 1..=max_attempts {
                match sink.publish(&entry).await {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    Err(e) => {
                        warn!("audit entry {} not delivered: {}", entry.seq, e);
                        break;
                    }
                }
            }

            if delivered {
                flushed += 1;
            } else {
                self.pending.lock().push_front(entry);
                break;
            }
        }
        flushed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
