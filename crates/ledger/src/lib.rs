use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Serialize;
use unigraph_contracts::canonical;
use unigraph_contracts::{ANONYMOUS_ID, ANONYMOUS_USERNAME, Identity, Role};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const MAX_QUERY_CHARS: usize = 500;
pub const ANONYMOUS_OPERATION: &str = "anonymous";

/// One recorded operation. Query text is already redacted and truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: u64,
    pub timestamp: String,
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub query: String,
    /// Fingerprint of the redacted, untruncated text.
    pub query_hash: String,
    pub operation_name: String,
    pub duration: u64,
    pub success: bool,
    pub error: Option<String>,
}

pub struct LedgerRecord<'a> {
    pub identity: Option<&'a Identity>,
    pub query: &'a str,
    pub operation_name: Option<&'a str>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityStats {
    pub username: String,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct Inner {
    entries: VecDeque<LedgerEntry>,
    next_seq: u64,
    capacity: usize,
}

/// Bounded, newest-last ring of operation history. Oldest entries are evicted
/// once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct QueryLedger {
    inner: Arc<Mutex<Inner>>,
}

impl Default for QueryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueryLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                next_seq: 1,
                capacity,
            })),
        }
    }

    pub fn record(&self, record: LedgerRecord<'_>) -> u64 {
        let (user_id, username, role) = match record.identity {
            Some(identity) => (identity.id.clone(), identity.username.clone(), identity.role),
            None => (
                ANONYMOUS_ID.to_string(),
                ANONYMOUS_USERNAME.to_string(),
                Role::Guest,
            ),
        };

        let redacted = redact_passwords(record.query);
        let query_hash = canonical::operation_fingerprint(&redacted);
        let query = truncate_chars(&redacted);

        let mut inner = self.lock();
        let id = inner.next_seq;
        inner.next_seq += 1;

        let entry = LedgerEntry {
            id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id,
            username,
            role,
            query,
            query_hash,
            operation_name: record
                .operation_name
                .unwrap_or(ANONYMOUS_OPERATION)
                .to_string(),
            duration: record.duration_ms,
            success: record.success,
            error: record.error.map(str::to_string),
        };

        tracing::debug!(
            ledger_id = id,
            user_id = %entry.user_id,
            operation_name = %entry.operation_name,
            success = entry.success,
            duration_ms = entry.duration,
            "ledger.query_log"
        );

        while inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        id
    }

    /// Most recent first, optionally restricted to one identity id.
    pub fn query(&self, user_id: Option<&str>, limit: usize) -> Vec<LedgerEntry> {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .rev()
            .filter(|entry| user_id.is_none_or(|id| entry.user_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> Vec<IdentityStats> {
        let inner = self.lock();
        let mut by_username: BTreeMap<&str, IdentityStats> = BTreeMap::new();
        for entry in inner.entries.iter() {
            let stats = by_username
                .entry(entry.username.as_str())
                .or_insert_with(|| IdentityStats {
                    username: entry.username.clone(),
                    total: 0,
                    success: 0,
                    failed: 0,
                });
            stats.total += 1;
            if entry.success {
                stats.success += 1;
            } else {
                stats.failed += 1;
            }
        }
        by_username.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.next_seq = 1;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

static PASSWORD_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"password\s*:\s*"(?:[^"\\]|\\.)*""#).unwrap());

/// Redacts `password: "..."` literals, then truncates to [`MAX_QUERY_CHARS`].
pub fn sanitize_query(query: &str) -> String {
    truncate_chars(&redact_passwords(query))
}

fn redact_passwords(query: &str) -> Cow<'_, str> {
    PASSWORD_LITERAL.replace_all(query, r#"password: "***""#)
}

fn truncate_chars(text: &str) -> String {
    match text.char_indices().nth(MAX_QUERY_CHARS) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
