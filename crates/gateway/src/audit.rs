//! Operation lifecycle hooks and the sinks their events go to.
//!
//! Hooks fire in a fixed order per operation: start, cost, operation resolved,
//! errors (only when there are any) and complete. Only the resolved hook can
//! fail; it is where introspection and blocked fields are gated.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use unigraph_contracts::{GatewayError, Identity, Role, ValidationBudget};

pub const AUDIT_TARGET: &str = "unigraph::audit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditedError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RequestStart {
        request_id: String,
        timestamp: String,
        user_id: Option<String>,
        username: Option<String>,
        role: Option<Role>,
        client_key: String,
    },
    QueryCost {
        request_id: String,
        cost: u64,
        max_cost: u64,
        depth: u32,
        max_depth: u32,
    },
    OperationResolved {
        request_id: String,
        operation_name: Option<String>,
        is_introspection: bool,
    },
    QueryError {
        request_id: String,
        errors: Vec<AuditedError>,
    },
    RequestComplete {
        request_id: String,
        duration_ms: u64,
        had_errors: bool,
    },
    RateLimited {
        client_key: String,
        path: String,
        retry_after_secs: u64,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::RequestStart { .. } => "request_start",
            AuditEvent::QueryCost { .. } => "query_cost",
            AuditEvent::OperationResolved { .. } => "operation_resolved",
            AuditEvent::QueryError { .. } => "query_error",
            AuditEvent::RequestComplete { .. } => "request_complete",
            AuditEvent::RateLimited { .. } => "rate_limited",
        }
    }

    fn is_warning(&self) -> bool {
        matches!(
            self,
            AuditEvent::QueryError { .. } | AuditEvent::RateLimited { .. }
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes each event as one JSON payload under the `unigraph::audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
        if event.is_warning() {
            tracing::warn!(target: AUDIT_TARGET, event = event.name(), payload = %payload, "audit");
        } else {
            tracing::info!(target: AUDIT_TARGET, event = event.name(), payload = %payload, "audit");
        }
    }
}

/// Captures events in memory for assertions.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .map(|guard| guard.iter().map(AuditEvent::name).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.events.lock() {
            guard.clear();
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event.clone());
        }
    }
}

#[derive(Clone)]
pub struct AuditPipeline {
    enabled: bool,
    introspection_enabled: bool,
    blocked_fields: Arc<BTreeSet<String>>,
    sink: Arc<dyn AuditSink>,
}

impl AuditPipeline {
    pub fn new(
        enabled: bool,
        introspection_enabled: bool,
        blocked_fields: BTreeSet<String>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            enabled,
            introspection_enabled,
            blocked_fields: Arc::new(blocked_fields),
            sink,
        }
    }

    pub fn start(
        &self,
        request_id: &str,
        identity: Option<&Identity>,
        client_key: &str,
    ) -> OperationAudit {
        self.emit(AuditEvent::RequestStart {
            request_id: request_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            user_id: identity.map(|i| i.id.clone()),
            username: identity.map(|i| i.username.clone()),
            role: identity.map(|i| i.role),
            client_key: client_key.to_string(),
        });

        OperationAudit {
            pipeline: self.clone(),
            request_id: request_id.to_string(),
            started: Instant::now(),
        }
    }

    pub fn rate_limited(&self, client_key: &str, path: &str, retry_after_secs: u64) {
        self.emit(AuditEvent::RateLimited {
            client_key: client_key.to_string(),
            path: path.to_string(),
            retry_after_secs,
        });
    }

    fn emit(&self, event: AuditEvent) {
        if self.enabled {
            self.sink.emit(&event);
        }
    }
}

/// Hooks bound to one in-flight operation.
pub struct OperationAudit {
    pipeline: AuditPipeline,
    request_id: String,
    started: Instant,
}

impl OperationAudit {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn on_cost(&self, cost: u64, depth: u32, budget: ValidationBudget) {
        self.pipeline.emit(AuditEvent::QueryCost {
            request_id: self.request_id.clone(),
            cost,
            max_cost: budget.max_cost,
            depth,
            max_depth: budget.max_depth,
        });
    }

    /// Gates run even when audit events are disabled.
    pub fn on_operation_resolved(
        &self,
        operation_name: Option<&str>,
        is_introspection: bool,
        referenced_fields: &BTreeSet<String>,
    ) -> Result<(), GatewayError> {
        self.pipeline.emit(AuditEvent::OperationResolved {
            request_id: self.request_id.clone(),
            operation_name: operation_name.map(str::to_string),
            is_introspection,
        });

        if is_introspection && !self.pipeline.introspection_enabled {
            return Err(GatewayError::IntrospectionDisabled);
        }

        if let Some(blocked) = self
            .pipeline
            .blocked_fields
            .iter()
            .find(|name| referenced_fields.contains(*name))
        {
            return Err(GatewayError::FieldBlocked(blocked.clone()));
        }

        Ok(())
    }

    pub fn on_errors(&self, errors: &[AuditedError]) {
        if errors.is_empty() {
            return;
        }
        self.pipeline.emit(AuditEvent::QueryError {
            request_id: self.request_id.clone(),
            errors: errors.to_vec(),
        });
    }

    pub fn on_complete(&self, had_errors: bool) -> u64 {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.pipeline.emit(AuditEvent::RequestComplete {
            request_id: self.request_id.clone(),
            duration_ms,
            had_errors,
        });
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit_pipeline(
        enabled: bool,
        introspection: bool,
        blocked: &[&str],
    ) -> (AuditPipeline, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let pipeline = AuditPipeline::new(
            enabled,
            introspection,
            blocked.iter().map(|s| s.to_string()).collect(),
            sink.clone(),
        );
        (pipeline, sink)
    }

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hooks_emit_in_lifecycle_order() {
        let (pipeline, sink) = audit_pipeline(true, true, &[]);
        let identity = Identity::new("1", "admin", Role::Admin, "System Admin");

        let op = pipeline.start("req-1", Some(&identity), "127.0.0.1");
        op.on_cost(41, 3, ValidationBudget::default());
        op.on_operation_resolved(Some("Posts"), false, &fields(&["posts"]))
            .unwrap();
        op.on_errors(&[AuditedError {
            code: "NOT_FOUND",
            message: "user not found".to_string(),
            path: Some("posts.0.user".to_string()),
        }]);
        op.on_complete(true);

        assert_eq!(
            sink.names(),
            vec![
                "request_start",
                "query_cost",
                "operation_resolved",
                "query_error",
                "request_complete"
            ]
        );
        match &sink.events()[0] {
            AuditEvent::RequestStart { user_id, role, .. } => {
                assert_eq!(user_id.as_deref(), Some("1"));
                assert_eq!(*role, Some(Role::Admin));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn empty_error_list_emits_nothing() {
        let (pipeline, sink) = audit_pipeline(true, true, &[]);
        let op = pipeline.start("req-2", None, "k");
        op.on_errors(&[]);
        assert_eq!(sink.names(), vec!["request_start"]);
    }

    #[test]
    fn introspection_is_rejected_when_disabled() {
        let (pipeline, sink) = audit_pipeline(true, false, &[]);
        let op = pipeline.start("req-3", None, "k");
        let err = op
            .on_operation_resolved(None, true, &fields(&["__schema"]))
            .unwrap_err();
        assert_eq!(err, GatewayError::IntrospectionDisabled);
        assert!(sink.names().contains(&"operation_resolved"));

        let (open, _) = audit_pipeline(true, true, &[]);
        let op = open.start("req-4", None, "k");
        assert!(
            op.on_operation_resolved(None, true, &fields(&["__schema"]))
                .is_ok()
        );
    }

    #[test]
    fn blocked_field_is_rejected() {
        let (pipeline, _) = audit_pipeline(true, true, &["allUsers"]);
        let op = pipeline.start("req-5", None, "k");
        assert_eq!(
            op.on_operation_resolved(None, false, &fields(&["allUsers", "id"]))
                .unwrap_err(),
            GatewayError::FieldBlocked("allUsers".to_string())
        );
        assert!(
            op.on_operation_resolved(None, false, &fields(&["posts"]))
                .is_ok()
        );
    }

    #[test]
    fn disabled_pipeline_still_enforces_gates() {
        let (pipeline, sink) = audit_pipeline(false, false, &[]);
        let op = pipeline.start("req-6", None, "k");
        assert!(
            op.on_operation_resolved(None, true, &fields(&["__type"]))
                .is_err()
        );
        op.on_complete(false);
        pipeline.rate_limited("k", "/graphql", 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let event = AuditEvent::RateLimited {
            client_key: "1.2.3.4".to_string(),
            path: "/graphql".to_string(),
            retry_after_secs: 9,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "rate_limited");
        assert_eq!(json["retry_after_secs"], 9);
    }
}
