//! The per-operation lifecycle: rate gate, identity, audit start, planning,
//! validation, the resolved-operation gate, execution, audit post-hooks and
//! the ledger append.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;
use ulid::Ulid;
use unigraph_auth::{TokenConfig, TokenService, UserStore};
use unigraph_contracts::{ErrorCode, GatewayError, Identity};
use unigraph_ledger::{LedgerRecord, QueryLedger};

use crate::audit::{AuditPipeline, AuditSink, AuditedError, OperationAudit, TracingAuditSink};
use crate::config::{Environment, GatewayConfig, StartupError};
use crate::graphql::{
    ExecutionOutcome, FieldError, OperationPlan, PathSegment, PlanLimits, ResolverContext,
    Services, execute, plan_operation_with, schema,
};
use crate::rate_limit::{RateDecision, RateGate};
use crate::upstream::{HttpUpstream, UpstreamSource};
use crate::validation::{CostModel, ValidationChain};

pub const GRAPHQL_PATH: &str = "/graphql";
pub const HEALTH_PATH: &str = "/health";

const HIDDEN_INTERNAL_MESSAGE: &str = "Internal server error";

/// One inbound operation as handed over by the transport.
#[derive(Debug, Clone)]
pub struct InboundOperation {
    pub path: String,
    pub headers: HeaderMap,
    pub peer_addr: Option<SocketAddr>,
    pub body: Bytes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    variables: Option<Value>,
    #[serde(default)]
    operation_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorExtensions {
    pub code: ErrorCode,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    pub extensions: ErrorExtensions,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResponseEnvelope {
    /// Absent when the operation never reached execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub status: StatusCode,
    pub envelope: ResponseEnvelope,
    pub retry_after_secs: Option<u64>,
}

impl OperationResponse {
    pub fn outcome(&self) -> &'static str {
        match self.status {
            StatusCode::TOO_MANY_REQUESTS => "rate_limited",
            StatusCode::OK if self.envelope.errors.is_empty() => "ok",
            StatusCode::OK => "partial",
            _ => "rejected",
        }
    }

    pub fn body(&self) -> Vec<u8> {
        serde_json::to_vec(&self.envelope).unwrap_or_else(|_| b"{}".to_vec())
    }
}

/// Owns every piece of process state the lifecycle touches. Dropping it (or
/// calling [`Gateway::teardown`]) discards users, logs and rate counters.
pub struct Gateway {
    environment: Environment,
    rate_gate: RateGate,
    audit: AuditPipeline,
    validation: ValidationChain,
    plan_limits: PlanLimits,
    services: Arc<Services>,
}

impl Gateway {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, StartupError> {
        let upstream = HttpUpstream::new(
            config.upstream_url.clone(),
            Duration::from_millis(config.upstream_timeout_ms),
        )
        .map_err(|err| StartupError {
            code: "ERR_UPSTREAM_CLIENT",
            message: format!("failed to initialize upstream client: {}", err),
        })?;

        Self::new(config, Arc::new(upstream), Arc::new(TracingAuditSink))
    }

    pub fn new(
        config: &GatewayConfig,
        upstream: Arc<dyn UpstreamSource>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Result<Self, StartupError> {
        let tokens = TokenService::new(TokenConfig {
            secret: config.jwt_secret.clone(),
            ttl: Duration::from_secs(config.token_ttl_secs),
            clock_skew: Duration::from_secs(config.token_clock_skew_secs),
        })
        .map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;

        let rate_gate = RateGate::new(
            config.rate_window(),
            config.rate_limit_max,
            config.rate_limit_max_keys,
        )
        .with_exempt_path(HEALTH_PATH);

        let audit = AuditPipeline::new(
            config.audit_enabled,
            config.introspection_enabled,
            config.blocked_fields.clone(),
            audit_sink,
        );

        let validation = ValidationChain::new(
            config.budget,
            CostModel::new(config.complexity_list_factor),
        );

        let services = Arc::new(Services {
            upstream,
            users: UserStore::with_demo_users(),
            tokens,
            ledger: QueryLedger::new(config.ledger_capacity),
            posts_limit: config.posts_limit,
            environment: config.environment,
            flush_trigger: config.flush_trigger(),
        });

        tracing::info!(
            environment = config.environment.as_str(),
            introspection_enabled = config.introspection_enabled,
            max_depth = config.budget.max_depth,
            max_cost = config.budget.max_cost,
            rate_limit_max = config.rate_limit_max,
            "gateway.initialized"
        );

        // Lowering never builds more field nodes than the cost budget could admit.
        let plan_limits = PlanLimits {
            max_nodes: config.budget.max_cost,
            expand_introspection: config.introspection_enabled,
        };

        Ok(Self {
            environment: config.environment,
            rate_gate,
            audit,
            validation,
            plan_limits,
            services,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn tokens(&self) -> &TokenService {
        &self.services.tokens
    }

    pub fn users(&self) -> &UserStore {
        &self.services.users
    }

    pub fn ledger(&self) -> &QueryLedger {
        &self.services.ledger
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.rate_gate
    }

    /// Charges one request against `client_key`'s window.
    pub fn admit(&self, path: &str, client_key: &str) -> Result<(), GatewayError> {
        match self.rate_gate.check(path, client_key) {
            RateDecision::Allowed | RateDecision::Exempt => Ok(()),
            RateDecision::Limited { retry_after_secs } => {
                self.audit.rate_limited(client_key, path, retry_after_secs);
                crate::metrics::observe_rejection(ErrorCode::RateLimited.as_str());
                tracing::warn!(client_key, path, retry_after_secs, "gateway.rate_limited");
                Err(GatewayError::RateLimited { retry_after_secs })
            }
        }
    }

    pub async fn handle(&self, op: InboundOperation) -> OperationResponse {
        self.handle_with(op, true).await
    }

    /// For transports that already charged the rate gate through
    /// [`Gateway::admit`] before reading the body.
    pub async fn handle_admitted(&self, op: InboundOperation) -> OperationResponse {
        self.handle_with(op, false).await
    }

    async fn handle_with(&self, op: InboundOperation, charge: bool) -> OperationResponse {
        let request_id = Ulid::new().to_string();
        let client_key = client_key(&op.headers, op.peer_addr);
        let span = tracing::info_span!(
            "graphql.operation",
            request_id = %request_id,
            client_key = %client_key,
            operation_name = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let started = Instant::now();

        async move {
            let response = self.run(&request_id, &client_key, op, charge).await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            tracing::Span::current().record("outcome", response.outcome());
            response
        }
        .instrument(span)
        .await
    }

    pub fn teardown(&self) {
        self.services.ledger.clear();
        self.rate_gate.reset();
        crate::metrics::set_ledger_entries(0);
    }

    async fn run(
        &self,
        request_id: &str,
        client_key: &str,
        op: InboundOperation,
        charge: bool,
    ) -> OperationResponse {
        if charge && let Err(err) = self.admit(&op.path, client_key) {
            return OperationResponse {
                status: StatusCode::TOO_MANY_REQUESTS,
                retry_after_secs: err.retry_after_secs(),
                envelope: ResponseEnvelope {
                    data: None,
                    errors: vec![self.response_error(&err, Vec::new())],
                },
            };
        }

        let identity = self.services.tokens.identify(&op.headers);
        let audit = self.audit.start(request_id, identity.as_ref(), client_key);

        let request = match decode_request(&op.body) {
            Ok(request) => request,
            Err(err) => return self.finish(&audit, identity.as_ref(), None, Err(err)),
        };

        let result = match self.prepare(&audit, &request) {
            Ok(plan) => {
                let ctx = ResolverContext::new(identity.clone(), Arc::clone(&self.services));
                let outcome = execute(&plan, &ctx).await;
                Ok((plan, outcome))
            }
            Err(err) => Err(err),
        };

        self.finish(&audit, identity.as_ref(), Some(&request), result)
    }

    /// Everything that must pass before a resolver runs.
    fn prepare(
        &self,
        audit: &OperationAudit,
        request: &OperationRequest,
    ) -> Result<OperationPlan, GatewayError> {
        let query = request.query.as_deref().unwrap_or_default();
        let variables = match &request.variables {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return Err(GatewayError::BadUserInput(
                    "variables must be a JSON object".to_string(),
                ));
            }
        };

        let plan = plan_operation_with(
            schema(),
            query,
            request.operation_name.as_deref(),
            variables,
            self.plan_limits,
        )?;
        tracing::Span::current().record(
            "operation_name",
            plan.name.as_deref().unwrap_or("anonymous"),
        );

        let report = self.validation.measure(&plan);
        audit.on_cost(report.cost, report.depth, self.validation.budget());
        crate::metrics::observe_query_cost(report.cost);
        self.validation.enforce(report)?;

        audit.on_operation_resolved(
            plan.name.as_deref(),
            plan.references_introspection(),
            &plan.referenced_fields(),
        )?;

        Ok(plan)
    }

    fn finish(
        &self,
        audit: &OperationAudit,
        identity: Option<&Identity>,
        request: Option<&OperationRequest>,
        result: Result<(OperationPlan, ExecutionOutcome), GatewayError>,
    ) -> OperationResponse {
        let resolved_name = result
            .as_ref()
            .ok()
            .and_then(|(plan, _)| plan.name.clone());
        let (status, kind, data, failures) = match result {
            Ok((plan, outcome)) => (
                StatusCode::OK,
                plan.kind.as_str(),
                Some(outcome.data.unwrap_or(Value::Null)),
                outcome.errors,
            ),
            Err(error) => {
                crate::metrics::observe_rejection(error.code().as_str());
                let failure = FieldError {
                    error,
                    path: Vec::new(),
                };
                (StatusCode::BAD_REQUEST, "rejected", None, vec![failure])
            }
        };

        let audited = failures
            .iter()
            .map(|failure| AuditedError {
                code: failure.error.code().as_str(),
                message: failure.error.to_string(),
                path: (!failure.path.is_empty()).then(|| failure.dotted_path()),
            })
            .collect::<Vec<_>>();
        audit.on_errors(&audited);
        let success = failures.is_empty();
        let duration_ms = audit.on_complete(!success);

        if let Some(query) = request.and_then(|r| r.query.as_deref()) {
            let first_error = failures.first().map(|failure| failure.error.to_string());
            self.services.ledger.record(LedgerRecord {
                identity,
                query,
                operation_name: request
                    .and_then(|r| r.operation_name.as_deref())
                    .or(resolved_name.as_deref()),
                duration_ms,
                success,
                error: first_error.as_deref(),
            });
            crate::metrics::set_ledger_entries(self.services.ledger.len());
        }
        crate::metrics::observe_operation(kind, success);

        OperationResponse {
            status,
            retry_after_secs: None,
            envelope: ResponseEnvelope {
                data,
                errors: failures
                    .into_iter()
                    .map(|failure| self.response_error(&failure.error, failure.path))
                    .collect(),
            },
        }
    }

    fn response_error(&self, err: &GatewayError, path: Vec<PathSegment>) -> ResponseError {
        let production = self.environment == Environment::Production;
        let message = match err {
            GatewayError::Internal(_) if production => HIDDEN_INTERNAL_MESSAGE.to_string(),
            _ => err.to_string(),
        };
        ResponseError {
            message,
            path: (!production && !path.is_empty()).then_some(path),
            extensions: ErrorExtensions {
                code: err.code(),
                retry_after: err.retry_after_secs(),
            },
        }
    }
}

fn decode_request(body: &[u8]) -> Result<OperationRequest, GatewayError> {
    let request = serde_json::from_slice::<OperationRequest>(body)
        .map_err(|err| GatewayError::BadUserInput(format!("invalid request body: {}", err)))?;
    match request.query.as_deref().map(str::trim) {
        Some(query) if !query.is_empty() => Ok(request),
        _ => Err(GatewayError::BadUserInput(
            "request body must contain a non-empty \"query\" string".to_string(),
        )),
    }
}

/// First `x-forwarded-for` entry, else the socket address.
pub fn client_key(headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer_addr.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Request body for a single operation, handy for callers building one.
pub fn operation_body(query: &str, variables: Option<Value>, operation_name: Option<&str>) -> Bytes {
    let mut body = Map::new();
    body.insert("query".to_string(), Value::from(query));
    if let Some(variables) = variables {
        body.insert("variables".to_string(), variables);
    }
    if let Some(name) = operation_name {
        body.insert("operationName".to_string(), Value::from(name));
    }
    Bytes::from(Value::Object(body).to_string())
}
