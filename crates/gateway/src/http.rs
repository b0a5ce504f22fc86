use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use unigraph_contracts::GatewayError;

use crate::config::{GatewayConfig, StartupError};
use crate::pipeline::{
    ErrorExtensions, GRAPHQL_PATH, Gateway, HEALTH_PATH, InboundOperation, ResponseEnvelope,
    ResponseError, client_key,
};

const METRICS_PATH: &str = "/metrics";

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    max_body_bytes: usize,
}

pub fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let gateway = Gateway::from_config(&config)?;
    Ok(router_with(&config, Arc::new(gateway)))
}

/// Router over an already built gateway, so callers can keep a handle to it.
pub fn router_with(config: &GatewayConfig, gateway: Arc<Gateway>) -> Router {
    let state = AppState {
        gateway,
        max_body_bytes: config.max_body_bytes,
    };

    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(METRICS_PATH, get(metrics))
        .route(GRAPHQL_PATH, post(graphql))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    environment: &'static str,
}

async fn health(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let key = client_key(request.headers(), peer_addr(&request));

    let response = match state.gateway.admit(HEALTH_PATH, &key) {
        Ok(()) => Json(HealthResponse {
            status: "healthy",
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            environment: state.gateway.environment().as_str(),
        })
        .into_response(),
        Err(err) => error_response(StatusCode::TOO_MANY_REQUESTS, &err),
    };

    observe(HEALTH_PATH, "GET", &response, started);
    response
}

async fn metrics(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let key = client_key(request.headers(), peer_addr(&request));

    let response = match state.gateway.admit(METRICS_PATH, &key) {
        Err(err) => error_response(StatusCode::TOO_MANY_REQUESTS, &err),
        Ok(()) => match crate::metrics::render() {
            Ok((body, content_type)) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                    headers.insert(header::CONTENT_TYPE, value);
                }
                (headers, body).into_response()
            }
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
    };

    observe(METRICS_PATH, "GET", &response, started);
    response
}

async fn graphql(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let peer_addr = peer_addr(&request);
    let key = client_key(request.headers(), peer_addr);
    if let Err(err) = state.gateway.admit(GRAPHQL_PATH, &key) {
        let response = error_response(StatusCode::TOO_MANY_REQUESTS, &err);
        observe(GRAPHQL_PATH, "POST", &response, started);
        return response;
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => {
            let response = error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &GatewayError::BadUserInput(format!(
                    "request body exceeds {} bytes",
                    state.max_body_bytes
                )),
            );
            observe(GRAPHQL_PATH, "POST", &response, started);
            return response;
        }
    };

    let outcome = state
        .gateway
        .handle_admitted(InboundOperation {
            path: GRAPHQL_PATH.to_string(),
            headers: parts.headers,
            peer_addr,
            body,
        })
        .await;

    let mut response = (
        outcome.status,
        [(header::CONTENT_TYPE, "application/json")],
        outcome.body(),
    )
        .into_response();
    if let Some(secs) = outcome.retry_after_secs
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }

    observe(GRAPHQL_PATH, "POST", &response, started);
    response
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn error_response(status: StatusCode, err: &GatewayError) -> Response {
    let envelope = error_envelope(err);
    let mut response = (status, Json(envelope)).into_response();
    if let Some(secs) = err.retry_after_secs()
        && let Ok(value) = HeaderValue::from_str(&secs.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn error_envelope(err: &GatewayError) -> ResponseEnvelope {
    ResponseEnvelope {
        data: None,
        errors: vec![ResponseError {
            message: err.to_string(),
            path: None,
            extensions: ErrorExtensions {
                code: err.code(),
                retry_after: err.retry_after_secs(),
            },
        }],
    }
}

fn observe(route: &str, method: &str, response: &Response, started: Instant) {
    crate::metrics::observe_http_request(
        route,
        method,
        response.status().as_u16(),
        started.elapsed(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::testing::FakeUpstream;
    use axum::body::Body;
    use serde_json::json;
    use std::collections::HashMap;
    use unigraph_contracts::ErrorCode;

    fn state(pairs: &[(&str, &str)]) -> AppState {
        let kv = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        let config = GatewayConfig::from_kv(&kv).expect("config should parse");
        let gateway = Gateway::new(
            &config,
            Arc::new(FakeUpstream::new()),
            Arc::new(MemoryAuditSink::new()),
        )
        .expect("gateway should build");
        AppState {
            gateway: Arc::new(gateway),
            max_body_bytes: config.max_body_bytes,
        }
    }

    fn post(body: impl Into<Body>) -> Request {
        http::Request::builder()
            .method("POST")
            .uri(GRAPHQL_PATH)
            .header("x-forwarded-for", "203.0.113.9")
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    #[tokio::test]
    async fn rate_gate_runs_before_the_body_is_read() {
        let state = state(&[
            ("UNIGRAPH_RATE_LIMIT_MAX", "1"),
            ("UNIGRAPH_MAX_BODY_BYTES", "64"),
        ]);
        let oversized = format!("{{\"query\": \"{}\"}}", "x".repeat(256));

        let first = graphql(State(state.clone()), post(oversized.clone())).await;
        assert_eq!(first.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let second = graphql(State(state.clone()), post(oversized)).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().get(header::RETRY_AFTER).is_some());
        assert_eq!(
            state
                .gateway
                .rate_gate()
                .current_count("203.0.113.9", Instant::now()),
            1
        );
    }

    #[tokio::test]
    async fn admitted_operation_is_charged_once() {
        let state = state(&[("UNIGRAPH_RATE_LIMIT_MAX", "2")]);
        let body = r#"{"query": "{ health { status } }"}"#;

        for _ in 0..2 {
            let ok = graphql(State(state.clone()), post(body)).await;
            assert_eq!(ok.status(), StatusCode::OK);
        }
        let limited = graphql(State(state.clone()), post(body)).await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn rate_limited_envelope_carries_retry_after() {
        let err = GatewayError::RateLimited {
            retry_after_secs: 30,
        };
        let envelope = serde_json::to_value(error_envelope(&err)).unwrap();
        assert_eq!(
            envelope,
            json!({
                "errors": [{
                    "message": "Too many requests, please try again later.",
                    "extensions": { "code": "RATE_LIMITED", "retryAfter": 30 }
                }]
            })
        );

        let response = error_response(StatusCode::TOO_MANY_REQUESTS, &err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn oversized_body_error_has_no_retry_header() {
        let response = error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &GatewayError::BadUserInput("too big".to_string()),
        );
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(
            error_envelope(&GatewayError::BadUserInput("x".to_string())).errors[0]
                .extensions
                .code,
            ErrorCode::BadUserInput
        );
    }
}
