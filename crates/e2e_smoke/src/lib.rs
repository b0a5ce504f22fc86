//! Loopback harness: a canned REST upstream and helpers that boot the real
//! gateway router against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use unigraph_gateway::config::GatewayConfig;

/// Counts what the gateway asked the upstream for.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    posts_calls: AtomicUsize,
    user_queries: Mutex<Vec<Option<String>>>,
}

impl UpstreamStats {
    pub fn posts_calls(&self) -> usize {
        self.posts_calls.load(Ordering::SeqCst)
    }

    /// Raw query strings of every `/users` call, in arrival order.
    pub fn user_queries(&self) -> Vec<Option<String>> {
        self.user_queries
            .lock()
            .map(|q| q.clone())
            .unwrap_or_default()
    }
}

fn user(id: i64) -> Value {
    json!({
        "id": id,
        "name": format!("Upstream User {}", id),
        "username": format!("upstream{}", id),
        "email": format!("upstream{}@example.test", id),
        "company": { "name": "Loopback Ltd", "catchPhrase": "Always local" },
    })
}

pub fn upstream_app(stats: Arc<UpstreamStats>) -> Router {
    Router::new()
        .route("/posts", get(posts))
        .route("/users", get(users))
        .with_state(stats)
}

async fn posts(State(stats): State<Arc<UpstreamStats>>) -> Json<Value> {
    stats.posts_calls.fetch_add(1, Ordering::SeqCst);
    let posts = (1..=6)
        .map(|id| {
            json!({
                "id": id,
                "userId": (id - 1) / 2 + 1,
                "title": format!("post {}", id),
                "body": "lorem ipsum",
            })
        })
        .collect::<Vec<_>>();
    Json(Value::Array(posts))
}

async fn users(State(stats): State<Arc<UpstreamStats>>, RawQuery(query): RawQuery) -> Json<Value> {
    if let Ok(mut queries) = stats.user_queries.lock() {
        queries.push(query.clone());
    }

    let requested = query
        .as_deref()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.strip_prefix("id="))
        .filter_map(|id| id.parse::<i64>().ok())
        .collect::<Vec<_>>();

    let ids = if requested.is_empty() {
        (1..=3).collect()
    } else {
        requested
    };
    Json(Value::Array(
        ids.into_iter().filter(|id| *id <= 3).map(user).collect(),
    ))
}

pub async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    (addr, shutdown_tx, handle)
}

pub fn gateway_config(upstream: SocketAddr, extra: &[(&str, &str)]) -> GatewayConfig {
    let mut kv = HashMap::new();
    kv.insert(
        "UNIGRAPH_UPSTREAM_URL".to_string(),
        format!("http://{}", upstream),
    );
    kv.insert("UNIGRAPH_JWT_SECRET".to_string(), "smoke-secret".to_string());
    for (key, value) in extra {
        kv.insert(key.to_string(), value.to_string());
    }
    GatewayConfig::from_kv(&kv).expect("smoke config should parse")
}

pub async fn wait_for_health(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/health", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}
