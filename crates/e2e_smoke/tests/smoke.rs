use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::{Value, json};
use unigraph_e2e_smoke::{
    UpstreamStats, gateway_config, spawn_server, upstream_app, wait_for_health,
};

struct Harness {
    client: reqwest::Client,
    gateway: SocketAddr,
    stats: Arc<UpstreamStats>,
    shutdowns: Vec<tokio::sync::oneshot::Sender<()>>,
}

impl Harness {
    async fn start(extra: &[(&str, &str)]) -> Self {
        let stats = Arc::new(UpstreamStats::default());
        let (upstream_addr, upstream_shutdown, _) = spawn_server(upstream_app(stats.clone())).await;

        let config = gateway_config(upstream_addr, extra);
        let app = unigraph_gateway::http::router(config).expect("gateway router should build");
        let (gateway, gateway_shutdown, _) = spawn_server(app).await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("client should build");
        wait_for_health(&client, gateway).await;

        Self {
            client,
            gateway,
            stats,
            shutdowns: vec![upstream_shutdown, gateway_shutdown],
        }
    }

    async fn graphql(&self, body: Value, token: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("http://{}/graphql", self.gateway))
            .json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.expect("graphql request should send")
    }

    async fn query(&self, query: &str, token: Option<&str>) -> (u16, Value) {
        let response = self.graphql(json!({ "query": query }), token).await;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.expect("json body");
        (status, body)
    }

    fn stop(self) {
        for shutdown in self.shutdowns {
            let _ = shutdown.send(());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_login_then_me_round_trips_identity() {
    let harness = Harness::start(&[]).await;

    let response = harness
        .graphql(
            json!({
                "query": "mutation Login($u: String!, $p: String!) { login(username: $u, password: $p) { token user { id username role } } }",
                "variables": { "u": "admin", "p": "admin123" },
                "operationName": "Login",
            }),
            None,
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body = response.json::<Value>().await.expect("json body");
    let token = body["data"]["login"]["token"]
        .as_str()
        .expect("token should be issued")
        .to_string();
    assert_eq!(
        body["data"]["login"]["user"],
        json!({ "id": "1", "username": "admin", "role": "admin" })
    );

    let (status, me) = harness.query("{ me { id username role name } }", Some(&token)).await;
    assert_eq!(status, 200);
    assert_eq!(
        me["data"]["me"],
        json!({ "id": "1", "username": "admin", "role": "admin", "name": "System Admin" })
    );

    let (_, logs) = harness
        .query("{ queryLogs(limit: 5) { username operationName success } }", Some(&token))
        .await;
    let logs = logs["data"]["queryLogs"].as_array().expect("logs list").clone();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1]["operationName"], "Login");

    let (_, tampered) = harness
        .query("{ me { id } }", Some(&format!("{}x", token)))
        .await;
    assert_eq!(tampered["errors"][0]["extensions"]["code"], "UNAUTHENTICATED");

    harness.stop();
}

async fn assert_post_authors_coalesce(extra: &[(&str, &str)]) {
    let harness = Harness::start(extra).await;

    for _ in 0..5 {
        let (status, body) = harness.query("{ posts { id user { id name } } }", None).await;
        assert_eq!(status, 200);
        let posts = body["data"]["posts"].as_array().expect("posts list");
        assert_eq!(posts.len(), 6);
        assert_eq!(posts[0]["user"]["name"], "Upstream User 1");
        assert_eq!(posts[5]["user"]["id"], "3");
    }

    assert_eq!(harness.stats.posts_calls(), 5);
    let user_queries = harness.stats.user_queries();
    assert_eq!(user_queries.len(), 5, "queries: {:?}", user_queries);
    assert!(
        user_queries
            .iter()
            .all(|q| q.as_deref() == Some("id=1&id=2&id=3")),
        "queries: {:?}",
        user_queries
    );

    harness.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn smoke_post_authors_coalesce_with_default_trigger() {
    assert_post_authors_coalesce(&[]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_post_authors_coalesce_with_delay_trigger() {
    assert_post_authors_coalesce(&[("UNIGRAPH_BATCH_DELAY_MS", "10")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_rate_gate_limits_graphql_but_not_health() {
    let harness = Harness::start(&[("UNIGRAPH_RATE_LIMIT_MAX", "3")]).await;

    for _ in 0..3 {
        let (status, _) = harness.query("{ health { status } }", None).await;
        assert_eq!(status, 200);
    }

    let limited = harness.graphql(json!({ "query": "{ health { status } }" }), None).await;
    assert_eq!(limited.status().as_u16(), 429);
    let retry_after = limited
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .expect("retry-after header");
    assert!(retry_after >= 1 && retry_after <= 900);
    let body = limited.json::<Value>().await.expect("json body");
    assert_eq!(body["errors"][0]["extensions"]["code"], "RATE_LIMITED");
    assert_eq!(body["errors"][0]["extensions"]["retryAfter"], retry_after);

    let health = harness
        .client
        .get(format!("http://{}/health", harness.gateway))
        .send()
        .await
        .expect("health request");
    assert_eq!(health.status().as_u16(), 200);
    let health = health.json::<Value>().await.expect("json body");
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["environment"], "development");

    harness.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_introspection_gate_follows_config() {
    let open = Harness::start(&[]).await;
    let (status, body) = open
        .query("{ __type(name: \"Post\") { name fields { name } } }", None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["__type"]["name"], "Post");
    open.stop();

    let closed = Harness::start(&[("UNIGRAPH_INTROSPECTION_ENABLED", "false")]).await;
    let (status, body) = closed.query("{ __schema { types { name } } }", None).await;
    assert_eq!(status, 400);
    assert_eq!(body["errors"][0]["extensions"]["code"], "INTROSPECTION_DISABLED");
    assert!(body.get("data").is_none());
    closed.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_depth_limit_rejects_without_upstream_calls() {
    let harness = Harness::start(&[("UNIGRAPH_QUERY_DEPTH_LIMIT", "2")]).await;

    let (status, body) = harness
        .query("{ posts { user { company { name } } } }", None)
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["errors"][0]["extensions"]["code"], "DEPTH_LIMIT_EXCEEDED");
    assert_eq!(harness.stats.posts_calls(), 0);
    assert!(harness.stats.user_queries().is_empty());

    harness.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_metrics_and_audit_logs_are_emitted() {
    let log_buf = init_test_tracing();
    let harness = Harness::start(&[]).await;

    let (status, _) = harness.query("{ users { name } }", None).await;
    assert_eq!(status, 200);

    let metrics = harness
        .client
        .get(format!("http://{}/metrics", harness.gateway))
        .send()
        .await
        .expect("metrics request")
        .text()
        .await
        .expect("metrics body");
    assert!(metrics.contains("unigraph_http_requests_total"));
    assert!(metrics.contains("unigraph_query_cost"));

    harness.stop();

    let logs = String::from_utf8(
        log_buf
            .lock()
            .expect("log lock should be available")
            .clone(),
    )
    .expect("logs should be valid utf-8");
    assert!(
        logs.lines()
            .any(|line| line.contains("unigraph::audit") && line.contains("request_complete")),
        "expected audit events in logs:\n{}",
        logs
    );
    assert!(logs.contains("graphql.operation"));
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
