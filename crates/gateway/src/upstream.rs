use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::batch::{BatchError, BatchFetcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    Timeout,
    Http(String),
    BadStatus(u16),
    InvalidResponse,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Timeout => write!(f, "upstream request timed out"),
            UpstreamError::Http(err) => write!(f, "upstream HTTP error: {}", err),
            UpstreamError::BadStatus(status) => write!(f, "upstream returned status {}", status),
            UpstreamError::InvalidResponse => write!(f, "upstream returned invalid JSON response"),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Http(value.to_string())
        }
    }
}

impl UpstreamError {
    fn outcome(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Http(_) => "transport",
            UpstreamError::BadStatus(_) => "bad_status",
            UpstreamError::InvalidResponse => "invalid_response",
        }
    }
}

/// The remote REST source behind the schema.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn posts(&self) -> Result<Vec<Value>, UpstreamError>;
    async fn users(&self) -> Result<Vec<Value>, UpstreamError>;
    async fn users_by_ids(&self, ids: &[i64]) -> Result<Vec<Value>, UpstreamError>;
}

#[derive(Clone)]
pub struct HttpUpstream {
    base_url: String,
    http: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(UpstreamError::from)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_list(
        &self,
        endpoint: &'static str,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, UpstreamError> {
        let result = self.fetch_list(endpoint, query).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.outcome(),
        };
        crate::metrics::observe_upstream_request(endpoint, outcome);

        match &result {
            Ok(items) => tracing::debug!(endpoint, items = items.len(), "upstream.fetch"),
            Err(err) => tracing::warn!(endpoint, error = %err, "upstream.fetch_failed"),
        }
        result
    }

    async fn fetch_list(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<Value>, UpstreamError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self.http.get(url).query(query).send().await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status().as_u16()));
        }

        resp.json::<Vec<Value>>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn posts(&self) -> Result<Vec<Value>, UpstreamError> {
        self.get_list("/posts", &[]).await
    }

    async fn users(&self) -> Result<Vec<Value>, UpstreamError> {
        self.get_list("/users", &[]).await
    }

    async fn users_by_ids(&self, ids: &[i64]) -> Result<Vec<Value>, UpstreamError> {
        let query = ids
            .iter()
            .map(|id| ("id", id.to_string()))
            .collect::<Vec<_>>();
        self.get_list("/users", &query).await
    }
}

/// Feeds `Post.user` lookups through one `/users?id=..` call per window.
pub struct UserBatchFetcher {
    upstream: Arc<dyn UpstreamSource>,
}

impl UserBatchFetcher {
    pub fn new(upstream: Arc<dyn UpstreamSource>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl BatchFetcher<i64, Value> for UserBatchFetcher {
    async fn fetch(&self, keys: &[i64]) -> Result<HashMap<i64, Value>, BatchError> {
        let users = self
            .upstream
            .users_by_ids(keys)
            .await
            .map_err(|err| BatchError::Upstream(err.to_string()))?;

        Ok(users
            .into_iter()
            .filter_map(|user| user.get("id").and_then(Value::as_i64).map(|id| (id, user)))
            .collect())
    }
}
