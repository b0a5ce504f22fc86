//! Fixtures shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use unigraph_auth::{TokenConfig, TokenService, UserStore};
use unigraph_ledger::QueryLedger;

use crate::batch::FlushTrigger;
use crate::config::Environment;
use crate::graphql::resolvers::Services;
use crate::upstream::{UpstreamError, UpstreamSource};

pub(crate) const TEST_SECRET: &str = "test-secret";

/// In-memory upstream with five posts by three authors.
#[derive(Clone, Default)]
pub(crate) struct FakeUpstream {
    user_batches: Arc<Mutex<Vec<Vec<i64>>>>,
    failing_users: bool,
}

impl FakeUpstream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Posts still load; every user batch fails.
    pub(crate) fn failing_users() -> Self {
        Self {
            failing_users: true,
            ..Self::default()
        }
    }

    pub(crate) fn user_batches(&self) -> Vec<Vec<i64>> {
        self.user_batches.lock().unwrap().clone()
    }

    fn user(id: i64) -> Value {
        let name = match id {
            1 => "Leanne Graham",
            2 => "Ervin Howell",
            _ => "Clementine Bauch",
        };
        json!({
            "id": id,
            "name": name,
            "username": format!("user{}", id),
            "email": format!("user{}@example.com", id),
            "company": { "name": "Acme", "catchPhrase": "Synergy" },
        })
    }
}

#[async_trait]
impl UpstreamSource for FakeUpstream {
    async fn posts(&self) -> Result<Vec<Value>, UpstreamError> {
        Ok([(1, 1), (2, 1), (3, 2), (4, 3), (5, 2)]
            .into_iter()
            .map(|(id, user_id)| {
                json!({ "id": id, "userId": user_id, "title": format!("post {}", id), "body": "..." })
            })
            .collect())
    }

    async fn users(&self) -> Result<Vec<Value>, UpstreamError> {
        Ok((1..=3).map(Self::user).collect())
    }

    async fn users_by_ids(&self, ids: &[i64]) -> Result<Vec<Value>, UpstreamError> {
        self.user_batches.lock().unwrap().push(ids.to_vec());
        if self.failing_users {
            return Err(UpstreamError::Timeout);
        }
        Ok(ids
            .iter()
            .filter(|id| (1..=3).contains(*id))
            .map(|id| Self::user(*id))
            .collect())
    }
}

pub(crate) fn services(upstream: FakeUpstream) -> Arc<Services> {
    let tokens = TokenService::new(TokenConfig {
        secret: TEST_SECRET.to_string(),
        ttl: std::time::Duration::from_secs(3600),
        clock_skew: std::time::Duration::ZERO,
    })
    .expect("token config is valid");

    Arc::new(Services {
        upstream: Arc::new(upstream),
        users: UserStore::with_demo_users(),
        tokens,
        ledger: QueryLedger::new(100),
        posts_limit: 3,
        environment: Environment::Development,
        flush_trigger: FlushTrigger::EndOfTurn,
    })
}
