//! Field resolution against the upstream source and the in-process stores.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use unigraph_auth::{AuthError, AuthPayload, TokenService, UserStore, authorize};
use unigraph_contracts::{GatewayError, Identity, Role};
use unigraph_ledger::QueryLedger;

use super::document::FieldNode;
use super::introspection;
use super::schema::{MUTATION_TYPE, QUERY_TYPE, schema};
use crate::batch::{BatchCoalescer, FlushTrigger};
use crate::config::Environment;
use crate::upstream::{UpstreamError, UpstreamSource, UserBatchFetcher};

/// Process-wide collaborators shared by every operation.
pub struct Services {
    pub upstream: Arc<dyn UpstreamSource>,
    pub users: UserStore,
    pub tokens: TokenService,
    pub ledger: QueryLedger,
    pub posts_limit: usize,
    pub environment: Environment,
    pub flush_trigger: FlushTrigger,
}

/// Per-operation state: the caller's identity and a fresh user loader, so
/// batch windows never mix two operations.
pub struct ResolverContext {
    identity: Option<Identity>,
    services: Arc<Services>,
    user_loader: BatchCoalescer<i64, Value>,
}

impl ResolverContext {
    pub fn new(identity: Option<Identity>, services: Arc<Services>) -> Self {
        let fetcher = Arc::new(UserBatchFetcher::new(Arc::clone(&services.upstream)));
        let user_loader = BatchCoalescer::new("users", fetcher, services.flush_trigger);
        Self {
            identity,
            services,
            user_loader,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Runs `work` on the current task, flushing the user loader whenever
    /// `work` stalls on it.
    pub async fn drive<F: std::future::Future>(&self, work: F) -> F::Output {
        self.user_loader.drive(work).await
    }

    pub async fn resolve(
        &self,
        parent_type: &str,
        parent: &Value,
        field: &FieldNode,
    ) -> Result<Value, GatewayError> {
        if field.name == "__typename" {
            return Ok(Value::from(parent_type));
        }

        match (parent_type, field.name.as_str()) {
            (QUERY_TYPE, "__schema") => Ok(introspection::schema_value(schema())),
            (QUERY_TYPE, "__type") => Ok(introspection::lookup_type(
                schema(),
                str_arg(field, "name")?,
            )),
            (QUERY_TYPE, name) => self.query_field(name, field).await,
            (MUTATION_TYPE, name) => self.mutation_field(name, field),
            ("Post", "user") => self.post_author(parent).await,
            _ => Ok(parent.get(&field.name).cloned().unwrap_or(Value::Null)),
        }
    }

    async fn query_field(&self, name: &str, field: &FieldNode) -> Result<Value, GatewayError> {
        let services = &self.services;
        match name {
            "posts" => {
                let posts = services.upstream.posts().await.map_err(upstream_failure)?;
                Ok(Value::Array(
                    posts.into_iter().take(services.posts_limit).collect(),
                ))
            }
            "users" => {
                let users = services.upstream.users().await.map_err(upstream_failure)?;
                Ok(Value::Array(users))
            }
            "health" => Ok(json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "environment": services.environment.as_str(),
            })),
            "me" => to_json(authorize(self.identity(), Role::Guest)?),
            "queryLogs" => {
                let caller = authorize(self.identity(), Role::Guest)?;
                let limit = field
                    .arguments
                    .get("limit")
                    .and_then(Value::as_i64)
                    .unwrap_or(100);
                let limit = usize::try_from(limit).map_err(|_| {
                    GatewayError::BadUserInput("limit must not be negative".to_string())
                })?;
                let filter = if caller.is_admin() {
                    field.arguments.get("userId").and_then(Value::as_str)
                } else {
                    Some(caller.id.as_str())
                };
                to_json(&services.ledger.query(filter, limit))
            }
            "allUsers" => {
                authorize(self.identity(), Role::Admin)?;
                to_json(&services.users.all_users())
            }
            "userStats" => {
                authorize(self.identity(), Role::Admin)?;
                to_json(&services.ledger.stats())
            }
            other => Err(GatewayError::Internal(format!(
                "no resolver for Query.{}",
                other
            ))),
        }
    }

    fn mutation_field(&self, name: &str, field: &FieldNode) -> Result<Value, GatewayError> {
        let services = &self.services;
        let identity = match name {
            "login" => services
                .users
                .verify_credentials(str_arg(field, "username")?, str_arg(field, "password")?)?,
            "register" => services.users.register(
                str_arg(field, "username")?,
                str_arg(field, "password")?,
                str_arg(field, "name")?,
            )?,
            other => {
                return Err(GatewayError::Internal(format!(
                    "no resolver for Mutation.{}",
                    other
                )));
            }
        };

        let token = services.tokens.issue(&identity).map_err(token_failure)?;
        tracing::info!(user_id = %identity.id, mutation = name, "gateway.token_issued");
        to_json(&AuthPayload {
            token,
            user: identity,
        })
    }

    async fn post_author(&self, post: &Value) -> Result<Value, GatewayError> {
        let Some(user_id) = post.get("userId").and_then(Value::as_i64) else {
            return Ok(Value::Null);
        };
        match self.user_loader.load(user_id).await {
            Ok(user) => Ok(user.unwrap_or(Value::Null)),
            Err(err) => Err(GatewayError::UpstreamFailure(err.to_string())),
        }
    }
}

fn str_arg<'f>(field: &'f FieldNode, name: &str) -> Result<&'f str, GatewayError> {
    field
        .arguments
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::BadUserInput(format!("argument \"{}\" is required", name)))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|err| GatewayError::Internal(err.to_string()))
}

fn upstream_failure(err: UpstreamError) -> GatewayError {
    GatewayError::UpstreamFailure(err.to_string())
}

fn token_failure(err: AuthError) -> GatewayError {
    GatewayError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::document::plan_operation;
    use crate::testing::{FakeUpstream, services};
    use unigraph_ledger::LedgerRecord;

    fn field(query: &str) -> FieldNode {
        plan_operation(schema(), query, None, None)
            .expect("query should plan")
            .fields
            .remove(0)
    }

    fn admin() -> Identity {
        Identity::new("1", "admin", Role::Admin, "System Admin")
    }

    fn user() -> Identity {
        Identity::new("2", "user1", Role::User, "Demo User")
    }

    #[tokio::test]
    async fn me_requires_identity() {
        let services = services(FakeUpstream::new());
        let anonymous = ResolverContext::new(None, services.clone());
        let err = anonymous
            .resolve(QUERY_TYPE, &Value::Null, &field("{ me { id } }"))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated);

        let ctx = ResolverContext::new(Some(user()), services);
        let me = ctx
            .resolve(QUERY_TYPE, &Value::Null, &field("{ me { id } }"))
            .await
            .unwrap();
        assert_eq!(me["username"], "user1");
        assert_eq!(me["role"], "user");
    }

    #[tokio::test]
    async fn query_logs_restricts_non_admins_to_their_own_entries() {
        let services = services(FakeUpstream::new());
        for identity in [admin(), user()] {
            services.ledger.record(LedgerRecord {
                identity: Some(&identity),
                query: "{ posts { id } }",
                operation_name: None,
                duration_ms: 3,
                success: true,
                error: None,
            });
        }

        let as_user = ResolverContext::new(Some(user()), services.clone());
        let logs = as_user
            .resolve(
                QUERY_TYPE,
                &Value::Null,
                &field("{ queryLogs(userId: \"1\") { id } }"),
            )
            .await
            .unwrap();
        let logs = logs.as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["userId"], "2");

        let as_admin = ResolverContext::new(Some(admin()), services);
        let all = as_admin
            .resolve(QUERY_TYPE, &Value::Null, &field("{ queryLogs { id } }"))
            .await
            .unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn admin_fields_reject_regular_users() {
        let ctx = ResolverContext::new(Some(user()), services(FakeUpstream::new()));
        let err = ctx
            .resolve(QUERY_TYPE, &Value::Null, &field("{ allUsers { id } }"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Unauthorized {
                required: Role::Admin
            }
        );
    }

    #[tokio::test]
    async fn login_issues_a_verifiable_token() {
        let services = services(FakeUpstream::new());
        let ctx = ResolverContext::new(None, services.clone());
        let login = plan_operation(
            schema(),
            "mutation { login(username: \"admin\", password: \"admin123\") { token } }",
            None,
            None,
        )
        .unwrap()
        .fields
        .remove(0);

        let payload = ctx.resolve(MUTATION_TYPE, &Value::Null, &login).await.unwrap();
        let token = payload["token"].as_str().unwrap();
        let identity = services.tokens.verify(token).expect("token should verify");
        assert_eq!(identity, admin());
        assert_eq!(payload["user"]["role"], "admin");
    }

    #[tokio::test]
    async fn posts_are_truncated_and_authors_resolve_through_loader() {
        let upstream = FakeUpstream::new();
        let services = services(upstream.clone());
        let ctx = ResolverContext::new(None, services);

        let posts = ctx
            .resolve(QUERY_TYPE, &Value::Null, &field("{ posts { id } }"))
            .await
            .unwrap();
        let posts = posts.as_array().unwrap();
        assert_eq!(posts.len(), 3);

        let user_field = field("{ posts { user { name } } }").selection.remove(0);
        let author = ctx
            .drive(ctx.resolve("Post", &posts[0], &user_field))
            .await
            .unwrap();
        assert_eq!(author["name"], "Leanne Graham");
        assert_eq!(upstream.user_batches(), vec![vec![1]]);
    }
}
