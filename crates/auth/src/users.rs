use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use unigraph_contracts::canonical::sha256_hex;
use unigraph_contracts::{GatewayError, Identity, Role};

const MIN_PASSWORD_CHARS: usize = 6;
const MAX_USERNAME_CHARS: usize = 64;

#[derive(Debug, Clone)]
struct UserRecord {
    id: String,
    username: String,
    role: Role,
    name: String,
    salt: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl UserRecord {
    fn identity(&self) -> Identity {
        Identity::new(&self.id, &self.username, self.role, &self.name)
    }
}

/// Public view of an account, without credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemUser {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPayload {
    pub token: String,
    pub user: Identity,
}

#[derive(Debug, Default)]
struct UserTable {
    by_username: HashMap<String, UserRecord>,
    next_id: u64,
}

/// In-memory account store. Every account, seeded or registered, goes through
/// the same salted hashing routine and the same verification path.
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    inner: Arc<RwLock<UserTable>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_demo_users() -> Self {
        let store = Self::new();
        let seeds = [
            ("admin", "admin123", Role::Admin, "System Admin"),
            ("user1", "user123", Role::User, "Demo User"),
        ];
        for (username, password, role, name) in seeds {
            if let Err(err) = store.insert(username, password, role, name) {
                tracing::warn!(username, error = %err, "auth.seed_user_failed");
            }
        }
        store
    }

    pub fn register(
        &self,
        username: &str,
        password: &str,
        name: &str,
    ) -> Result<Identity, GatewayError> {
        let username = username.trim();
        let name = name.trim();

        if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
            return Err(GatewayError::BadUserInput(format!(
                "username must be 1..={} characters",
                MAX_USERNAME_CHARS
            )));
        }
        if !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(GatewayError::BadUserInput(
                "username may only contain letters, digits, '_', '-' and '.'".to_string(),
            ));
        }
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(GatewayError::BadUserInput(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_CHARS
            )));
        }
        if name.is_empty() {
            return Err(GatewayError::BadUserInput("name must be non-empty".to_string()));
        }

        let identity = self.insert(username, password, Role::User, name)?;
        tracing::info!(user_id = %identity.id, username = %identity.username, "auth.user_registered");
        Ok(identity)
    }

    pub fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Identity, GatewayError> {
        let table = self.read();
        let record = table
            .by_username
            .get(username.trim())
            .ok_or_else(|| GatewayError::NotFound("user".to_string()))?;

        let candidate = hash_password(&record.salt, password);
        if !bool::from(candidate.as_bytes().ct_eq(record.password_hash.as_bytes())) {
            return Err(GatewayError::InvalidCredentials);
        }

        Ok(record.identity())
    }

    /// Accounts ordered by id.
    pub fn all_users(&self) -> Vec<SystemUser> {
        let table = self.read();
        let mut users = table
            .by_username
            .values()
            .map(|record| SystemUser {
                id: record.id.clone(),
                username: record.username.clone(),
                role: record.role,
                name: record.name.clone(),
                created_at: record.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect::<Vec<_>>();
        users.sort_by_key(|user| user.id.parse::<u64>().unwrap_or(u64::MAX));
        users
    }

    pub fn len(&self) -> usize {
        self.read().by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        &self,
        username: &str,
        password: &str,
        role: Role,
        name: &str,
    ) -> Result<Identity, GatewayError> {
        let mut table = self.write();
        if table.by_username.contains_key(username) {
            return Err(GatewayError::Conflict(format!(
                "username '{}' is already taken",
                username
            )));
        }

        table.next_id += 1;
        let salt = ulid::Ulid::new().to_string();
        let record = UserRecord {
            id: table.next_id.to_string(),
            username: username.to_string(),
            role,
            name: name.to_string(),
            password_hash: hash_password(&salt, password),
            salt,
            created_at: Utc::now(),
        };
        let identity = record.identity();
        table.by_username.insert(username.to_string(), record);
        Ok(identity)
    }

    fn read(&self) -> RwLockReadGuard<'_, UserTable> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, UserTable> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    sha256_hex(format!("{}:{}", salt, password).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_users_verify_through_hashed_path() {
        let store = UserStore::with_demo_users();

        let admin = store.verify_credentials("admin", "admin123").unwrap();
        assert_eq!(admin, Identity::new("1", "admin", Role::Admin, "System Admin"));

        let user = store.verify_credentials("user1", "user123").unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.id, "2");
    }

    #[test]
    fn wrong_password_and_unknown_user_are_distinct_failures() {
        let store = UserStore::with_demo_users();
        assert_eq!(
            store.verify_credentials("admin", "nope").unwrap_err(),
            GatewayError::InvalidCredentials
        );
        assert_eq!(
            store.verify_credentials("ghost", "whatever").unwrap_err(),
            GatewayError::NotFound("user".to_string())
        );
    }

    #[test]
    fn registered_user_can_log_in_and_duplicates_conflict() {
        let store = UserStore::with_demo_users();
        let created = store.register("alice", "secret1", "Alice").unwrap();
        assert_eq!(created.id, "3");
        assert_eq!(created.role, Role::User);

        let verified = store.verify_credentials("alice", "secret1").unwrap();
        assert_eq!(verified, created);

        let err = store.register("alice", "secret2", "Other").unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn register_rejects_bad_input() {
        let store = UserStore::new();
        assert!(matches!(
            store.register("", "secret1", "x"),
            Err(GatewayError::BadUserInput(_))
        ));
        assert!(matches!(
            store.register("bob", "short", "Bob"),
            Err(GatewayError::BadUserInput(_))
        ));
        assert!(matches!(
            store.register("bob smith", "secret1", "Bob"),
            Err(GatewayError::BadUserInput(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn all_users_lists_accounts_by_id_without_secrets() {
        let store = UserStore::with_demo_users();
        store.register("carol", "secret1", "Carol").unwrap();

        let users = store.all_users();
        let names = users.iter().map(|u| u.username.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["admin", "user1", "carol"]);

        let json = serde_json::to_value(&users[0]).unwrap();
        assert!(json.get("createdAt").is_some());
        assert!(json.get("passwordHash").is_none());
    }
}
