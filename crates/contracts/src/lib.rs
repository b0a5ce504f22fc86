use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod error;

pub use error::{ErrorCode, GatewayError};

pub const ANONYMOUS_ID: &str = "anonymous";
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Roles are ordered: a higher role satisfies every requirement of a lower one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Guest,
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "guest" => Some(Role::Guest),
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified principal. Built only from a fully validated credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub role: Role,
    pub name: String,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        role: Role,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            role,
            name: name.into(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationBudget {
    pub max_depth: u32,
    pub max_cost: u64,
}

impl Default for ValidationBudget {
    fn default() -> Self {
        Self {
            max_depth: 7,
            max_cost: 1000,
        }
    }
}
