use serde::{Deserialize, Serialize};

use crate::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimited,
    Unauthenticated,
    Forbidden,
    DepthLimitExceeded,
    ComplexityLimitExceeded,
    IntrospectionDisabled,
    UpstreamFailure,
    NotFound,
    Conflict,
    BadUserInput,
    GraphqlParseFailed,
    GraphqlValidationFailed,
    InternalServerError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::DepthLimitExceeded => "DEPTH_LIMIT_EXCEEDED",
            ErrorCode::ComplexityLimitExceeded => "COMPLEXITY_LIMIT_EXCEEDED",
            ErrorCode::IntrospectionDisabled => "INTROSPECTION_DISABLED",
            ErrorCode::UpstreamFailure => "UPSTREAM_FAILURE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::BadUserInput => "BAD_USER_INPUT",
            ErrorCode::GraphqlParseFailed => "GRAPHQL_PARSE_FAILED",
            ErrorCode::GraphqlValidationFailed => "GRAPHQL_VALIDATION_FAILED",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure an operation can surface, from the rate gate to field resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication required")]
    Unauthenticated,

    #[error("{required} role required for this operation")]
    Unauthorized { required: Role },

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("query depth {observed} exceeds maximum allowed depth {limit}")]
    DepthExceeded { limit: u32, observed: u32 },

    #[error("Query complexity {observed} exceeds maximum allowed {limit}")]
    ComplexityExceeded { limit: u64, observed: u64 },

    #[error("GraphQL introspection is disabled")]
    IntrospectionDisabled,

    #[error("access to field '{0}' is not allowed")]
    FieldBlocked(String),

    #[error("upstream request failed: {0}")]
    UpstreamFailure(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadUserInput(String),

    #[error("{0}")]
    Syntax(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::Unauthenticated | GatewayError::InvalidCredentials => {
                ErrorCode::Unauthenticated
            }
            GatewayError::Unauthorized { .. } | GatewayError::FieldBlocked(_) => {
                ErrorCode::Forbidden
            }
            GatewayError::DepthExceeded { .. } => ErrorCode::DepthLimitExceeded,
            GatewayError::ComplexityExceeded { .. } => ErrorCode::ComplexityLimitExceeded,
            GatewayError::IntrospectionDisabled => ErrorCode::IntrospectionDisabled,
            GatewayError::UpstreamFailure(_) => ErrorCode::UpstreamFailure,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::Conflict(_) => ErrorCode::Conflict,
            GatewayError::BadUserInput(_) => ErrorCode::BadUserInput,
            GatewayError::Syntax(_) => ErrorCode::GraphqlParseFailed,
            GatewayError::InvalidOperation(_) => ErrorCode::GraphqlValidationFailed,
            GatewayError::Internal(_) => ErrorCode::InternalServerError,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Failures raised before any resolver runs.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::DepthExceeded { .. }
                | GatewayError::ComplexityExceeded { .. }
                | GatewayError::IntrospectionDisabled
                | GatewayError::FieldBlocked(_)
                | GatewayError::Syntax(_)
                | GatewayError::InvalidOperation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(
            GatewayError::DepthExceeded {
                limit: 7,
                observed: 9
            }
            .code()
            .as_str(),
            "DEPTH_LIMIT_EXCEEDED"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::ComplexityLimitExceeded).unwrap(),
            serde_json::json!("COMPLEXITY_LIMIT_EXCEEDED")
        );
        assert_eq!(
            GatewayError::Unauthorized {
                required: Role::Admin
            }
            .code(),
            ErrorCode::Forbidden
        );
    }

    #[test]
    fn complexity_message_reports_observed_and_limit() {
        let err = GatewayError::ComplexityExceeded {
            limit: 1000,
            observed: 1041,
        };
        assert_eq!(
            err.to_string(),
            "Query complexity 1041 exceeds maximum allowed 1000"
        );
        assert!(err.is_pre_execution());
    }

    #[test]
    fn only_rate_limited_carries_retry_after() {
        let limited = GatewayError::RateLimited {
            retry_after_secs: 12,
        };
        assert_eq!(limited.retry_after_secs(), Some(12));
        assert_eq!(GatewayError::Unauthenticated.retry_after_secs(), None);
        assert!(!GatewayError::UpstreamFailure("boom".to_string()).is_pre_execution());
    }
}
