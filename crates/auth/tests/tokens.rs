use std::time::Duration;

use http::HeaderMap;
use http::header::AUTHORIZATION;
use unigraph_auth::{TokenConfig, TokenService, UserStore, authorize};
use unigraph_contracts::{GatewayError, Role};

fn tokens() -> TokenService {
    TokenService::new(TokenConfig {
        secret: "integration-secret".to_string(),
        ttl: Duration::from_secs(600),
        clock_skew: Duration::from_secs(5),
    })
    .expect("token service should init")
}

#[test]
fn login_token_round_trips_through_authorization_header() {
    let store = UserStore::with_demo_users();
    let tokens = tokens();

    let identity = store
        .verify_credentials("user1", "user123")
        .expect("demo credentials should verify");
    let token = tokens.issue(&identity).expect("issue should succeed");

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        format!("Bearer {}", token).parse().expect("header value"),
    );

    let resolved = tokens.identify(&headers).expect("identity should resolve");
    assert_eq!(resolved, identity);
    assert!(authorize(Some(&resolved), Role::User).is_ok());
    assert_eq!(
        authorize(Some(&resolved), Role::Admin).unwrap_err(),
        GatewayError::Unauthorized {
            required: Role::Admin
        }
    );
}

#[test]
fn tampered_token_is_treated_as_anonymous() {
    let store = UserStore::with_demo_users();
    let tokens = tokens();
    let identity = store.verify_credentials("admin", "admin123").unwrap();
    let token = tokens.issue(&identity).unwrap();

    let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
    parts[2] = parts[2].chars().rev().collect();
    let tampered = parts.join(".");

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        format!("Bearer {}", tampered).parse().unwrap(),
    );

    assert!(tokens.identify(&headers).is_none());
    assert_eq!(
        authorize(tokens.identify(&headers).as_ref(), Role::Guest).unwrap_err(),
        GatewayError::Unauthenticated
    );
}
