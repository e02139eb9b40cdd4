//! Identity collaborator: credential resolution and repository permissions.
//! The hub never issues credentials; it only maps what arrives on a request
//! to a principal and applies the read/write rules.

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;

use crate::config::UserConfig;
use crate::error::HubError;
use crate::metadata::Repository;

const PRIVATE_TOKEN_HEADER: &str = "PRIVATE-TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub admin: bool,
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// `Ok(None)` is an anonymous request; a credential that is present but
    /// wrong is an error, not anonymity.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>>;
}

/// Public repos are world-readable; private ones only for admins and owners.
pub fn can_read(principal: Option<&Principal>, repo: &Repository) -> bool {
    if !repo.private {
        return true;
    }
    match principal {
        Some(p) => p.admin || p.username.eq_ignore_ascii_case(&repo.username),
        None => false,
    }
}

pub fn can_write(principal: Option<&Principal>, repo: &Repository) -> bool {
    match principal {
        Some(p) => p.admin || p.username.eq_ignore_ascii_case(&repo.username),
        None => false,
    }
}

/// Upload namespaces are per-user: only the owner or an admin may push into
/// `user/...`, even before the repository row exists.
pub fn can_upload(principal: &Principal, user: &str) -> bool {
    principal.admin || principal.username == user
}

/// Static credential table fed from the serve config. Accepts
/// `Authorization: Bearer`, `Authorization: Basic` and `PRIVATE-TOKEN`.
pub struct TokenAuthenticator {
    by_token: HashMap<String, Principal>,
    by_basic: HashMap<String, (String, Principal)>,
}

impl TokenAuthenticator {
    pub fn new(users: &[UserConfig]) -> Self {
        let mut by_token = HashMap::new();
        let mut by_basic = HashMap::new();
        for user in users {
            let principal = Principal {
                username: user.username.clone(),
                admin: user.admin,
            };
            if let Some(token) = &user.token {
                by_token.insert(token.clone(), principal.clone());
            }
            if let Some(password) = &user.password {
                by_basic.insert(user.username.clone(), (password.clone(), principal.clone()));
            }
        }
        Self { by_token, by_basic }
    }

    fn resolve_token(&self, token: &str) -> Result<Option<Principal>> {
        match self.by_token.get(token) {
            Some(principal) => Ok(Some(principal.clone())),
            None => Err(HubError::Unauthenticated.into()),
        }
    }

    fn resolve_basic(&self, encoded: &str) -> Result<Option<Principal>> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| HubError::Unauthenticated)?;
        let decoded = String::from_utf8(decoded).map_err(|_| HubError::Unauthenticated)?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(HubError::Unauthenticated)?;
        match self.by_basic.get(username) {
            Some((expected, principal)) if expected == password => Ok(Some(principal.clone())),
            _ => Err(HubError::Unauthenticated.into()),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let value = value.to_str().map_err(|_| HubError::Unauthenticated)?;
            if let Some(token) = value.strip_prefix("Bearer ") {
                return self.resolve_token(token.trim());
            }
            if let Some(encoded) = value.strip_prefix("Basic ") {
                return self.resolve_basic(encoded.trim());
            }
            return Err(HubError::Unauthenticated.into());
        }
        if let Some(value) = headers.get(PRIVATE_TOKEN_HEADER) {
            let token = value.to_str().map_err(|_| HubError::Unauthenticated)?;
            return self.resolve_token(token.trim());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn users() -> Vec<UserConfig> {
        vec![
            UserConfig {
                username: "alice".into(),
                token: Some("alice-token".into()),
                password: Some("s3cret".into()),
                admin: false,
            },
            UserConfig {
                username: "root".into(),
                token: Some("root-token".into()),
                password: None,
                admin: true,
            },
        ]
    }

    fn repo(username: &str, private: bool) -> Repository {
        Repository {
            id: 1,
            username: username.into(),
            name: "img".into(),
            private,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn bearer_token_resolves_principal() {
        let auth = TokenAuthenticator::new(&users());
        let principal = auth.authenticate(&bearer("alice-token")).await.unwrap();
        assert_eq!(principal.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn wrong_credential_is_an_error_not_anonymous() {
        let auth = TokenAuthenticator::new(&users());
        assert!(auth.authenticate(&bearer("nope")).await.is_err());

        let anonymous = auth.authenticate(&HeaderMap::new()).await.unwrap();
        assert!(anonymous.is_none());
    }

    #[tokio::test]
    async fn basic_and_private_token_headers_work() {
        let auth = TokenAuthenticator::new(&users());

        let mut headers = HeaderMap::new();
        let encoded = STANDARD.encode("alice:s3cret");
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        let principal = auth.authenticate(&headers).await.unwrap().unwrap();
        assert_eq!(principal.username, "alice");

        let mut headers = HeaderMap::new();
        headers.insert(PRIVATE_TOKEN_HEADER, "root-token".parse().unwrap());
        let principal = auth.authenticate(&headers).await.unwrap().unwrap();
        assert!(principal.admin);
    }

    #[test]
    fn read_rules_follow_visibility() {
        let alice = Principal {
            username: "alice".into(),
            admin: false,
        };
        let admin = Principal {
            username: "root".into(),
            admin: true,
        };
        let bob = Principal {
            username: "bob".into(),
            admin: false,
        };

        let public = repo("alice", false);
        let private = repo("alice", true);

        assert!(can_read(None, &public));
        assert!(!can_read(None, &private));
        assert!(can_read(Some(&alice), &private));
        assert!(can_read(Some(&admin), &private));
        assert!(!can_read(Some(&bob), &private));
    }

    #[test]
    fn write_rules_require_owner_or_admin() {
        let alice = Principal {
            username: "alice".into(),
            admin: false,
        };
        let bob = Principal {
            username: "bob".into(),
            admin: false,
        };
        let public = repo("alice", false);

        assert!(!can_write(None, &public));
        assert!(can_write(Some(&alice), &public));
        assert!(!can_write(Some(&bob), &public));
        assert!(can_upload(&alice, "alice"));
        assert!(!can_upload(&bob, "alice"));
    }
}
