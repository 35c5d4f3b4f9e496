//! Keycloak token exchange.
//!
//! Trades the portal's client credentials for a token that acts as a given
//! user. One POST per session, never retried.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::token::UserToken;

/// OAuth 2.0 token exchange grant (RFC 8693).
pub const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

#[derive(Debug, Error)]
pub enum TokenExchangeError {
    #[error("identity provider returned HTTP {0}")]
    Status(u16),

    #[error("token request failed: {0}")]
    Transport(String),

    #[error("token request timed out")]
    Timeout,

    #[error("malformed token response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for TokenExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TokenExchangeError::Timeout
        } else {
            TokenExchangeError::Transport(err.to_string())
        }
    }
}

/// Exchanges a user id for a user-scoped bearer token.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn user_token(&self, user_id: &Uuid) -> Result<UserToken, TokenExchangeError>;
}

#[derive(Debug, Serialize)]
struct UserTokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
    requested_subject: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Pull the bearer token out of a token endpoint response body.
///
/// A JSON object with `access_token` yields that field; any other non-empty
/// body is used verbatim.
pub fn parse_token_body(body: &str) -> Result<UserToken, TokenExchangeError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(TokenExchangeError::Malformed("empty body".to_string()));
    }
    if body.starts_with('{') {
        let parsed: TokenResponse = serde_json::from_str(body)
            .map_err(|e| TokenExchangeError::Malformed(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(TokenExchangeError::Malformed("empty access_token".to_string()));
        }
        return Ok(UserToken::new(parsed.access_token));
    }
    Ok(UserToken::new(body))
}

/// Keycloak client for the token exchange endpoint.
pub struct KeycloakClient {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl KeycloakClient {
    pub fn new(
        base_url: &Url,
        realm: &str,
        client_id: &str,
        client_secret: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Self, TokenExchangeError> {
        let token_url = token_url(base_url, realm)?;
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| TokenExchangeError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            token_url,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

/// `<base>/auth/realms/<realm>/protocol/openid-connect/token`, keeping any
/// path prefix of the base URL.
fn token_url(base_url: &Url, realm: &str) -> Result<Url, TokenExchangeError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|_| TokenExchangeError::Malformed(format!("{} cannot be a base", base_url)))?
        .pop_if_empty()
        .extend(["auth", "realms", realm, "protocol", "openid-connect", "token"]);
    Ok(url)
}

#[async_trait]
impl TokenExchange for KeycloakClient {
    async fn user_token(&self, user_id: &Uuid) -> Result<UserToken, TokenExchangeError> {
        let request = UserTokenRequest {
            grant_type: TOKEN_EXCHANGE_GRANT,
            client_id: &self.client_id,
            client_secret: &self.client_secret,
            requested_subject: user_id.to_string(),
        };
        debug!(url = %self.token_url, subject = %user_id, "requesting user token");

        let response = self
            .client
            .post(self.token_url.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TokenExchangeError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_token_body(&body)
    }
}
