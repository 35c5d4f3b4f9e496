//! Identity API client.
//!
//! Two GraphQL operations matter to the portal:
//! - resolving the user that owns an SSH public key (called with the admin token)
//! - asking which environment the current user reaches under a namespace name
//!   (called with the user token)
//!
//! The authorization decision is derived here, not by the API: the user may
//! ssh into `namespace` only when the environment the API resolved has
//! exactly that namespace name.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::keys;
use crate::token::{AdminToken, UserToken};

const USER_BY_SSH_KEY: &str = "query userBySshKey($sshKey: String!) {
  userBySshKey(sshKey: $sshKey) {
    id
  }
}";

const ENVIRONMENT_BY_NAMESPACE: &str = "query environmentByNamespace($namespace: String!) {
  environmentByOpenshiftProjectName(openshiftProjectName: $namespace) {
    openshiftProjectName
  }
}";

/// Errors from the identity API.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no user matches the public key")]
    UnknownUser,

    /// The API answered with GraphQL errors.
    #[error("identity API returned errors: {}", .0.join("; "))]
    Api(Vec<String>),

    #[error("identity API request failed: {0}")]
    Transport(String),

    #[error("identity API request timed out")]
    Timeout,

    #[error("unexpected identity API response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for IdentityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IdentityError::Timeout
        } else if err.is_decode() {
            IdentityError::Protocol(err.to_string())
        } else {
            IdentityError::Transport(err.to_string())
        }
    }
}

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: Uuid,
}

/// The environment the API resolved for a namespace query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub openshift_project_name: String,
}

/// Remote operations of the identity API.
///
/// Implementations must authenticate each call with the token they are given
/// and nothing else.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Look up the user owning a wire-format public key.
    async fn user_by_ssh_key(&self, token: &AdminToken, key: &[u8])
        -> Result<User, IdentityError>;

    /// Resolve the environment the token's user reaches under `namespace`.
    ///
    /// `None` when the API resolved no environment.
    async fn environment_by_namespace(
        &self,
        token: &UserToken,
        namespace: &str,
    ) -> Result<Option<Environment>, IdentityError>;
}

/// Proof that a user was authorized for one namespace in this session.
///
/// Only [`authorize`] can build one, and it always carries the namespace the
/// client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    namespace: String,
}

impl Grant {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[cfg(test)]
    pub(crate) fn for_tests(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Granted(Grant),
    Denied,
}

impl Decision {
    #[cfg(test)]
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted(_))
    }
}

/// Check whether the user behind `token` may ssh into `namespace`.
///
/// An empty namespace, a GraphQL error, no resolved environment, or one with
/// any other name is a denial. Transport failures stay errors so they are
/// logged apart from denials, but callers must refuse access for both.
pub async fn authorize(
    api: &dyn IdentityApi,
    token: &UserToken,
    namespace: &str,
) -> Result<Decision, IdentityError> {
    if namespace.is_empty() {
        debug!("empty namespace requested");
        return Ok(Decision::Denied);
    }
    match api.environment_by_namespace(token, namespace).await {
        Ok(Some(env)) if env.openshift_project_name == namespace => {
            Ok(Decision::Granted(Grant {
                namespace: namespace.to_string(),
            }))
        }
        Ok(None) => {
            debug!(requested = namespace, "identity API resolved no environment");
            Ok(Decision::Denied)
        }
        Ok(Some(env)) => {
            debug!(
                requested = namespace,
                resolved = %env.openshift_project_name,
                "resolved environment does not match requested namespace"
            );
            Ok(Decision::Denied)
        }
        Err(IdentityError::Api(messages)) => {
            debug!(requested = namespace, errors = ?messages, "identity API refused namespace");
            Ok(Decision::Denied)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserBySshKeyData {
    user_by_ssh_key: Option<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentData {
    environment_by_openshift_project_name: Option<Environment>,
}

/// HTTP client for the GraphQL identity API.
pub struct GraphqlIdentityClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl GraphqlIdentityClient {
    pub fn new(endpoint: Url, user_agent: &str, timeout: Duration) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    async fn query<T: DeserializeOwned>(
        &self,
        bearer: &str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GraphqlResponse<T>, IdentityError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(bearer)
            .json(&GraphqlRequest { query, variables })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IdentityError::Transport(format!(
                "identity API returned {}",
                status
            )));
        }

        Ok(response.json::<GraphqlResponse<T>>().await?)
    }
}

fn into_result<T>(response: GraphqlResponse<T>) -> Result<T, IdentityError> {
    if !response.errors.is_empty() {
        return Err(IdentityError::Api(
            response.errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    response
        .data
        .ok_or_else(|| IdentityError::Protocol("response has neither data nor errors".to_string()))
}

#[async_trait]
impl IdentityApi for GraphqlIdentityClient {
    async fn user_by_ssh_key(
        &self,
        token: &AdminToken,
        key: &[u8],
    ) -> Result<User, IdentityError> {
        let ssh_key = keys::to_openssh(key)
            .ok_or_else(|| IdentityError::Protocol("unreadable public key".to_string()))?;

        let response: GraphqlResponse<UserBySshKeyData> = self
            .query(
                token.expose(),
                USER_BY_SSH_KEY,
                json!({ "sshKey": ssh_key }),
            )
            .await?;

        match into_result(response) {
            Ok(data) => data.user_by_ssh_key.ok_or(IdentityError::UnknownUser),
            Err(IdentityError::Api(messages)) => {
                debug!(errors = ?messages, "identity API rejected key lookup");
                Err(IdentityError::UnknownUser)
            }
            Err(e) => Err(e),
        }
    }

    async fn environment_by_namespace(
        &self,
        token: &UserToken,
        namespace: &str,
    ) -> Result<Option<Environment>, IdentityError> {
        let response: GraphqlResponse<EnvironmentData> = self
            .query(
                token.expose(),
                ENVIRONMENT_BY_NAMESPACE,
                json!({ "namespace": namespace }),
            )
            .await?;

        Ok(into_result(response)?.environment_by_openshift_project_name)
    }
}
