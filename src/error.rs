//! Error taxonomy for the portal.
//!
//! Every per-session failure ends up as a [`PortalError`]. The technical
//! detail goes to the operational log; the client only ever sees the fixed
//! line returned by [`PortalError::client_message`].

use thiserror::Error;

use crate::exec::ExecError;
use crate::identity::IdentityError;
use crate::keycloak::TokenExchangeError;

/// Line written when the offered key has no matching user.
pub const MSG_UNKNOWN_USER: &str = "unknown user\n";
/// Line written when the user may not reach the requested namespace.
pub const MSG_PERMISSION_DENIED: &str = "permission denied\n";
/// Line written for every failure that is not the user's fault.
pub const MSG_INTERNAL_ERROR: &str = "internal error\n";
/// Line written when the remote command could not be run to completion.
pub const MSG_EXEC_FAILED: &str = "couldn't execute command\n";

/// Configuration problems. Fatal at startup, never seen per session.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),

    #[error("invalid URL for {name}: {reason}")]
    InvalidUrl { name: &'static str, reason: String },

    #[error("invalid listen address {addr}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    #[error("couldn't sign admin assertion with configured secret: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// A failed session, one variant per failure kind.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("no user for offered public key: {0}")]
    UnknownUser(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(#[from] TokenExchangeError),

    #[error("user {user} may not ssh to namespace {namespace}")]
    AuthorizationDenied { user: String, namespace: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecError),

    #[error("couldn't mint admin assertion: {0}")]
    Credential(#[from] jsonwebtoken::errors::Error),
}

impl PortalError {
    /// The single plain-text line shown to the SSH client.
    ///
    /// Never includes the underlying error so internal topology and user
    /// existence are not leaked.
    pub fn client_message(&self) -> &'static str {
        match self {
            PortalError::UnknownUser(_) => MSG_UNKNOWN_USER,
            PortalError::AuthorizationDenied { .. } => MSG_PERMISSION_DENIED,
            PortalError::Execution(_) => MSG_EXEC_FAILED,
            PortalError::TokenExchange(_)
            | PortalError::Transport(_)
            | PortalError::Credential(_) => MSG_INTERNAL_ERROR,
        }
    }

    /// Short machine-friendly kind name used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            PortalError::UnknownUser(_) => "unknown_user",
            PortalError::TokenExchange(_) => "token_exchange",
            PortalError::AuthorizationDenied { .. } => "authorization_denied",
            PortalError::Transport(_) => "transport",
            PortalError::Execution(_) => "execution",
            PortalError::Credential(_) => "credential",
        }
    }
}

impl From<IdentityError> for PortalError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser => PortalError::UnknownUser("no match".to_string()),
            IdentityError::Api(messages) => PortalError::UnknownUser(messages.join("; ")),
            IdentityError::Transport(reason) => PortalError::Transport(reason),
            IdentityError::Timeout => PortalError::Transport("identity API timed out".to_string()),
            IdentityError::Protocol(reason) => {
                PortalError::Transport(format!("identity API protocol error: {reason}"))
            }
        }
    }
}
