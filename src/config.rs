//! Portal configuration loaded from TOML, the environment and the command line.

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_GRAPHQL_ENDPOINT: &str = "GRAPHQL_ENDPOINT";
pub const ENV_KEYCLOAK_BASEURL: &str = "KEYCLOAK_BASEURL";
pub const ENV_KEYCLOAK_SECRET: &str = "KEYCLOAK_AUTH_SERVER_CLIENT_SECRET";
pub const ENV_JWTSECRET: &str = "JWTSECRET";

/// Main portal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// SSH server listen address (default: "0.0.0.0:2222")
    pub listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Identity API GraphQL endpoint
    pub graphql_endpoint: String,

    /// Keycloak base URL
    pub keycloak_base_url: String,

    /// Keycloak realm holding the portal's client
    pub keycloak_realm: String,

    /// Client id used for the token exchange
    pub keycloak_client_id: String,

    /// Client secret used for the token exchange
    #[serde(skip_serializing)]
    pub keycloak_client_secret: String,

    /// Shared secret signing admin assertions
    #[serde(skip_serializing)]
    pub jwt_secret: String,

    /// Timeout for each outbound call, in seconds
    pub request_timeout_secs: u64,

    /// Pod every session executes in
    pub pod: String,

    /// Shell for interactive sessions and commands
    pub shell: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("ssh-portal");

        Self {
            listen_addr: "0.0.0.0:2222".to_string(),
            host_key_path: data_dir.join("host_key"),
            graphql_endpoint: String::new(),
            keycloak_base_url: String::new(),
            keycloak_realm: "lagoon".to_string(),
            keycloak_client_id: "auth-server".to_string(),
            keycloak_client_secret: String::new(),
            jwt_secret: String::new(),
            request_timeout_secs: 10,
            pod: "cli".to_string(),
            shell: "sh".to_string(),
        }
    }
}

/// Parsed network endpoints of a validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub listen: SocketAddr,
    pub graphql: Url,
    pub keycloak: Url,
}

impl PortalConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Render the configuration as TOML. Secrets are left out.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Override values with the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Override values from `lookup`. Unset and empty variables are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fields: [(&str, &mut String); 4] = [
            (ENV_GRAPHQL_ENDPOINT, &mut self.graphql_endpoint),
            (ENV_KEYCLOAK_BASEURL, &mut self.keycloak_base_url),
            (ENV_KEYCLOAK_SECRET, &mut self.keycloak_client_secret),
            (ENV_JWTSECRET, &mut self.jwt_secret),
        ];
        for (name, field) in fields {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }
    }

    /// Replace the port of the listen address.
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        let mut addr = self.listen_socket()?;
        addr.set_port(port);
        self.listen_addr = addr.to_string();
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Check required values and parse endpoints.
    ///
    /// Reports the first missing value by its environment variable name.
    pub fn validate(&self) -> Result<Endpoints, ConfigError> {
        let required = [
            (ENV_GRAPHQL_ENDPOINT, &self.graphql_endpoint),
            (ENV_KEYCLOAK_BASEURL, &self.keycloak_base_url),
            (ENV_KEYCLOAK_SECRET, &self.keycloak_client_secret),
            (ENV_JWTSECRET, &self.jwt_secret),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        Ok(Endpoints {
            listen: self.listen_socket()?,
            graphql: parse_http_url(ENV_GRAPHQL_ENDPOINT, &self.graphql_endpoint)?,
            keycloak: parse_http_url(ENV_KEYCLOAK_BASEURL, &self.keycloak_base_url)?,
        })
    }

    fn listen_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })
    }
}

fn parse_http_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        name,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            name,
            reason: format!("unsupported scheme {}", other),
        }),
    }
}
