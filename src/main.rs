//! SSH Portal
//!
//! An SSH server that resolves the client's public key to a user through the
//! identity API, checks that the user may reach the namespace named by the SSH
//! username, and then runs the session inside that namespace's cluster pod.

mod config;
mod error;
mod exec;
#[cfg(test)]
mod http_stub;
mod identity;
mod jwt;
mod keycloak;
mod keys;
mod portal;
mod session;
mod ssh;
mod token;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::PortalConfig;
use crate::exec::KubeExecutor;
use crate::identity::GraphqlIdentityClient;
use crate::jwt::AdminTokenMinter;
use crate::keycloak::KeycloakClient;
use crate::portal::{BuildInfo, Portal, PortalSettings};

/// SSH Portal - shell access to cluster environments over SSH
#[derive(Parser, Debug)]
#[command(name = "ssh-portal", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ssh-portal/portal.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Override listen port
    #[arg(short, long, env = "SSH_PORTAL_PORT")]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        println!("{}", PortalConfig::default().to_toml()?);
        return Ok(());
    }

    let mut config = PortalConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    config.apply_env();

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(port) = cli.port {
        config.set_port(port)?;
    }

    let endpoints = config.validate().context("Invalid configuration")?;
    let build = BuildInfo::current();

    info!("Starting ssh-portal {} (built {})", build.version, build.build_time);
    info!("  Listen address: {}", endpoints.listen);
    info!("  Identity API: {}", endpoints.graphql);
    info!("  Keycloak: {} (realm {})", endpoints.keycloak, config.keycloak_realm);
    info!("  Target pod: {}", config.pod);

    let minter = AdminTokenMinter::new(&config.jwt_secret).context("Invalid JWT secret")?;

    let identity = GraphqlIdentityClient::new(
        endpoints.graphql,
        &build.user_agent(),
        config.request_timeout(),
    )
    .context("Failed to build identity API client")?;

    let tokens = KeycloakClient::new(
        &endpoints.keycloak,
        &config.keycloak_realm,
        &config.keycloak_client_id,
        &config.keycloak_client_secret,
        &build.user_agent(),
        config.request_timeout(),
    )
    .context("Failed to build Keycloak client")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to initialize Kubernetes client")?;

    let portal = Arc::new(Portal::new(
        minter,
        Arc::new(identity),
        Arc::new(tokens),
        Arc::new(KubeExecutor::new(kube_client)),
        PortalSettings {
            pod: config.pod.clone(),
            shell: config.shell.clone(),
            call_timeout: config.request_timeout(),
        },
        build,
    ));

    ssh::run_server(&config.host_key_path, endpoints.listen, portal).await?;

    info!("ssh-portal stopped");
    Ok(())
}
