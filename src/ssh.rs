//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication (verified keys only)
//! - Session channels (shell, exec) with pty and window-change requests
//!
//! Each shell or exec request becomes a portal session running on its own
//! task. Authorization happens inside the session, so every verified key is
//! accepted here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::keys;
use crate::portal::Portal;
use crate::session::{Session as PortalSession, SessionIo, WindowSize};

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

/// Window-change events buffered per channel.
const RESIZE_BUFFER: usize = 8;

/// Per-connection handler state.
pub struct ConnectionHandler {
    portal: Arc<Portal>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// SSH username, which names the namespace.
    user: Option<String>,

    /// Wire-format bytes of the key whose signature was verified.
    public_key: Option<Vec<u8>>,

    /// Session channels not yet bound to a shell or exec request.
    channels: HashMap<ChannelId, Channel<Msg>>,

    /// PTY size per SSH channel (set by pty_request).
    ptys: HashMap<ChannelId, WindowSize>,

    /// Resize forwarding for running sessions.
    resizers: HashMap<ChannelId, mpsc::Sender<WindowSize>>,
}

impl ConnectionHandler {
    fn new(portal: Arc<Portal>, peer_addr: SocketAddr) -> Self {
        Self {
            portal,
            peer_addr,
            user: None,
            public_key: None,
            channels: HashMap::new(),
            ptys: HashMap::new(),
            resizers: HashMap::new(),
        }
    }

    /// Bind a channel to a portal session and run it.
    fn start_session(
        &mut self,
        channel_id: ChannelId,
        command: String,
        session: &mut Session,
    ) -> Result<()> {
        let channel = self
            .channels
            .remove(&channel_id)
            .ok_or_else(|| anyhow!("Unknown or already used channel {:?}", channel_id))?;
        let user = self.user.clone().ok_or_else(|| anyhow!("Not authenticated"))?;
        let public_key = self
            .public_key
            .clone()
            .ok_or_else(|| anyhow!("No verified public key"))?;

        let stderr = Box::pin(channel.make_writer_ext(Some(EXTENDED_DATA_STDERR)));
        let mut io = SessionIo::new(Box::pin(channel.into_stream()), stderr);
        let pty = self.ptys.get(&channel_id).copied();
        if pty.is_some() {
            let (tx, rx) = mpsc::channel(RESIZE_BUFFER);
            self.resizers.insert(channel_id, tx);
            io = io.with_resize(rx);
        }

        let mut request = PortalSession::new(public_key, user, command, io);
        if let Some(size) = pty {
            request = request.with_pty(size);
        }

        // Confirm the request (OpenSSH sets want-reply=true).
        session.channel_success(channel_id)?;

        let handle = session.handle();
        let portal = self.portal.clone();
        tokio::spawn(async move {
            let outcome = portal.serve(request).await;
            debug!(
                "Session {} on channel {:?} ended: {:?}",
                outcome.id, channel_id, outcome.trail
            );
            let _ = handle
                .exit_status_request(channel_id, outcome.exit_status())
                .await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    /// Any key may proceed to the signature check.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by user '{}' from {}", user, self.peer_addr);
        Ok(Auth::Accept)
    }

    /// Handle verified public key authentication (signature received).
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let raw = public_key.public_key_bytes();
        info!(
            "Verified key {} for user '{}' from {}",
            keys::fingerprint(&raw),
            user,
            self.peer_addr
        );
        self.user = Some(user.to_string());
        self.public_key = Some(raw);
        Ok(Auth::Accept)
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        self.ptys
            .insert(channel_id, WindowSize::from_ssh(col_width, row_height));
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel_id);
        self.start_session(channel_id, String::new(), session)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Exec request on channel {:?}", channel_id);
        self.start_session(channel_id, exec_command(data), session)
    }

    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Window change: channel={:?}, cols={}, rows={}",
            channel_id, col_width, row_height
        );
        let size = WindowSize::from_ssh(col_width, row_height);
        self.ptys.insert(channel_id, size);
        if let Some(tx) = self.resizers.get(&channel_id) {
            if tx.try_send(size).is_err() {
                debug!("Dropped window change for channel {:?}", channel_id);
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        self.channels.remove(&channel_id);
        self.ptys.remove(&channel_id);
        self.resizers.remove(&channel_id);
        Ok(())
    }
}

/// Command text of an exec request.
fn exec_command(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Run the SSH server until Ctrl-C.
pub async fn run_server(host_key_path: &Path, listen: SocketAddr, portal: Arc<Portal>) -> Result<()> {
    let key = load_or_generate_host_key(host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
        };
        let portal = portal.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(portal, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create host key directory: {}", parent.display()))?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, encoded.as_bytes())
        .await
        .with_context(|| format!("Failed to write host key: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}
