//! Per-connection session data and its lifecycle states.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bidirectional client stream: reads are the client's stdin, writes go to
/// its stdout.
pub trait Stdio: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stdio for T {}

/// Write-only client stream for stderr.
pub trait Stderr: AsyncWrite + Send + Unpin {}

impl<T: AsyncWrite + Send + Unpin> Stderr for T {}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    /// Clamp the `u32` sizes SSH carries to what a remote terminal accepts.
    pub fn from_ssh(cols: u32, rows: u32) -> Self {
        Self {
            cols: cols.min(u16::MAX as u32) as u16,
            rows: rows.min(u16::MAX as u32) as u16,
        }
    }
}

/// Stream endpoints of a session.
pub struct SessionIo {
    pub stdio: Box<dyn Stdio>,
    pub stderr: Box<dyn Stderr>,
    /// Window-change events from the client, present when a pty was requested.
    pub resize: Option<mpsc::Receiver<WindowSize>>,
}

impl SessionIo {
    pub fn new(stdio: impl Stdio + 'static, stderr: impl Stderr + 'static) -> Self {
        Self {
            stdio: Box::new(stdio),
            stderr: Box::new(stderr),
            resize: None,
        }
    }

    pub fn with_resize(mut self, resize: mpsc::Receiver<WindowSize>) -> Self {
        self.resize = Some(resize);
        self
    }
}

/// One inbound SSH session, as handed over by the listener.
pub struct Session {
    /// Log correlation only. Not a credential.
    pub id: Uuid,
    /// Wire-format bytes of the verified public key.
    pub public_key: Vec<u8>,
    /// SSH username, which names the target namespace.
    pub user: String,
    /// Requested command; empty for a shell.
    pub command: String,
    /// Terminal size if the client requested a pty.
    pub pty: Option<WindowSize>,
    pub io: SessionIo,
}

impl Session {
    pub fn new(public_key: Vec<u8>, user: impl Into<String>, command: impl Into<String>, io: SessionIo) -> Self {
        Self {
            id: Uuid::new_v4(),
            public_key,
            user: user.into(),
            command: command.into(),
            pty: None,
            io,
        }
    }

    pub fn with_pty(mut self, size: WindowSize) -> Self {
        self.pty = Some(size);
        self
    }

    pub fn tty(&self) -> bool {
        self.pty.is_some()
    }
}

/// Lifecycle of a session inside the portal.
///
/// The happy path is strictly sequential. `Failed` can be entered from any
/// state before `Closed` and always leads to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    KeyResolved,
    AdminTokenObtained,
    UserResolved,
    UserTokenObtained,
    Authorized,
    Executing,
    Failed,
    Closed,
}

impl SessionState {
    /// Next state on success, if any.
    pub fn successor(self) -> Option<SessionState> {
        use SessionState::*;
        match self {
            Start => Some(KeyResolved),
            KeyResolved => Some(AdminTokenObtained),
            AdminTokenObtained => Some(UserResolved),
            UserResolved => Some(UserTokenObtained),
            UserTokenObtained => Some(Authorized),
            Authorized => Some(Executing),
            Executing => Some(Closed),
            Failed => Some(Closed),
            Closed => None,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether `to` is a legal move from this state.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        if to == SessionState::Failed {
            return !matches!(self, SessionState::Failed | SessionState::Closed);
        }
        self.successor() == Some(to)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Start => "start",
            SessionState::KeyResolved => "key_resolved",
            SessionState::AdminTokenObtained => "token_obtained(admin)",
            SessionState::UserResolved => "user_resolved",
            SessionState::UserTokenObtained => "token_obtained(user)",
            SessionState::Authorized => "authorized",
            SessionState::Executing => "executing",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal session transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Tracks the current state and the full trail of a session.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    trail: Vec<SessionState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Start,
            trail: vec![SessionState::Start],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state visited so far, starting with `Start`.
    pub fn trail(&self) -> &[SessionState] {
        &self.trail
    }

    pub fn transition(&mut self, to: SessionState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(to) {
            return Err(IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.trail.push(to);
        Ok(())
    }

    #[cfg(test)]
    pub fn reached(&self, state: SessionState) -> bool {
        self.trail.contains(&state)
    }
}
