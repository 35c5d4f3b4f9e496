//! Per-session pipeline.
//!
//! For every SSH session the portal:
//! 1. checks the verified public key is usable
//! 2. mints a one-minute admin assertion
//! 3. resolves the key to a user (as admin)
//! 4. exchanges the user id for a user token
//! 5. asks, as that user, whether the requested namespace is reachable
//! 6. hands the session's streams to the executor
//!
//! Every step is attempted once. Any failure is logged with the session id
//! and turned into a single fixed line for the client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::PortalError;
use crate::exec::{ExecRequest, Executor};
use crate::identity::{self, Decision, IdentityApi};
use crate::jwt::AdminTokenMinter;
use crate::keycloak::TokenExchange;
use crate::keys;
use crate::session::{Session, SessionIo, SessionMachine, SessionState};

/// Immutable build metadata.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub build_time: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
        }
    }

    /// `User-Agent` for outbound calls.
    pub fn user_agent(&self) -> String {
        format!("ssh-portal {}", self.version)
    }
}

/// Static session settings.
#[derive(Debug, Clone)]
pub struct PortalSettings {
    /// Pod every session executes in.
    pub pod: String,
    /// Shell used for interactive sessions and `-c` commands.
    pub shell: String,
    /// Upper bound on each collaborator call before execution starts.
    pub call_timeout: Duration,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            pod: "cli".to_string(),
            shell: "sh".to_string(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: Uuid,
    /// States visited, from `Start` to `Closed`.
    pub trail: Vec<SessionState>,
    pub error: Option<PortalError>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Exit status reported on the SSH channel. Remote exit codes are not
    /// passed through.
    pub fn exit_status(&self) -> u32 {
        if self.is_success() { 0 } else { 1 }
    }
}

/// The session orchestrator.
pub struct Portal {
    minter: AdminTokenMinter,
    identity: Arc<dyn IdentityApi>,
    tokens: Arc<dyn TokenExchange>,
    executor: Arc<dyn Executor>,
    settings: PortalSettings,
    build: BuildInfo,
}

impl Portal {
    pub fn new(
        minter: AdminTokenMinter,
        identity: Arc<dyn IdentityApi>,
        tokens: Arc<dyn TokenExchange>,
        executor: Arc<dyn Executor>,
        settings: PortalSettings,
        build: BuildInfo,
    ) -> Self {
        Self {
            minter,
            identity,
            tokens,
            executor,
            settings,
            build,
        }
    }

    /// Drive one session to `Closed`.
    pub async fn serve(&self, mut session: Session) -> SessionOutcome {
        let span = info_span!(
            "session",
            session_id = %session.id,
            namespace = %session.user
        );
        self.serve_in_span(&mut session).instrument(span).await
    }

    async fn serve_in_span(&self, session: &mut Session) -> SessionOutcome {
        info!(
            version = self.build.version,
            interactive = session.command.trim().is_empty(),
            pty = session.tty(),
            "start session"
        );

        let mut machine = SessionMachine::new();
        let error = match self.run(&mut machine, session).await {
            Ok(()) => {
                enter(&mut machine, SessionState::Closed);
                None
            }
            Err(err) => {
                log_failure(machine.state(), &err);
                enter(&mut machine, SessionState::Failed);
                if let Err(e) = write_line(&mut session.io, err.client_message()).await {
                    debug!("Couldn't write failure line to client: {}", e);
                }
                enter(&mut machine, SessionState::Closed);
                Some(err)
            }
        };

        info!(success = error.is_none(), "end session");
        SessionOutcome {
            id: session.id,
            trail: machine.trail().to_vec(),
            error,
        }
    }

    async fn run(
        &self,
        machine: &mut SessionMachine,
        session: &mut Session,
    ) -> Result<(), PortalError> {
        if keys::key_algorithm(&session.public_key).is_none() {
            return Err(PortalError::UnknownUser(
                "session carries no readable public key".to_string(),
            ));
        }
        debug!(fingerprint = %keys::fingerprint(&session.public_key), "offered key");
        enter(machine, SessionState::KeyResolved);

        let admin = self.minter.mint()?;
        enter(machine, SessionState::AdminTokenObtained);

        let user = self
            .bounded(
                "user lookup",
                self.identity.user_by_ssh_key(&admin, &session.public_key),
            )
            .await?;
        drop(admin);
        info!(user_id = %user.id, "resolved user");
        enter(machine, SessionState::UserResolved);

        let user_token = self
            .bounded("token exchange", self.tokens.user_token(&user.id))
            .await?;
        enter(machine, SessionState::UserTokenObtained);

        // The namespace is what the client asked for, never what the API returns.
        let decision = self
            .bounded(
                "authorization",
                identity::authorize(self.identity.as_ref(), &user_token, &session.user),
            )
            .await?;
        let grant = match decision {
            Decision::Granted(grant) => grant,
            Decision::Denied => {
                return Err(PortalError::AuthorizationDenied {
                    user: user.id.to_string(),
                    namespace: session.user.clone(),
                });
            }
        };
        drop(user_token);
        enter(machine, SessionState::Authorized);

        let request = ExecRequest::new(
            &grant,
            &self.settings.pod,
            &self.settings.shell,
            &session.command,
            session.pty,
        );
        enter(machine, SessionState::Executing);
        self.executor.exec(request, &mut session.io).await?;
        Ok(())
    }

    /// Run a collaborator call under the configured timeout.
    async fn bounded<T, E>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PortalError>
    where
        PortalError: From<E>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(PortalError::from),
            Err(_) => Err(PortalError::Transport(format!(
                "{} timed out after {:?}",
                what, self.settings.call_timeout
            ))),
        }
    }
}

fn enter(machine: &mut SessionMachine, to: SessionState) {
    match machine.transition(to) {
        Ok(()) => debug!(state = %to, "session transition"),
        Err(e) => error!("{}", e),
    }
}

fn log_failure(state: SessionState, err: &PortalError) {
    match err {
        PortalError::Credential(_) => {
            error!(state = %state, kind = err.kind(), error = %err, "session failed")
        }
        _ => warn!(state = %state, kind = err.kind(), error = %err, "session failed"),
    }
}

async fn write_line(io: &mut SessionIo, line: &str) -> std::io::Result<()> {
    io.stdio.write_all(line.as_bytes()).await?;
    io.stdio.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MSG_EXEC_FAILED, MSG_INTERNAL_ERROR, MSG_PERMISSION_DENIED, MSG_UNKNOWN_USER};
    use crate::exec::ExecError;
    use crate::identity::{Environment, IdentityError, User};
    use crate::jwt::AdminClaims;
    use crate::keycloak::TokenExchangeError;
    use crate::session::WindowSize;
    use crate::token::{AdminToken, UserToken};
    use async_trait::async_trait;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use SessionState::*;

    const SECRET: &str = "test-jwt-secret";

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        LookupKey { token: String },
        Exchange { user: Uuid },
        Environment { token: String, namespace: String },
        Exec(ExecRequest),
    }

    type Calls = Arc<Mutex<Vec<Call>>>;

    #[derive(Default)]
    struct MockIdentity {
        calls: Calls,
        users: HashMap<Vec<u8>, Uuid>,
        namespaces: HashMap<Uuid, Vec<String>>,
        /// Answer every environment query with this name.
        resolve_as: Option<String>,
        /// Answer every environment query with no environment.
        resolve_nothing: bool,
        lookup_failure: Option<fn() -> IdentityError>,
        environment_delay: Option<Duration>,
    }

    fn user_token_for(user: &Uuid) -> String {
        format!("user-token:{}", user)
    }

    #[async_trait]
    impl IdentityApi for MockIdentity {
        async fn user_by_ssh_key(
            &self,
            token: &AdminToken,
            key: &[u8],
        ) -> Result<User, IdentityError> {
            self.calls.lock().unwrap().push(Call::LookupKey {
                token: token.expose().to_string(),
            });
            if let Some(fail) = self.lookup_failure {
                return Err(fail());
            }
            self.users
                .get(key)
                .map(|id| User { id: *id })
                .ok_or(IdentityError::UnknownUser)
        }

        async fn environment_by_namespace(
            &self,
            token: &UserToken,
            namespace: &str,
        ) -> Result<Option<Environment>, IdentityError> {
            self.calls.lock().unwrap().push(Call::Environment {
                token: token.expose().to_string(),
                namespace: namespace.to_string(),
            });
            if let Some(delay) = self.environment_delay {
                tokio::time::sleep(delay).await;
            }
            if self.resolve_nothing {
                return Ok(None);
            }
            if let Some(name) = &self.resolve_as {
                return Ok(Some(Environment {
                    openshift_project_name: name.clone(),
                }));
            }
            let user = self
                .namespaces
                .keys()
                .find(|u| user_token_for(u) == token.expose());
            match user {
                Some(u) if self.namespaces[u].iter().any(|ns| ns == namespace) => {
                    Ok(Some(Environment {
                        openshift_project_name: namespace.to_string(),
                    }))
                }
                _ => Err(IdentityError::Api(vec![
                    "Unauthorized: You don't have permission to \"ssh:production\"".into(),
                ])),
            }
        }
    }

    #[derive(Default)]
    struct MockTokens {
        calls: Calls,
        fail_status: Option<u16>,
    }

    #[async_trait]
    impl TokenExchange for MockTokens {
        async fn user_token(&self, user_id: &Uuid) -> Result<UserToken, TokenExchangeError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Exchange { user: *user_id });
            match self.fail_status {
                Some(status) => Err(TokenExchangeError::Status(status)),
                None => Ok(UserToken::new(user_token_for(user_id))),
            }
        }
    }

    #[derive(Default)]
    struct MockExecutor {
        calls: Calls,
        fail_mid_stream: bool,
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn exec(&self, request: ExecRequest, io: &mut SessionIo) -> Result<(), ExecError> {
            self.calls.lock().unwrap().push(Call::Exec(request.clone()));
            io.stdio
                .write_all(format!("hello from {}\n", request.namespace).as_bytes())
                .await
                .map_err(|e| ExecError::Stream(e.to_string()))?;
            if self.fail_mid_stream {
                return Err(ExecError::Stream(
                    "websocket closed by 10.42.0.7: connection reset".into(),
                ));
            }
            Ok(())
        }
    }

    fn test_key(tag: u8) -> Vec<u8> {
        let mut key = Vec::new();
        key.extend_from_slice(&11u32.to_be_bytes());
        key.extend_from_slice(b"ssh-ed25519");
        key.extend_from_slice(&32u32.to_be_bytes());
        key.extend_from_slice(&[tag; 32]);
        key
    }

    fn user_id(tag: u8) -> Uuid {
        Uuid::from_bytes([tag; 16])
    }

    struct Fixture {
        calls: Calls,
        identity: MockIdentity,
        tokens: MockTokens,
        executor: MockExecutor,
        settings: PortalSettings,
    }

    impl Fixture {
        /// Key 1 belongs to user 1, who may reach `ns1` only.
        fn new() -> Self {
            let calls: Calls = Arc::default();
            let mut identity = MockIdentity {
                calls: calls.clone(),
                ..Default::default()
            };
            identity.users.insert(test_key(1), user_id(1));
            identity
                .namespaces
                .insert(user_id(1), vec!["ns1".to_string()]);
            Self {
                identity,
                tokens: MockTokens {
                    calls: calls.clone(),
                    ..Default::default()
                },
                executor: MockExecutor {
                    calls: calls.clone(),
                    ..Default::default()
                },
                settings: PortalSettings {
                    call_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
                calls,
            }
        }

        fn build(self) -> (Portal, Calls) {
            let portal = Portal::new(
                AdminTokenMinter::new(SECRET).unwrap(),
                Arc::new(self.identity),
                Arc::new(self.tokens),
                Arc::new(self.executor),
                self.settings,
                BuildInfo::current(),
            );
            (portal, self.calls)
        }
    }

    fn session(key: Vec<u8>, user: &str, command: &str) -> (Session, DuplexStream) {
        let (client, portal_side) = duplex(4096);
        let (_client_err, portal_err) = duplex(4096);
        let session = Session::new(key, user, command, SessionIo::new(portal_side, portal_err));
        (session, client)
    }

    async fn client_output(mut client: DuplexStream) -> String {
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    fn exec_calls(calls: &Calls) -> Vec<ExecRequest> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Exec(req) => Some(req.clone()),
                _ => None,
            })
            .collect()
    }

    const FULL_PATH: [SessionState; 8] = [
        Start,
        KeyResolved,
        AdminTokenObtained,
        UserResolved,
        UserTokenObtained,
        Authorized,
        Executing,
        Closed,
    ];

    #[tokio::test]
    async fn test_allows_granted_namespace() {
        let (portal, calls) = Fixture::new().build();
        let (session, client) = session(test_key(1), "ns1", "");

        let outcome = portal.serve(session).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.trail, FULL_PATH);
        assert_eq!(outcome.exit_status(), 0);
        let execs = exec_calls(&calls);
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].namespace, "ns1");
        assert_eq!(execs[0].pod, "cli");
        assert_eq!(client_output(client).await, "hello from ns1\n");
    }

    #[tokio::test]
    async fn test_denies_other_namespace_without_exec() {
        let (portal, calls) = Fixture::new().build();
        let (session, client) = session(test_key(1), "ns2", "");

        let outcome = portal.serve(session).await;

        assert!(matches!(
            outcome.error,
            Some(PortalError::AuthorizationDenied { ref namespace, .. }) if namespace == "ns2"
        ));
        assert_eq!(
            outcome.trail,
            [Start, KeyResolved, AdminTokenObtained, UserResolved, UserTokenObtained, Failed, Closed]
        );
        assert_eq!(outcome.exit_status(), 1);
        assert!(exec_calls(&calls).is_empty());
        assert_eq!(client_output(client).await, MSG_PERMISSION_DENIED);
    }

    #[tokio::test]
    async fn test_resolved_environment_must_match_exactly() {
        for resolved in ["ns1-staging", "NS1", "ns", ""] {
            let mut fixture = Fixture::new();
            fixture.identity.resolve_as = Some(resolved.to_string());
            let (portal, calls) = fixture.build();
            let (session, client) = session(test_key(1), "ns1", "id");

            let outcome = portal.serve(session).await;

            assert!(!outcome.trail.contains(&Executing), "resolved {:?}", resolved);
            assert!(exec_calls(&calls).is_empty());
            assert_eq!(client_output(client).await, MSG_PERMISSION_DENIED);
        }
    }

    #[tokio::test]
    async fn test_no_resolved_environment_is_denied() {
        let mut fixture = Fixture::new();
        fixture.identity.resolve_nothing = true;
        let (portal, calls) = fixture.build();
        let (session, client) = session(test_key(1), "ns1", "");

        let outcome = portal.serve(session).await;

        assert!(!outcome.trail.contains(&Authorized));
        assert!(exec_calls(&calls).is_empty());
        assert_eq!(client_output(client).await, MSG_PERMISSION_DENIED);
    }

    #[tokio::test]
    async fn test_empty_username_never_executes() {
        let cases: [fn(&mut MockIdentity); 2] = [
            |identity| identity.resolve_nothing = true,
            |identity| identity.resolve_as = Some(String::new()),
        ];
        for configure in cases {
            let mut fixture = Fixture::new();
            configure(&mut fixture.identity);
            let (portal, calls) = fixture.build();
            let (session, client) = session(test_key(1), "", "");

            let outcome = portal.serve(session).await;

            assert!(matches!(
                outcome.error,
                Some(PortalError::AuthorizationDenied { ref namespace, .. }) if namespace.is_empty()
            ));
            assert!(!outcome.trail.contains(&Executing));
            let calls = calls.lock().unwrap().clone();
            assert!(
                !calls.iter().any(|c| matches!(c, Call::Environment { .. } | Call::Exec(_))),
                "{:?}",
                calls
            );
            assert_eq!(client_output(client).await, MSG_PERMISSION_DENIED);
        }
    }

    #[tokio::test]
    async fn test_exec_targets_requested_namespace_not_resolved_one() {
        let mut fixture = Fixture::new();
        fixture.identity.resolve_as = Some("ns1".to_string());
        let (portal, calls) = fixture.build();
        let (session, _client) = session(test_key(1), "ns1", "uptime");

        assert!(portal.serve(session).await.is_success());
        assert_eq!(exec_calls(&calls)[0].namespace, "ns1");
    }

    #[tokio::test]
    async fn test_admin_token_only_for_lookup_and_user_token_only_for_authorization() {
        let (portal, calls) = Fixture::new().build();
        let (session, _client) = session(test_key(1), "ns1", "ls");

        assert!(portal.serve(session).await.is_success());

        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4, "{:?}", calls);

        let Call::LookupKey { token: admin } = &calls[0] else {
            panic!("first call should be key lookup: {:?}", calls[0]);
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        let claims = decode::<AdminClaims>(
            admin,
            &DecodingKey::from_secret(SECRET.as_bytes()),
            &validation,
        )
        .unwrap()
        .claims;
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.exp - claims.iat, 60);

        assert_eq!(calls[1], Call::Exchange { user: user_id(1) });
        assert_eq!(
            calls[2],
            Call::Environment {
                token: user_token_for(&user_id(1)),
                namespace: "ns1".to_string(),
            }
        );
        assert_ne!(admin, &user_token_for(&user_id(1)));
        assert!(matches!(calls[3], Call::Exec(_)));
    }

    #[tokio::test]
    async fn test_user_token_not_requested_when_lookup_fails() {
        let (portal, calls) = Fixture::new().build();
        let (session, client) = session(test_key(9), "ns1", "");

        let outcome = portal.serve(session).await;

        assert!(matches!(outcome.error, Some(PortalError::UnknownUser(_))));
        assert_eq!(outcome.trail, [Start, KeyResolved, AdminTokenObtained, Failed, Closed]);
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::LookupKey { .. }));
        assert_eq!(client_output(client).await, MSG_UNKNOWN_USER);
    }

    #[tokio::test]
    async fn test_empty_command_requests_shell_with_tty() {
        let (portal, calls) = Fixture::new().build();
        let (session, _client) = session(test_key(1), "ns1", "");
        assert!(!session.tty());

        assert!(portal.serve(session).await.is_success());

        let req = &exec_calls(&calls)[0];
        assert_eq!(req.command, vec!["sh".to_string()]);
        assert!(req.tty);
    }

    #[tokio::test]
    async fn test_command_with_pty_passes_size() {
        let (portal, calls) = Fixture::new().build();
        let (session, _client) = session(test_key(1), "ns1", "htop");
        let size = WindowSize { cols: 132, rows: 43 };
        let session = session.with_pty(size);

        assert!(portal.serve(session).await.is_success());

        let req = &exec_calls(&calls)[0];
        assert_eq!(req.command, vec!["sh", "-c", "htop"]);
        assert!(req.tty);
        assert_eq!(req.initial_size, Some(size));
    }

    #[tokio::test]
    async fn test_session_without_readable_key_stops_before_lookup() {
        let (portal, calls) = Fixture::new().build();
        let (session, client) = session(Vec::new(), "ns1", "");

        let outcome = portal.serve(session).await;

        assert_eq!(outcome.trail, [Start, Failed, Closed]);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(client_output(client).await, MSG_UNKNOWN_USER);
    }

    async fn assert_single_generic_line(
        portal: Portal,
        calls: &Calls,
        expected_line: &str,
        expected_kind: &str,
    ) {
        let (session, client) = session(test_key(1), "ns1", "cat /etc/passwd");
        let outcome = portal.serve(session).await;

        let err = outcome.error.as_ref().expect("session should fail");
        assert_eq!(err.kind(), expected_kind);
        assert_eq!(outcome.trail.last(), Some(&Closed));
        assert_eq!(outcome.trail[outcome.trail.len() - 2], Failed);
        assert_eq!(
            outcome.trail.iter().filter(|s| **s == Failed).count(),
            1
        );

        let output = client_output(client).await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.last().copied(), Some(expected_line.trim_end()));
        assert_eq!(output.matches(expected_line).count(), 1);
        let detail = err.to_string();
        assert!(!output.contains(&detail), "leaked {:?}", detail);
        if expected_kind != "execution" {
            assert_eq!(output, expected_line);
            assert!(exec_calls(calls).is_empty());
        }
    }

    #[tokio::test]
    async fn test_failure_unknown_key() {
        let mut fixture = Fixture::new();
        fixture.identity.users.clear();
        let (portal, calls) = fixture.build();
        assert_single_generic_line(portal, &calls, MSG_UNKNOWN_USER, "unknown_user").await;
    }

    #[tokio::test]
    async fn test_failure_lookup_transport() {
        let mut fixture = Fixture::new();
        fixture.identity.lookup_failure =
            Some(|| IdentityError::Transport("connection refused (api.internal:3000)".into()));
        let (portal, calls) = fixture.build();
        assert_single_generic_line(portal, &calls, MSG_INTERNAL_ERROR, "transport").await;
    }

    #[tokio::test]
    async fn test_failure_token_exchange_http_500() {
        let mut fixture = Fixture::new();
        fixture.tokens.fail_status = Some(500);
        let (portal, calls) = fixture.build();
        assert_single_generic_line(portal, &calls, MSG_INTERNAL_ERROR, "token_exchange").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_authorization_timeout() {
        let mut fixture = Fixture::new();
        fixture.identity.environment_delay = Some(Duration::from_secs(3600));
        let (portal, calls) = fixture.build();
        assert_single_generic_line(portal, &calls, MSG_INTERNAL_ERROR, "transport").await;
    }

    #[tokio::test]
    async fn test_failure_exec_mid_stream() {
        let mut fixture = Fixture::new();
        fixture.executor.fail_mid_stream = true;
        let (portal, calls) = fixture.build();
        assert_single_generic_line(portal, &calls, MSG_EXEC_FAILED, "execution").await;
        assert_eq!(exec_calls(&calls).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sessions_do_not_cross_talk() {
        const N: u8 = 24;
        let calls: Calls = Arc::default();
        let mut identity = MockIdentity {
            calls: calls.clone(),
            environment_delay: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        for i in 1..=N {
            identity.users.insert(test_key(i), user_id(i));
            identity
                .namespaces
                .insert(user_id(i), vec![format!("ns{}", i)]);
        }
        let portal = Arc::new(Portal::new(
            AdminTokenMinter::new(SECRET).unwrap(),
            Arc::new(identity),
            Arc::new(MockTokens {
                calls: calls.clone(),
                ..Default::default()
            }),
            Arc::new(MockExecutor {
                calls: calls.clone(),
                ..Default::default()
            }),
            PortalSettings::default(),
            BuildInfo::current(),
        ));

        let mut handles = Vec::new();
        for i in 1..=N {
            // Even sessions ask for their own namespace, odd ones for a neighbour's.
            let own = i % 2 == 0;
            let target = if own {
                format!("ns{}", i)
            } else {
                format!("ns{}", i % N + 1)
            };
            let portal = portal.clone();
            handles.push(tokio::spawn(async move {
                let (session, client) = session(test_key(i), &target, "");
                let outcome = portal.serve(session).await;
                (own, target, outcome, client_output(client).await)
            }));
        }

        for handle in handles {
            let (own, target, outcome, output) = handle.await.unwrap();
            if own {
                assert!(outcome.is_success(), "{}: {:?}", target, outcome.error);
                assert_eq!(output, format!("hello from {}\n", target));
            } else {
                assert!(matches!(
                    outcome.error,
                    Some(PortalError::AuthorizationDenied { ref namespace, .. }) if *namespace == target
                ));
                assert_eq!(output, MSG_PERMISSION_DENIED);
            }
        }

        let execs = exec_calls(&calls);
        assert_eq!(execs.len(), (N / 2) as usize);
        for req in execs {
            let n: u8 = req.namespace.trim_start_matches("ns").parse().unwrap();
            assert_eq!(n % 2, 0, "odd session reached exec: {}", req.namespace);
        }
    }
}
