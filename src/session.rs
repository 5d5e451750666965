//! Per-connection proxy session: relay bytes between an LDAP client and the
//! upstream directory, watch for user DN searches and simple binds, and gate
//! successful binds on the second factor.

use crate::cache::DnLoginCache;
use crate::ldap_protocol::{
    build_bind_response, parse_ldap_message, result_code_name, BindRequest, Filter, ProtocolOp,
    RC_INVALID_CREDENTIALS, RC_SUCCESS,
};
use crate::metrics::Metrics;
use crate::second_factor::SecondFactor;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

/// Each socket read is inspected independently; bind and search-entry
/// responses fit a single segment in practice.
const READ_BUF_SIZE: usize = 8192;

/// Attributes whose equality searches reveal which login maps to which DN.
const LOGIN_ATTRIBUTES: [&str; 3] = ["cn", "uid", "samaccountname"];

/// Authentication phase of one session. The payloads keep illegal
/// combinations unrepresentable: a pending lookup login exists only while a
/// user DN search is in flight, a session user only while a bind awaits its
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthState {
    Idle,
    UserDnSearch { pending_login: String },
    BindRequested { login: String },
    /// Terminal: the second factor refused; the synthetic response has been
    /// (or is being) written and the session is tearing down.
    Failed,
}

/// What the response inspector decided for the current chunk.
enum ResponseAction {
    Forward,
    Replace(Vec<u8>),
    Discard,
}

/// Outcome of a state transition taken under the lock; acted on after the
/// lock is released.
enum Decision {
    Nothing,
    Record { dn: String, login: String },
    Check { login: String, message_id: i32 },
}

pub struct ProxySession<C, U, A> {
    client: C,
    upstream: U,
    ctx: SessionCtx<A>,
}

struct SessionCtx<A> {
    state: Mutex<AuthState>,
    /// Lowercased service-account logins; binds by these bypass the second factor.
    service_accounts: HashSet<String>,
    cache: Arc<DnLoginCache>,
    second_factor: Arc<A>,
    metrics: Arc<Metrics>,
    peer: String,
}

impl<C, U, A> ProxySession<C, U, A>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    A: SecondFactor,
{
    pub fn new(
        client: C,
        upstream: U,
        service_accounts: &[String],
        cache: Arc<DnLoginCache>,
        second_factor: Arc<A>,
        metrics: Arc<Metrics>,
        peer: String,
    ) -> Self {
        Self {
            client,
            upstream,
            ctx: SessionCtx {
                state: Mutex::new(AuthState::Idle),
                service_accounts: service_accounts.iter().map(|s| s.to_lowercase()).collect(),
                cache,
                second_factor,
                metrics,
                peer,
            },
        }
    }

    /// Run the session to completion: both relay directions concurrently, done
    /// when either direction finishes (EOF, I/O error, or the failure path).
    /// Dropping the halves closes both sockets, which unblocks the peer task.
    pub async fn run(self) {
        let ProxySession {
            client,
            upstream,
            ctx,
        } = self;
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        tokio::select! {
            _ = ctx.relay_requests(&mut client_rd, &mut upstream_wr) => {}
            _ = ctx.relay_responses(&mut upstream_rd, &mut client_wr) => {}
        }
        debug!("Session with {} finished", ctx.peer);
    }
}

impl<A: SecondFactor> SessionCtx<A> {
    fn failed(&self) -> bool {
        matches!(*self.state.lock().expect("auth state lock"), AuthState::Failed)
    }

    /// Client -> upstream. Requests are inspected but never modified.
    async fn relay_requests<R, W>(&self, rd: &mut R, wr: &mut W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) => {
                    debug!("Client {} disconnected", self.peer);
                    break;
                }
                Ok(n) => n,
                Err(e) if is_transport_closed(&e) => break,
                Err(e) => {
                    error!("Error reading from client {}: {}", self.peer, e);
                    break;
                }
            };
            if self.failed() {
                break;
            }
            self.inspect_request(&buf[..n]);
            if let Err(e) = wr.write_all(&buf[..n]).await {
                if !is_transport_closed(&e) {
                    error!("Error forwarding request for {}: {}", self.peer, e);
                }
                break;
            }
            if wr.flush().await.is_err() {
                break;
            }
            self.metrics.add_request_bytes(n as u64);
        }
    }

    /// Upstream -> client. The only path that may rewrite: a denied second
    /// factor swaps the bind response for invalidCredentials and ends the
    /// session right after the write.
    async fn relay_responses<R, W>(&self, rd: &mut R, wr: &mut W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match rd.read(&mut buf).await {
                Ok(0) => {
                    debug!("Upstream closed for {}", self.peer);
                    break;
                }
                Ok(n) => n,
                Err(e) if is_transport_closed(&e) => break,
                Err(e) => {
                    error!("Error reading from upstream for {}: {}", self.peer, e);
                    break;
                }
            };
            match self.inspect_response(&buf[..n]).await {
                ResponseAction::Discard => continue,
                ResponseAction::Forward => {
                    if let Err(e) = wr.write_all(&buf[..n]).await {
                        if !is_transport_closed(&e) {
                            error!("Error forwarding response for {}: {}", self.peer, e);
                        }
                        break;
                    }
                    if wr.flush().await.is_err() {
                        break;
                    }
                    self.metrics.add_response_bytes(n as u64);
                }
                ResponseAction::Replace(bytes) => {
                    if let Err(e) = wr.write_all(&bytes).await {
                        if !is_transport_closed(&e) {
                            error!("Error writing synthetic response for {}: {}", self.peer, e);
                        }
                    } else {
                        let _ = wr.flush().await;
                        self.metrics.add_response_bytes(bytes.len() as u64);
                    }
                    let _ = wr.shutdown().await;
                    break;
                }
            }
        }
    }

    /// Apply request-side state transitions for the first message in `chunk`.
    fn inspect_request(&self, chunk: &[u8]) {
        let msg = match parse_ldap_message(chunk) {
            Ok(m) => m,
            Err(e) => {
                trace!("Request chunk from {} not inspected: {}", self.peer, e);
                self.metrics.inc_decode_failure();
                return;
            }
        };
        match msg.protocol_op {
            ProtocolOp::SearchRequest(sr) => {
                if let Filter::EqualityMatch { attribute, value } = sr.filter {
                    if LOGIN_ATTRIBUTES
                        .iter()
                        .any(|a| attribute.eq_ignore_ascii_case(a))
                    {
                        debug!(
                            "User DN search from {}: {}={} (base {})",
                            self.peer, attribute, value, sr.base_object
                        );
                        *self.state.lock().expect("auth state lock") = AuthState::UserDnSearch {
                            pending_login: value,
                        };
                    }
                }
            }
            ProtocolOp::BindRequest(ref br) if br.is_simple() => self.observe_simple_bind(br),
            ProtocolOp::BindRequest(_) => {
                debug!("SASL bind from {} passed through", self.peer);
            }
            _ => {}
        }
    }

    fn observe_simple_bind(&self, bind: &BindRequest) {
        if bind.name.is_empty() {
            debug!("Anonymous bind from {} passed through", self.peer);
            return;
        }
        // The login is the cached mapping for this DN when a preceding search
        // revealed one, otherwise the DN itself.
        let login = self
            .cache
            .get(&bind.name)
            .unwrap_or_else(|| bind.name.clone());
        if self.service_accounts.contains(&login.to_lowercase()) {
            debug!("Service account bind from {} ({}) passed through", self.peer, login);
            return;
        }
        debug!("Simple bind from {} as {} awaits upstream verdict", self.peer, login);
        self.metrics.inc_binds_observed();
        *self.state.lock().expect("auth state lock") = AuthState::BindRequested { login };
    }

    /// Apply response-side state transitions for the first message in `chunk`
    /// and decide what reaches the client.
    async fn inspect_response(&self, chunk: &[u8]) -> ResponseAction {
        let msg = match parse_ldap_message(chunk) {
            Ok(m) => m,
            Err(e) => {
                if self.failed() {
                    return ResponseAction::Discard;
                }
                trace!("Response chunk for {} not inspected: {}", self.peer, e);
                self.metrics.inc_decode_failure();
                return ResponseAction::Forward;
            }
        };

        // Transition under the lock, act after it is released: the state is
        // taken out and written back except where a transition consumes it.
        let decision = {
            let mut state = self.state.lock().expect("auth state lock");
            let current = std::mem::replace(&mut *state, AuthState::Idle);
            match (current, &msg.protocol_op) {
                (AuthState::Failed, _) => {
                    *state = AuthState::Failed;
                    return ResponseAction::Discard;
                }
                (
                    AuthState::UserDnSearch { pending_login },
                    ProtocolOp::SearchResultEntry(entry),
                ) => Decision::Record {
                    dn: entry.object_name.clone(),
                    login: pending_login,
                },
                (AuthState::UserDnSearch { .. }, _) => {
                    // The search produced no usable entry.
                    Decision::Nothing
                }
                (AuthState::BindRequested { login }, ProtocolOp::BindResponse(resp)) => {
                    if resp.result_code == RC_SUCCESS {
                        Decision::Check {
                            login,
                            message_id: msg.message_id,
                        }
                    } else {
                        debug!(
                            "Upstream rejected bind for {} as {}: {} ({})",
                            self.peer,
                            login,
                            result_code_name(resp.result_code),
                            resp.diagnostic_message
                        );
                        Decision::Nothing
                    }
                }
                (other, _) => {
                    *state = other;
                    Decision::Nothing
                }
            }
        };

        match decision {
            Decision::Nothing => ResponseAction::Forward,
            Decision::Record { dn, login } => {
                debug!("Learned mapping for {}: {} -> {}", self.peer, dn, login);
                self.cache.put(dn, login);
                self.metrics.inc_logins_cached();
                ResponseAction::Forward
            }
            Decision::Check { login, message_id } => {
                // Inline on the response path: the server->client direction
                // stalls here, which is fine because the client is waiting on
                // this very bind response.
                let start = Instant::now();
                let allowed = self.second_factor.authenticate(&login).await;
                self.metrics.observe_second_factor(start.elapsed());
                if allowed {
                    info!("Second factor allowed bind for {} as {}", self.peer, login);
                    self.metrics.inc_second_factor_allowed();
                    ResponseAction::Forward
                } else {
                    warn!(
                        "Second factor denied bind for {} as {}; returning invalidCredentials",
                        self.peer, login
                    );
                    self.metrics.inc_second_factor_denied();
                    *self.state.lock().expect("auth state lock") = AuthState::Failed;
                    ResponseAction::Replace(build_bind_response(
                        message_id,
                        RC_INVALID_CREDENTIALS,
                    ))
                }
            }
        }
    }
}

/// I/O errors that mean the peer went away; handled like an orderly EOF.
fn is_transport_closed(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
