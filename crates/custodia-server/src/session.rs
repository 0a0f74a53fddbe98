//! One session per accepted connection.
//!
//! `Connecting -> Authenticating -> Ready -> Closing`. Commands are handled
//! strictly one after another; the only thing shared with other sessions is
//! the [`ServerContext`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use custodia_shared::constants::{APP_NAME, PROMPT_COMMAND};
use custodia_shared::protocol::Reply;
use custodia_shared::types::Identity;

use crate::auth::{AuthOutcome, Authenticator};
use crate::commands;
use crate::dispatch::{parse_command, Command};
use crate::error::{FramingError, ServerError};
use crate::files::{FileLocks, FileStore};
use crate::framing::Connection;
use crate::ports::{IdentityDirectory, RecordStore};
use crate::transfer::TransferLimits;
use crate::verify::VerificationBackend;

/// Collaborators and limits shared by every session.
#[derive(Clone)]
pub struct ServerContext {
    pub files: FileStore,
    pub locks: FileLocks,
    pub identity: Arc<dyn IdentityDirectory>,
    pub records: Arc<dyn RecordStore>,
    pub verification: Arc<dyn VerificationBackend>,
    pub limits: TransferLimits,
    pub idle_timeout: Duration,
    /// Consecutive failed logins before the session is closed; 0 = no limit.
    pub max_auth_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Ready(Identity),
    Closing,
}

pub struct Session<S> {
    conn: Connection<S>,
    ctx: Arc<ServerContext>,
    peer: String,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, ctx: Arc<ServerContext>, peer: String) -> Self {
        let conn = Connection::new(stream, ctx.idle_timeout);
        Self {
            conn,
            ctx,
            peer,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Serve the connection until the client leaves or the transport fails.
    pub async fn run(mut self) {
        let banner = format!(
            "Bienvenido al servidor {APP_NAME} v{}",
            env!("CARGO_PKG_VERSION")
        );
        if self.conn.send_line(&banner).await.is_err() {
            debug!(peer = %self.peer, "Client left before the banner");
            return;
        }

        self.state = SessionState::Authenticating;
        let auth = Authenticator::new(self.ctx.identity.clone(), self.ctx.max_auth_attempts);
        match auth.run(&mut self.conn, &self.peer).await {
            Ok(AuthOutcome::Authenticated(identity)) => {
                self.state = SessionState::Ready(identity.clone());
                self.command_loop(&identity).await;
            }
            Ok(AuthOutcome::Exit) => {
                debug!(peer = %self.peer, "Client left at login");
            }
            Ok(AuthOutcome::TooManyAttempts) => {
                warn!(peer = %self.peer, "Too many failed logins, closing");
            }
            Err(e) => self.transport_ended(&e).await,
        }

        self.state = SessionState::Closing;
        self.conn.shutdown().await;
        debug!(peer = %self.peer, "Session closed");
    }

    async fn command_loop(&mut self, identity: &Identity) {
        loop {
            if self.conn.send_line(PROMPT_COMMAND).await.is_err() {
                return;
            }

            let line = match self.conn.recv_line().await {
                Ok(line) => line,
                Err(e) if e.is_recoverable() => {
                    debug!(peer = %self.peer, error = %e, "Unreadable command line");
                    if !self.send(&Reply::error(e.to_string())).await {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    self.transport_ended(&e).await;
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match parse_command(&line, identity.level) {
                Ok(command) => command,
                Err(e) => {
                    debug!(peer = %self.peer, user = %identity.username, error = %e, "Command rejected");
                    if !self.send(&Reply::error(e.client_message())).await {
                        return;
                    }
                    continue;
                }
            };

            let exit = command == Command::Exit;
            match commands::execute(&self.ctx, &mut self.conn, identity, command).await {
                Ok(reply) => {
                    if !self.send(&reply).await || exit {
                        info!(peer = %self.peer, user = %identity.username, "Client signed off");
                        return;
                    }
                }
                Err(e) => {
                    self.log_failure(identity, &e);
                    if e.is_fatal() {
                        if !matches!(e, ServerError::FatalTransport(_)) {
                            // Best effort; the peer may already be gone.
                            self.send(&Reply::error(e.client_message())).await;
                        }
                        return;
                    }
                    if !self.send(&Reply::error(e.client_message())).await {
                        return;
                    }
                }
            }
        }
    }

    /// `false` when the reply could not be written.
    async fn send(&mut self, reply: &Reply) -> bool {
        match self.conn.send_reply(reply).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Could not send reply");
                false
            }
        }
    }

    async fn transport_ended(&mut self, e: &FramingError) {
        match e {
            FramingError::Timeout(idle) => {
                info!(peer = %self.peer, ?idle, "Idle timeout, closing session");
                self.send(&Reply::error("Tiempo de inactividad agotado, cerrando la conexión"))
                    .await;
            }
            FramingError::Closed => debug!(peer = %self.peer, "Client disconnected"),
            other => debug!(peer = %self.peer, error = %other, "Connection failed"),
        }
    }

    fn log_failure(&self, identity: &Identity, e: &ServerError) {
        let (peer, user) = (&self.peer, &identity.username);
        match e {
            ServerError::Store(_) | ServerError::Io(_) => {
                error!(peer = %peer, user = %user, error = %e, "Command failed")
            }
            ServerError::Transfer(_) | ServerError::FatalTransport(_) => {
                warn!(peer = %peer, user = %user, error = %e, "Transfer failed")
            }
            _ => debug!(peer = %peer, user = %user, error = %e, "Command refused"),
        }
    }
}
