//! Login handshake: `AwaitingUsername -> AwaitingPassword -> Authenticated`.
//!
//! A failed login sends one generic message and returns to the username
//! prompt. `REGISTRAR <user> <pass>` at the username prompt creates a
//! `user`-level account and also returns to the username prompt.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use custodia_shared::constants::{PROMPT_PASSWORD, PROMPT_USERNAME};
use custodia_shared::protocol::{tokenize, Reply};
use custodia_shared::types::{Identity, PermissionLevel, UserId};
use custodia_store::StoreError;

use crate::error::FramingError;
use crate::framing::Connection;
use crate::ports::IdentityDirectory;

/// Where the handshake currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    AwaitingUsername,
    AwaitingPassword { username: String },
    Authenticated(Identity),
}

/// How the handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Identity),
    /// The client sent `SALIR`.
    Exit,
    /// `max_attempts` consecutive failures.
    TooManyAttempts,
}

pub struct Authenticator {
    directory: Arc<dyn IdentityDirectory>,
    max_attempts: u32,
}

impl Authenticator {
    /// `max_attempts == 0` allows unlimited retries.
    pub fn new(directory: Arc<dyn IdentityDirectory>, max_attempts: u32) -> Self {
        Self {
            directory,
            max_attempts,
        }
    }

    /// Drive the handshake until it succeeds, the client leaves, or the
    /// transport fails. Only non-recoverable framing errors are returned.
    pub async fn run<S>(&self, conn: &mut Connection<S>, peer: &str) -> Result<AuthOutcome, FramingError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut state = AuthState::AwaitingUsername;
        let mut failures: u32 = 0;

        loop {
            state = match state {
                AuthState::AwaitingUsername => {
                    conn.send_line(PROMPT_USERNAME).await?;
                    let Some(line) = recv_or_report(conn).await? else {
                        state = AuthState::AwaitingUsername;
                        continue;
                    };
                    let line = line.trim();

                    if line.eq_ignore_ascii_case("SALIR") {
                        conn.send_reply(&Reply::ok("Hasta luego")).await?;
                        return Ok(AuthOutcome::Exit);
                    }
                    if starts_with_verb(line, "REGISTRAR") {
                        let reply = self.register(line, peer).await;
                        conn.send_reply(&reply).await?;
                        AuthState::AwaitingUsername
                    } else if line.is_empty() {
                        conn.send_reply(&Reply::error("Nombre de usuario vacío")).await?;
                        AuthState::AwaitingUsername
                    } else {
                        AuthState::AwaitingPassword {
                            username: line.to_string(),
                        }
                    }
                }

                AuthState::AwaitingPassword { username } => {
                    conn.send_line(PROMPT_PASSWORD).await?;
                    let Some(password) = recv_or_report(conn).await? else {
                        state = AuthState::AwaitingUsername;
                        continue;
                    };

                    match self.check(&username, &password).await {
                        Some(identity) => AuthState::Authenticated(identity),
                        None => {
                            failures += 1;
                            info!(peer, user = %username, failures, "Login failed");
                            conn.send_reply(&Reply::error("Credenciales inválidas")).await?;

                            if self.max_attempts > 0 && failures >= self.max_attempts {
                                conn.send_reply(&Reply::error("Demasiados intentos fallidos"))
                                    .await?;
                                return Ok(AuthOutcome::TooManyAttempts);
                            }
                            AuthState::AwaitingUsername
                        }
                    }
                }

                AuthState::Authenticated(identity) => {
                    info!(peer, user = %identity.username, level = %identity.level, "Login succeeded");
                    conn.send_reply(&Reply::ok(format!(
                        "Bienvenido, {}. permissionLevel={}",
                        identity.username, identity.level
                    )))
                    .await?;
                    return Ok(AuthOutcome::Authenticated(identity));
                }
            };
        }
    }

    /// `None` on bad credentials and on internal failures alike; the client
    /// is told the same thing either way.
    async fn check(&self, username: &str, password: &str) -> Option<Identity> {
        let directory = self.directory.clone();
        let (user, pass) = (username.to_string(), password.to_string());

        match tokio::task::spawn_blocking(move || directory.authenticate(&user, &pass)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                error!(user = %username, error = %e, "Identity directory failed");
                None
            }
            Err(e) => {
                error!(user = %username, error = %e, "Authentication task failed");
                None
            }
        }
    }

    async fn register(&self, line: &str, peer: &str) -> Reply {
        let tokens = match tokenize(line) {
            Ok(tokens) => tokens,
            Err(e) => return Reply::error(e.to_string()),
        };
        let [_, username, password] = tokens.as_slice() else {
            return Reply::error("Uso: REGISTRAR <usuario> <contraseña>");
        };

        let directory = self.directory.clone();
        let (user, pass) = (username.clone(), password.clone());
        let result = tokio::task::spawn_blocking(move || {
            directory.register(&user, &pass, PermissionLevel::User)
        })
        .await;

        match result {
            Ok(Ok(UserId(id))) => {
                info!(peer, user = %username, id, "Self-registration");
                Reply::ok(format!(
                    "Usuario '{username}' registrado con nivel {}",
                    PermissionLevel::User
                ))
            }
            Ok(Err(StoreError::AlreadyExists(_))) => {
                debug!(peer, user = %username, "Registration of existing user");
                Reply::error(format!("El usuario '{username}' ya existe"))
            }
            Ok(Err(StoreError::InvalidInput(reason))) => {
                Reply::error(format!("Registro rechazado: {reason}"))
            }
            Ok(Err(e)) => {
                error!(user = %username, error = %e, "Registration failed");
                Reply::error("Error interno del servidor")
            }
            Err(e) => {
                error!(user = %username, error = %e, "Registration task failed");
                Reply::error("Error interno del servidor")
            }
        }
    }
}

/// Receive a line; a recoverable framing error is reported to the client
/// and yields `None`.
async fn recv_or_report<S>(conn: &mut Connection<S>) -> Result<Option<String>, FramingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match conn.recv_line().await {
        Ok(line) => Ok(Some(line)),
        Err(e) if e.is_recoverable() => {
            conn.send_reply(&Reply::error(e.to_string())).await?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn starts_with_verb(line: &str, verb: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|first| first.eq_ignore_ascii_case(verb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SqliteStore;
    use crate::test_support::TestClient;
    use custodia_store::Database;
    use std::time::Duration;

    fn directory() -> Arc<SqliteStore> {
        let store = SqliteStore::new(Database::open_in_memory().unwrap());
        store.register("alice", "correct-pw", PermissionLevel::User).unwrap();
        store.register("root", "toor", PermissionLevel::Admin).unwrap();
        Arc::new(store)
    }

    fn start(
        dir: Arc<SqliteStore>,
        max_attempts: u32,
    ) -> (
        TestClient,
        tokio::task::JoinHandle<Result<AuthOutcome, FramingError>>,
    ) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let handle = tokio::spawn(async move {
            let mut conn = Connection::new(server, Duration::from_secs(5));
            Authenticator::new(dir, max_attempts).run(&mut conn, "test").await
        });
        (TestClient::new(client), handle)
    }

    #[tokio::test]
    async fn test_login_reports_level() {
        let (mut client, handle) = start(directory(), 0);
        let reply = client.login("alice", "correct-pw").await;
        assert!(reply.is_ok());
        assert!(reply.text.contains("permissionLevel=user"));

        match handle.await.unwrap().unwrap() {
            AuthOutcome::Authenticated(identity) => assert_eq!(identity.username, "alice"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_loops_back_generically() {
        let dir = directory();
        let (mut client, handle) = start(dir.clone(), 0);

        let unknown = client.login("mallory", "x").await;
        let wrong = client.login("alice", "wrong").await;
        assert!(!unknown.is_ok());
        assert_eq!(unknown, wrong);

        let reply = client.login("alice", "correct-pw").await;
        assert!(reply.is_ok());
        assert!(matches!(
            handle.await.unwrap().unwrap(),
            AuthOutcome::Authenticated(_)
        ));
        assert!(dir.authenticate("mallory", "x").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (mut client, _handle) = start(directory(), 0);

        client.expect_prompt(PROMPT_USERNAME).await;
        client.send("REGISTRAR carol s3cret").await;
        assert!(client.reply().await.is_ok());

        client.expect_prompt(PROMPT_USERNAME).await;
        client.send("REGISTRAR carol again").await;
        let dup = client.reply().await;
        assert!(!dup.is_ok());
        assert!(dup.text.contains("ya existe"));

        client.expect_prompt(PROMPT_USERNAME).await;
        client.send("REGISTRAR solo").await;
        assert!(client.reply().await.text.starts_with("Uso:"));

        let reply = client.login("carol", "s3cret").await;
        assert!(reply.text.contains("permissionLevel=user"));
    }

    #[tokio::test]
    async fn test_exit_at_username_prompt() {
        let (mut client, handle) = start(directory(), 0);
        client.expect_prompt(PROMPT_USERNAME).await;
        client.send("salir").await;
        assert_eq!(client.reply().await, Reply::ok("Hasta luego"));
        assert_eq!(handle.await.unwrap().unwrap(), AuthOutcome::Exit);
    }

    #[tokio::test]
    async fn test_attempt_limit() {
        let (mut client, handle) = start(directory(), 2);
        client.login("alice", "nope").await;
        client.login("alice", "nope").await;
        assert_eq!(
            client.reply().await,
            Reply::error("Demasiados intentos fallidos")
        );
        assert_eq!(handle.await.unwrap().unwrap(), AuthOutcome::TooManyAttempts);
    }

    #[tokio::test]
    async fn test_disconnect_is_fatal() {
        let (client, handle) = start(directory(), 0);
        drop(client);
        assert!(matches!(
            handle.await.unwrap(),
            Err(FramingError::Closed)
        ));
    }
}
