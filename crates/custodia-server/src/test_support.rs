//! Scripted protocol client and fixtures shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

use custodia_shared::constants::{CLIENT_READY, PROMPT_COMMAND, PROMPT_PASSWORD, PROMPT_USERNAME};
use custodia_shared::protocol::{quote_arg, Reply, ReplyKind};
use custodia_shared::types::PermissionLevel;
use custodia_store::Database;

use crate::files::{FileLocks, FileStore};
use crate::framing::Connection;
use crate::ports::{IdentityDirectory, SqliteStore};
use crate::session::ServerContext;
use crate::transfer::TransferLimits;
use crate::verify::{InlineBackend, NoScanner, Verifier};

const T: Duration = Duration::from_secs(5);

pub struct TestClient<S = DuplexStream> {
    conn: Connection<S>,
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            conn: Connection::new(stream, T),
        }
    }

    pub async fn recv_line(&mut self) -> String {
        self.conn.recv_line().await.expect("line from server")
    }

    pub async fn send(&mut self, line: &str) {
        self.conn.send_line(line).await.expect("send line");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let mut src = bytes;
        self.conn
            .send_body(&mut src, bytes.len() as u64, T)
            .await
            .expect("send raw bytes");
    }

    /// Write bytes without caring whether the server is still reading.
    pub async fn send_raw_unchecked(&mut self, bytes: &[u8]) {
        let mut src = bytes;
        let _ = self.conn.send_body(&mut src, bytes.len() as u64, T).await;
    }

    /// Next line, which must be a marked reply.
    pub async fn reply(&mut self) -> Reply {
        let line = self.recv_line().await;
        Reply::parse(&line).unwrap_or_else(|| panic!("expected a reply line, got {line:?}"))
    }

    pub async fn expect_prompt(&mut self, prompt: &str) {
        assert_eq!(self.recv_line().await, prompt);
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Reply {
        self.expect_prompt(PROMPT_USERNAME).await;
        self.send(username).await;
        self.expect_prompt(PROMPT_PASSWORD).await;
        self.send(password).await;
        self.reply().await
    }

    pub async fn command(&mut self, line: &str) -> Reply {
        self.expect_prompt(PROMPT_COMMAND).await;
        self.send(line).await;
        self.reply().await
    }

    /// `"<n>\n"` followed by the bytes.
    pub async fn send_bytes_framed(&mut self, data: &[u8]) {
        let mut src = data;
        self.conn
            .send_frame(&mut src, data.len() as u64, T)
            .await
            .expect("send frame");
    }

    /// Full upload exchange; returns the final reply.
    pub async fn upload(&mut self, name: &str, hash: Option<&str>, data: &[u8]) -> Reply {
        let mut line = format!("SUBIR {}", quote_arg(name));
        if let Some(hash) = hash {
            line.push(' ');
            line.push_str(hash);
        }
        let ready = self.command(&line).await;
        if ready.kind != ReplyKind::Ready {
            return ready;
        }
        self.send_bytes_framed(data).await;
        self.reply().await
    }

    /// Read `LISTO: <n>`, answer `LISTO`, and read the body.
    pub async fn receive_download(&mut self) -> Vec<u8> {
        let ready = self.reply().await;
        assert_eq!(ready.kind, ReplyKind::Ready, "{ready:?}");
        let size: u64 = ready.text.trim().parse().expect("size in ready reply");
        self.send(CLIENT_READY).await;
        self.conn.recv_exactly(size, T).await.expect("download body")
    }

    /// Full download exchange with acknowledgment. Returns the body and the
    /// final reply, or `None` and the error reply when the server refused.
    pub async fn download(&mut self, name: &str) -> (Option<Vec<u8>>, Reply) {
        self.expect_prompt(PROMPT_COMMAND).await;
        self.send(&format!("DESCARGAR {}", quote_arg(name))).await;

        let ready = self.reply().await;
        if ready.kind != ReplyKind::Ready {
            return (None, ready);
        }
        let size: u64 = ready.text.trim().parse().expect("size in ready reply");
        self.send(CLIENT_READY).await;
        let body = self.conn.recv_exactly(size, T).await.expect("download body");
        self.send("OK").await;
        (Some(body), self.reply().await)
    }
}

/// Everything a session needs, backed by a temp directory and an in-memory
/// database with `alice`/`correct-pw` (user), `bob`/`bob-pw` (user) and
/// `root`/`toor` (admin).
pub struct Fixture {
    pub ctx: Arc<ServerContext>,
    pub store: Arc<SqliteStore>,
    pub dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_locking(false).await
    }

    pub async fn with_locking(file_locking: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let files = FileStore::open(dir.path().join("archivos")).await.unwrap();

        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        store.register("alice", "correct-pw", PermissionLevel::User).unwrap();
        store.register("bob", "bob-pw", PermissionLevel::User).unwrap();
        store.register("root", "toor", PermissionLevel::Admin).unwrap();

        let verifier = Arc::new(Verifier::new(store.clone(), Arc::new(NoScanner)));

        let ctx = Arc::new(ServerContext {
            files,
            locks: FileLocks::new(file_locking),
            identity: store.clone(),
            records: store.clone(),
            verification: Arc::new(InlineBackend::new(verifier)),
            limits: TransferLimits {
                chunk_timeout: Duration::from_millis(500),
                ack_timeout: Duration::from_millis(500),
                max_upload_bytes: 1024 * 1024,
            },
            idle_timeout: T,
            max_auth_attempts: 0,
        });

        Self { ctx, store, dir }
    }
}
