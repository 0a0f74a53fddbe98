//! # custodia-server
//!
//! Authenticated file server speaking the Custodia line protocol over TLS.
//!
//! This binary wires together:
//! - **SQLite store** for users, permission requests and verification records
//! - **Flat file directory** holding the uploaded files
//! - **Verification pipeline** (worker pool or inline) hashing and scanning
//!   every upload
//! - **Dual-stack TLS listener** running one session per connection

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use custodia_server::config::VerificationMode;
use custodia_server::files::{FileLocks, FileStore};
use custodia_server::transfer::TransferLimits;
use custodia_server::verify::{CommandScanner, MalwareScanner, NoScanner, Verifier};
use custodia_server::{
    listener, tls, InlineBackend, ListenerOptions, ServerConfig, ServerContext, SqliteStore,
    VerificationBackend, WorkerPoolBackend,
};
use custodia_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,custodia_server=debug")),
        )
        .init();

    info!("Starting Custodia file server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Storage
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create database directory {}", dir.display()))?;
            }
            Database::open_at(path)
                .with_context(|| format!("open database {}", path.display()))?
        }
        None => Database::new().context("open default database")?,
    };
    let store = Arc::new(SqliteStore::new(db));

    if let Some(admin) = &config.bootstrap_admin {
        if store
            .ensure_admin(&admin.username, &admin.password)
            .context("create bootstrap administrator")?
        {
            info!(user = %admin.username, "Bootstrap administrator created");
        }
    }

    let files = FileStore::open(config.storage_dir.clone())
        .await
        .with_context(|| format!("open storage directory {}", config.storage_dir.display()))?;
    info!(dir = %files.base_path().display(), "File storage ready");

    // -----------------------------------------------------------------------
    // 4. Verification pipeline
    // -----------------------------------------------------------------------
    let scanner: Arc<dyn MalwareScanner> = match config
        .scanner_command
        .as_deref()
        .and_then(CommandScanner::from_command_line)
    {
        Some(scanner) => Arc::new(scanner),
        None => {
            warn!("No malware scanner configured; uploads will be recorded as unscanned");
            Arc::new(NoScanner)
        }
    };
    let verifier = Arc::new(Verifier::new(store.clone(), scanner));
    let verification: Arc<dyn VerificationBackend> = match config.verification_mode {
        VerificationMode::Pool => Arc::new(WorkerPoolBackend::start(
            verifier,
            config.verification_workers,
        )),
        VerificationMode::Inline => Arc::new(InlineBackend::new(verifier)),
    };

    // -----------------------------------------------------------------------
    // 5. Shared session context
    // -----------------------------------------------------------------------
    if config.file_locking {
        info!("Per-file locking enabled");
    }
    let ctx = Arc::new(ServerContext {
        files,
        locks: FileLocks::new(config.file_locking),
        identity: store.clone(),
        records: store,
        verification,
        limits: TransferLimits {
            chunk_timeout: config.transfer_timeout,
            ack_timeout: config.ack_timeout,
            max_upload_bytes: config.max_upload_bytes,
        },
        idle_timeout: config.idle_timeout,
        max_auth_attempts: config.max_auth_attempts,
    });

    // -----------------------------------------------------------------------
    // 6. TLS listener (runs until Ctrl+C)
    // -----------------------------------------------------------------------
    let acceptor = tls::acceptor(&config.tls_cert_path, &config.tls_key_path)?;
    let handle = listener::start(
        &config.bind_host,
        config.bind_port,
        acceptor,
        ctx,
        ListenerOptions::from_config(&config),
    )?;
    info!(addrs = ?handle.local_addrs(), "Custodia server running");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("Received Ctrl+C, shutting down");

    handle.shutdown();
    handle.join().await;

    Ok(())
}
