//! Upload and download sub-protocols.
//!
//! Upload: `LISTO:` prompt, `"<n>\n"` from the client, `n` raw bytes.
//! Download: `LISTO: <n>`, client `LISTO`/`CANCELAR`, `n` raw bytes, client
//! `OK`/`ERROR`. The caller sends the final reply line in both cases.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use custodia_shared::constants::{CLIENT_CANCEL, CLIENT_READY};
use custodia_shared::protocol::Reply;

use crate::error::{FramingError, ServerError, TransferError};
use crate::files::FileStore;
use crate::framing::{transfer_from_framing, Connection};

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Inactivity allowed between chunks.
    pub chunk_timeout: Duration,
    /// Wait for the client's final download acknowledgment.
    pub ack_timeout: Duration,
    pub max_upload_bytes: u64,
}

/// How a download ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed { bytes: u64, acknowledged: bool },
    Cancelled,
}

/// Receive a new file under `name`. Returns the byte count on success. On any
/// failure the partial upload is removed and `name` is left untouched.
pub async fn receive_upload<S>(
    conn: &mut Connection<S>,
    files: &FileStore,
    name: &str,
    limits: &TransferLimits,
) -> Result<u64, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = files.path_of(name)?;
    if files.exists(name).await? {
        return Err(ServerError::conflict(format!("El archivo '{name}' ya existe")));
    }

    conn.send_reply(&Reply::ready("envie el tamano en bytes")).await?;

    let size = conn.recv_size_header(limits.chunk_timeout).await?;
    if size > limits.max_upload_bytes {
        return Err(TransferError::TooLarge {
            size,
            max: limits.max_upload_bytes,
        }
        .into());
    }

    let mut upload = match files.begin_upload().await {
        Ok(upload) => upload,
        Err(e) => {
            conn.discard(size, limits.chunk_timeout).await?;
            return Err(TransferError::Disk(e).into());
        }
    };
    let received = conn
        .recv_exact_into(size, upload.file_mut(), limits.chunk_timeout)
        .await?;

    match upload.publish(&target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(ServerError::conflict(format!(
                "El archivo '{name}' fue creado por otra sesión durante la subida"
            )));
        }
        Err(e) => return Err(TransferError::Disk(e).into()),
    }

    debug!(file = %name, bytes = received, "Upload stored");
    Ok(received)
}

/// Stream `name` to the client.
pub async fn send_download<S>(
    conn: &mut Connection<S>,
    files: &FileStore,
    name: &str,
    limits: &TransferLimits,
) -> Result<DownloadOutcome, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut file, size) = files.open_for_download(name).await?;

    conn.send_reply(&Reply::ready(size.to_string())).await?;

    let go = conn.recv_line().await?;
    let go = go.trim();
    if go.eq_ignore_ascii_case(CLIENT_CANCEL) {
        debug!(file = %name, "Download cancelled before streaming");
        return Ok(DownloadOutcome::Cancelled);
    }
    if !go.eq_ignore_ascii_case(CLIENT_READY) {
        return Err(ServerError::protocol(format!(
            "Se esperaba {CLIENT_READY} o {CLIENT_CANCEL}"
        )));
    }

    let bytes = conn
        .send_body(&mut file, size, limits.chunk_timeout)
        .await?;

    match conn.recv_line_within(limits.ack_timeout).await {
        Ok(ack) => {
            let ack = ack.trim();
            match Reply::parse(ack) {
                Some(reply) if reply.is_ok() => {}
                _ if ack.eq_ignore_ascii_case("OK") => {}
                Some(reply) => return Err(TransferError::ClientFailed(reply.text).into()),
                None => {
                    let text = ack.strip_prefix("ERROR").unwrap_or(ack).trim();
                    return Err(TransferError::ClientFailed(text.to_string()).into());
                }
            }
            Ok(DownloadOutcome::Completed {
                bytes,
                acknowledged: true,
            })
        }
        Err(FramingError::Timeout(waited)) => {
            warn!(file = %name, bytes, ?waited, "No download acknowledgment from client");
            Ok(DownloadOutcome::Completed {
                bytes,
                acknowledged: false,
            })
        }
        Err(e) => Err(transfer_from_framing(e).into()),
    }
}
