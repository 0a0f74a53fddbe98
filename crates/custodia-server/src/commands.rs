//! Handlers for checked commands. Each returns the single reply line for
//! the client; upload and download also drive their sub-protocol on the
//! connection first.

use chrono::SubsecRound;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use custodia_shared::protocol::{quote_arg, Reply};
use custodia_shared::types::{Decision, Identity, PermissionLevel, RequestId};

use crate::dispatch::{help_text, Command};
use crate::error::ServerError;
use crate::framing::Connection;
use crate::ports::RecordStore;
use crate::session::ServerContext;
use crate::transfer::{receive_upload, send_download, DownloadOutcome};
use crate::verify::VerificationJob;
use crate::workflow;

pub async fn execute<S>(
    ctx: &ServerContext,
    conn: &mut Connection<S>,
    caller: &Identity,
    command: Command,
) -> Result<Reply, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match command {
        Command::List => list(ctx).await,
        Command::Upload {
            name,
            expected_hash,
        } => upload(ctx, conn, caller, &name, expected_hash).await,
        Command::Delete { name } => delete(ctx, caller, &name).await,
        Command::Rename { from, to } => rename(ctx, caller, &from, &to).await,
        Command::Download { name } => download(ctx, conn, &name).await,
        Command::Verify { name } => verify(ctx, &name).await,
        Command::RequestPermission { level } => request_permission(ctx, caller, level).await,
        Command::ViewRequests => view_requests(ctx, caller).await,
        Command::ResolveRequest { id, decision } => {
            resolve_request(ctx, caller, id, decision).await
        }
        Command::ListUsers => list_users(ctx).await,
        Command::Help => Ok(Reply::ok(help_text(caller.level))),
        Command::Exit => Ok(Reply::ok("Hasta luego")),
    }
}

/// Run a store round trip on the blocking pool.
async fn with_records<T, F>(ctx: &ServerContext, f: F) -> Result<T, ServerError>
where
    F: FnOnce(&dyn RecordStore) -> Result<T, ServerError> + Send + 'static,
    T: Send + 'static,
{
    let records = ctx.records.clone();
    tokio::task::spawn_blocking(move || f(records.as_ref()))
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e)))?
}

async fn list(ctx: &ServerContext) -> Result<Reply, ServerError> {
    let files = ctx.files.list().await?;
    if files.is_empty() {
        return Ok(Reply::ok("No hay archivos"));
    }
    let entries: Vec<String> = files
        .iter()
        .map(|f| format!("{} ({} bytes)", quote_arg(&f.name), f.size))
        .collect();
    Ok(Reply::ok(format!(
        "{} archivo(s): {}",
        files.len(),
        entries.join(", ")
    )))
}

async fn upload<S>(
    ctx: &ServerContext,
    conn: &mut Connection<S>,
    caller: &Identity,
    name: &str,
    expected_hash: Option<String>,
) -> Result<Reply, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _lease = ctx.locks.acquire(&[name]).await;
    let bytes = receive_upload(conn, &ctx.files, name, &ctx.limits).await?;

    let path = ctx.files.path_of(name)?;
    ctx.verification
        .submit(VerificationJob::new(name, path, expected_hash));

    info!(user = %caller.username, file = %name, bytes, "Upload complete");
    Ok(Reply::ok(format!(
        "Archivo '{name}' recibido ({bytes} bytes) bytes={bytes}"
    )))
}

async fn delete(ctx: &ServerContext, caller: &Identity, name: &str) -> Result<Reply, ServerError> {
    let _lease = ctx.locks.acquire(&[name]).await;
    ctx.files.delete(name).await?;
    info!(user = %caller.username, file = %name, "File deleted");
    Ok(Reply::ok(format!("Archivo '{name}' eliminado")))
}

async fn rename(
    ctx: &ServerContext,
    caller: &Identity,
    from: &str,
    to: &str,
) -> Result<Reply, ServerError> {
    let _lease = ctx.locks.acquire(&[from, to]).await;
    ctx.files.rename(from, to).await?;
    info!(user = %caller.username, from = %from, to = %to, "File renamed");
    Ok(Reply::ok(format!("Archivo '{from}' renombrado a '{to}'")))
}

async fn download<S>(
    ctx: &ServerContext,
    conn: &mut Connection<S>,
    name: &str,
) -> Result<Reply, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _lease = ctx.locks.acquire(&[name]).await;
    let reply = match send_download(conn, &ctx.files, name, &ctx.limits).await? {
        DownloadOutcome::Completed {
            bytes,
            acknowledged: true,
        } => Reply::ok(format!("Descarga de '{name}' completada ({bytes} bytes)")),
        DownloadOutcome::Completed {
            bytes,
            acknowledged: false,
        } => Reply::ok(format!(
            "Descarga de '{name}' enviada ({bytes} bytes), sin confirmación del cliente"
        )),
        DownloadOutcome::Cancelled => Reply::ok(format!("Descarga de '{name}' cancelada")),
    };
    Ok(reply)
}

/// Latest record newer than the file's last modification. Never waits for
/// a pending job.
async fn verify(ctx: &ServerContext, name: &str) -> Result<Reply, ServerError> {
    let Some((_, modified)) = ctx.files.stat(name).await? else {
        return Err(ServerError::not_found(format!("El archivo '{name}' no existe")));
    };

    let owned = name.to_string();
    let after = modified.trunc_subsecs(6);
    let latest = with_records(ctx, move |records| {
        Ok(records.latest_verification(&owned, after)?)
    })
    .await?;
    let Some(record) = latest else {
        return Ok(Reply::ok(format!(
            "No hay información de verificación disponible para '{name}'"
        )));
    };

    let mut text = format!(
        "{name}: outcome={} integrity={} scan={}",
        record.outcome, record.integrity, record.scan_result
    );
    if let Some(hash) = &record.actual_hash {
        text.push_str(&format!(" sha256={hash}"));
    }
    text.push_str(&format!(
        " fecha={}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S")
    ));
    if !record.message.is_empty() {
        text.push_str(&format!(" ({})", record.message));
    }
    Ok(Reply::ok(text))
}

async fn request_permission(
    ctx: &ServerContext,
    caller: &Identity,
    level: PermissionLevel,
) -> Result<Reply, ServerError> {
    let caller = caller.clone();
    let request = with_records(ctx, move |records| {
        workflow::request_permission(records, &caller, level)
    })
    .await?;
    Ok(Reply::ok(format!(
        "Solicitud {} creada para el nivel {}",
        request.id, request.requested_level
    )))
}

async fn view_requests(ctx: &ServerContext, caller: &Identity) -> Result<Reply, ServerError> {
    let caller = caller.clone();
    let requests =
        with_records(ctx, move |records| workflow::visible_requests(records, &caller)).await?;
    if requests.is_empty() {
        return Ok(Reply::ok("No hay solicitudes"));
    }
    let lines: Vec<String> = requests.iter().map(workflow::describe).collect();
    Ok(Reply::ok(format!("Solicitudes: {}", lines.join("; "))))
}

async fn resolve_request(
    ctx: &ServerContext,
    caller: &Identity,
    id: RequestId,
    decision: Decision,
) -> Result<Reply, ServerError> {
    let admin = caller.clone();
    let request = with_records(ctx, move |records| {
        workflow::resolve_request(records, &admin, id, decision)
    })
    .await?;
    let text = match decision {
        Decision::Approve => format!(
            "Solicitud {} aprobada: {} tendrá nivel {} en su próximo inicio de sesión",
            request.id, request.requester_name, request.requested_level
        ),
        Decision::Reject => format!(
            "Solicitud {} rechazada ({} -> {})",
            request.id, request.requester_name, request.requested_level
        ),
    };
    Ok(Reply::ok(text))
}

async fn list_users(ctx: &ServerContext) -> Result<Reply, ServerError> {
    let users = with_records(ctx, |records| Ok(records.list_users()?)).await?;
    let entries: Vec<String> = users
        .iter()
        .map(|u| format!("{} ({})", u.username, u.level))
        .collect();
    Ok(Reply::ok(format!(
        "{} usuario(s): {}",
        users.len(),
        entries.join(", ")
    )))
}
