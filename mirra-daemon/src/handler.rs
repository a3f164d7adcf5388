//! Per-connection command loop
//!
//! Each accepted connection is owned by exactly one task running
//! [`handle_connection`]. Protocol failures (bad header, short read,
//! unknown opcode) close the connection; session failures are reported
//! in the response payload and the connection stays open. A connection
//! serves exactly one session.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use mirra_index::{from_wire_path, DigestProvider, IndexConfig, SyncIndex, INDEX_DIR_NAME};
use mirra_proto::{
    codec, Command, FileRecord, FileState, FinishSessionRequest, FinishSessionResponse,
    GetFileRequest, GetFileResponse, GetSessionRequest, GetSessionResponse, GetSyncListRequest,
    GetSyncListResponse, ProtoError, SendFileRequest, SendFileResponse, WireError,
    PROTOCOL_VERSION,
};
use mirra_sync::{reconcile, Session, SessionStore, SyncError};

use crate::errors::Result;
use crate::resolver::RootResolver;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Shared dependencies handed to every connection task.
pub(crate) struct ServerCtx {
    pub store: SessionStore,
    pub resolver: Arc<dyn RootResolver>,
    pub digest: Arc<dyn DigestProvider>,
    pub index_config: IndexConfig,
}

fn wire_error(e: &SyncError) -> WireError {
    match e {
        SyncError::SessionNotFound(id) => WireError::session(format!("unknown session {}", id)),
        SyncError::SessionExpired(id) => WireError::session(format!("session {} expired", id)),
        SyncError::InvariantViolation(msg) => WireError::internal(msg.clone()),
        SyncError::DirtyShadow(path) => {
            WireError::internal(format!("shadow directory not empty: {}", path.display()))
        }
        SyncError::Io(e) => WireError::io(e.to_string()),
        SyncError::Index(e) => WireError::io(e.to_string()),
    }
}

/// Drive one connection until the peer disconnects or a protocol error
/// forces the connection closed.
pub(crate) async fn handle_connection(stream: TcpStream, ctx: Arc<ServerCtx>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // The single session this connection is allowed to operate on.
    let mut bound: Option<String> = None;

    loop {
        let header = match codec::read_header(&mut reader).await {
            Ok(header) => header,
            Err(ProtoError::ConnectionClosed) => {
                debug!("Connection from {} closed", peer);
                break;
            }
            Err(e) => {
                warn!("Protocol error from {}, closing: {}", peer, e);
                break;
            }
        };

        let payload = match codec::read_payload(&mut reader, header.payload_len).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Payload read failed from {}, closing: {}", peer, e);
                break;
            }
        };

        let outcome = match header.command {
            Command::GetSession => {
                handle_get_session(&ctx, &mut bound, &payload, &mut writer).await
            }
            Command::GetSyncList => {
                handle_get_sync_list(&ctx, &bound, &payload, &mut writer).await
            }
            Command::GetFile => handle_get_file(&ctx, &bound, &payload, &mut writer).await,
            Command::SendFile => {
                handle_send_file(&ctx, &bound, &payload, &mut reader, &mut writer).await
            }
            Command::FinishSession => {
                handle_finish_session(&ctx, &bound, &payload, &mut writer).await
            }
            Command::Disconnect => {
                debug!("Disconnect from {}", peer);
                break;
            }
        };

        if let Err(e) = outcome {
            error!("Command {:?} from {} failed fatally: {}", header.command, peer, e);
            break;
        }
    }

    Ok(())
}

/// Resolve the session named in a request, enforcing the one-session-
/// per-connection rule before consulting the store.
async fn lookup_session(
    ctx: &ServerCtx,
    bound: &Option<String>,
    session_id: &str,
) -> std::result::Result<Arc<tokio::sync::Mutex<Session>>, WireError> {
    match bound {
        Some(id) if id == session_id => {}
        Some(_) => {
            return Err(WireError::session(
                "session is not bound to this connection".to_string(),
            ))
        }
        None => {
            return Err(WireError::session(
                "no session opened on this connection".to_string(),
            ))
        }
    }
    ctx.store
        .acquire(session_id)
        .await
        .map_err(|e| wire_error(&e))
}

async fn handle_get_session<W>(
    ctx: &ServerCtx,
    bound: &mut Option<String>,
    payload: &[u8],
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request: GetSessionRequest = codec::decode(payload)?;

    let respond_err = |error: WireError| GetSessionResponse {
        session_id: None,
        error: Some(error),
    };

    if bound.is_some() {
        let resp = respond_err(WireError::session("connection already has a session"));
        return Ok(codec::write_frame(writer, Command::GetSession, &resp).await?);
    }

    if request.version != PROTOCOL_VERSION {
        warn!(
            "Refusing client {} speaking protocol {} (server speaks {})",
            request.owner, request.version, PROTOCOL_VERSION
        );
        let resp = respond_err(WireError::bad_request(format!(
            "unsupported protocol version {} (server speaks {})",
            request.version, PROTOCOL_VERSION
        )));
        return Ok(codec::write_frame(writer, Command::GetSession, &resp).await?);
    }

    let (root, display_name) = match ctx.resolver.resolve_root(&request.owner) {
        Some(resolved) => resolved,
        None => {
            warn!("No root configured for client {}", request.owner);
            let resp = respond_err(WireError::bad_request(format!(
                "no root configured for {}",
                request.owner
            )));
            return Ok(codec::write_frame(writer, Command::GetSession, &resp).await?);
        }
    };

    let index_dir = root.join(INDEX_DIR_NAME);
    let response = match ctx.store.create(&root, &index_dir).await {
        Ok(session) => {
            let id = session.lock().await.id().to_string();
            info!(
                "Opened session {} for {} on root {:?} ({})",
                id, request.owner, root, display_name
            );
            *bound = Some(id.clone());
            GetSessionResponse {
                session_id: Some(id),
                error: None,
            }
        }
        Err(e) => {
            error!("Session creation failed: {}", e);
            respond_err(wire_error(&e))
        }
    };

    Ok(codec::write_frame(writer, Command::GetSession, &response).await?)
}

async fn handle_get_sync_list<W>(
    ctx: &ServerCtx,
    bound: &Option<String>,
    payload: &[u8],
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request: GetSyncListRequest = codec::decode(payload)?;

    let respond_err = |error: WireError| GetSyncListResponse {
        actions: None,
        error: Some(error),
    };

    let session = match lookup_session(ctx, bound, &request.session_id).await {
        Ok(session) => session,
        Err(e) => {
            let resp = respond_err(e);
            return Ok(codec::write_frame(writer, Command::GetSyncList, &resp).await?);
        }
    };
    let mut session = session.lock().await;

    let mut index = match SyncIndex::load_or_initialize(
        session.root(),
        session.index_dir(),
        ctx.digest.clone(),
        ctx.index_config.clone(),
    )
    .await
    {
        Ok(index) => index,
        Err(e) => {
            error!("Index build failed for session {}: {}", request.session_id, e);
            let resp = respond_err(WireError::io(e.to_string()));
            return Ok(codec::write_frame(writer, Command::GetSyncList, &resp).await?);
        }
    };

    let local = index.to_records();
    let plan = match reconcile(&local, &request.files) {
        Ok(plan) => plan,
        Err(e) => {
            // Invariant violations are internal defects, reported
            // distinctly from session errors.
            error!("Reconciliation failed for session {}: {}", request.session_id, e);
            let resp = respond_err(wire_error(&e));
            return Ok(codec::write_frame(writer, Command::GetSyncList, &resp).await?);
        }
    };

    // Deleted-side removals are staged now; they carry no list entry.
    for record in &plan.stage_removals {
        if let Err(e) = session.stager.stage_removal(&record.path).await {
            error!("Failed to stage removal of {}: {}", record.path, e);
            let resp = respond_err(wire_error(&e));
            return Ok(codec::write_frame(writer, Command::GetSyncList, &resp).await?);
        }
        index.remove(&record.path);
    }

    session.conflicts = plan.actions.conflicts.clone();
    session.index = Some(index);

    let response = GetSyncListResponse {
        actions: Some(plan.actions),
        error: None,
    };
    Ok(codec::write_frame(writer, Command::GetSyncList, &response).await?)
}

async fn handle_get_file<W>(
    ctx: &ServerCtx,
    bound: &Option<String>,
    payload: &[u8],
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request: GetFileRequest = codec::decode(payload)?;

    let respond_err = |error: WireError| GetFileResponse {
        size: None,
        error: Some(error),
    };

    let session = match lookup_session(ctx, bound, &request.session_id).await {
        Ok(session) => session,
        Err(e) => {
            let resp = respond_err(e);
            return Ok(codec::write_frame(writer, Command::GetFile, &resp).await?);
        }
    };
    let mut session = session.lock().await;

    let relative = match from_wire_path(&request.path) {
        Ok(relative) => relative,
        Err(e) => {
            let resp = respond_err(WireError::bad_request(e.to_string()));
            return Ok(codec::write_frame(writer, Command::GetFile, &resp).await?);
        }
    };
    let absolute = session.root().join(relative);

    let file = match tokio::fs::File::open(&absolute).await {
        Ok(file) => file,
        Err(e) => {
            let resp = respond_err(WireError::io(format!("{}: {}", request.path, e)));
            return Ok(codec::write_frame(writer, Command::GetFile, &resp).await?);
        }
    };
    let size = file.metadata().await?.len();

    let response = GetFileResponse {
        size: Some(size),
        error: None,
    };
    codec::write_frame(writer, Command::GetFile, &response).await?;

    // The body length is announced; an IO failure from here on poisons
    // the stream, so it closes the connection rather than resync.
    let mut file = file;
    let mut digester = ctx.digest.start();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ProtoError::ConnectionClosed.into());
        }
        digester.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    let digest = digester.finish();
    codec::write_digest_trailer(writer, &digest).await?;

    // The peer now holds this content; record it as synced.
    if let Some(index) = session.index.as_mut() {
        index.upsert(FileRecord::new(
            request.path.clone(),
            digest.clone(),
            FileState::NotChanged,
        ));
    }
    debug!("Served {} ({} bytes, digest {})", request.path, size, digest);
    Ok(())
}

async fn handle_send_file<R, W>(
    ctx: &ServerCtx,
    bound: &Option<String>,
    payload: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request: SendFileRequest = codec::decode(payload)?;

    // The body follows the request unconditionally; on any error the
    // stream must still be drained before responding.
    let refuse = |error: WireError| SendFileResponse { error: Some(error) };

    let session = match lookup_session(ctx, bound, &request.session_id).await {
        Ok(session) => session,
        Err(e) => {
            drain_body(reader, request.size).await?;
            return Ok(codec::write_frame(writer, Command::SendFile, &refuse(e)).await?);
        }
    };
    let mut session = session.lock().await;

    if session.index.is_none() {
        drain_body(reader, request.size).await?;
        let resp = refuse(WireError::bad_request("sync list was not requested first"));
        return Ok(codec::write_frame(writer, Command::SendFile, &resp).await?);
    }
    if from_wire_path(&request.path).is_err() {
        drain_body(reader, request.size).await?;
        let resp = refuse(WireError::bad_request(format!("bad path {}", request.path)));
        return Ok(codec::write_frame(writer, Command::SendFile, &resp).await?);
    }

    // Stream the body into the incoming shadow directory, hashing as
    // bytes arrive.
    let shadow = session.stager.stage_incoming(&request.path).await?;
    let mut file = tokio::fs::File::create(&shadow).await?;
    let mut digester = ctx.digest.start();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = request.size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ProtoError::ConnectionClosed.into());
        }
        digester.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let claimed = codec::read_digest_trailer(reader).await?;
    let computed = digester.finish();

    let response = if claimed != computed {
        warn!(
            "Digest mismatch for {}: claimed {}, computed {}",
            request.path, claimed, computed
        );
        session.stager.discard_incoming(&request.path).await?;
        refuse(WireError::integrity(format!(
            "digest mismatch for {}",
            request.path
        )))
    } else {
        if let Some(index) = session.index.as_mut() {
            index.upsert(FileRecord::new(
                request.path.clone(),
                computed.clone(),
                FileState::NotChanged,
            ));
        }
        debug!("Staged {} ({} bytes, digest {})", request.path, request.size, computed);
        SendFileResponse { error: None }
    };

    Ok(codec::write_frame(writer, Command::SendFile, &response).await?)
}

async fn handle_finish_session<W>(
    ctx: &ServerCtx,
    bound: &Option<String>,
    payload: &[u8],
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request: FinishSessionRequest = codec::decode(payload)?;

    let respond_err = |error: WireError| FinishSessionResponse {
        conflicts: Vec::new(),
        error: Some(error),
    };

    let session = match lookup_session(ctx, bound, &request.session_id).await {
        Ok(session) => session,
        Err(e) => {
            let resp = respond_err(e);
            return Ok(codec::write_frame(writer, Command::FinishSession, &resp).await?);
        }
    };
    let mut session = session.lock().await;

    if let Err(e) = session.stager.commit().await {
        error!("Commit failed for session {}: {}", request.session_id, e);
        let resp = respond_err(wire_error(&e));
        return Ok(codec::write_frame(writer, Command::FinishSession, &resp).await?);
    }

    if let Some(index) = session.index.as_ref() {
        if let Err(e) = index.store().await {
            error!("Ledger store failed for session {}: {}", request.session_id, e);
            let resp = respond_err(WireError::io(e.to_string()));
            return Ok(codec::write_frame(writer, Command::FinishSession, &resp).await?);
        }
    }

    info!(
        "Session {} committed ({} conflicts)",
        request.session_id,
        session.conflicts.len()
    );

    let response = FinishSessionResponse {
        conflicts: session.conflicts.clone(),
        error: None,
    };
    Ok(codec::write_frame(writer, Command::FinishSession, &response).await?)
}

/// Consume and discard a file body plus its digest trailer, keeping the
/// stream aligned after a refused transfer.
async fn drain_body<R>(reader: &mut R, size: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ProtoError::ConnectionClosed.into());
        }
        remaining -= n as u64;
    }
    codec::read_digest_trailer(reader).await?;
    Ok(())
}
