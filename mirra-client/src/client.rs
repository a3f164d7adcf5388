//! Protocol driver for one synchronization run

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use mirra_index::{
    from_wire_path, Blake3Provider, DigestProvider, IndexConfig, SyncIndex, INDEX_DIR_NAME,
};
use mirra_proto::{
    codec, ActionSet, Command, FileRecord, FileState, FinishSessionRequest,
    FinishSessionResponse, GetFileRequest, GetFileResponse, GetSessionRequest,
    GetSessionResponse, GetSyncListRequest, GetSyncListResponse, SendFileRequest,
    SendFileResponse,
};

use crate::errors::{ClientError, Result};
use crate::events::{emit, EventSink, SyncEvent};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Client configuration for one root.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub root: PathBuf,
    /// Identifies this client to the server's root resolver.
    pub owner: String,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub downloaded: usize,
    pub uploaded: usize,
    pub removed: usize,
    /// Surfaced to the caller, never auto-resolved.
    pub conflicts: Vec<FileRecord>,
}

/// Drives the sync protocol end to end for one run.
pub struct SyncClient {
    config: ClientConfig,
    digest: Arc<dyn DigestProvider>,
    index_config: IndexConfig,
    events: Option<EventSink>,
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            digest: Arc::new(Blake3Provider),
            index_config: IndexConfig::default(),
            events: None,
        }
    }

    pub fn with_digest(mut self, digest: Arc<dyn DigestProvider>) -> Self {
        self.digest = digest;
        self
    }

    /// Attach an observer channel for progress narration.
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// Run one synchronization. Any failure aborts the remaining run but
    /// leaves the previously committed state and ledger intact; the
    /// ledger is only written after the server confirms the session.
    pub async fn run(&self) -> Result<SyncReport> {
        let stream = TcpStream::connect(self.config.server_addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut conn = Conn {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        };

        let session_id = self.get_session(&mut conn).await?;
        info!("Opened session {} with {}", session_id, self.config.server_addr);
        emit(
            &self.events,
            SyncEvent::SessionOpened {
                session_id: session_id.clone(),
            },
        );

        let index_dir = self.config.root.join(INDEX_DIR_NAME);
        let mut index = SyncIndex::load_or_initialize(
            &self.config.root,
            &index_dir,
            self.digest.clone(),
            self.index_config.clone(),
        )
        .await?;

        let actions = self.get_sync_list(&mut conn, &session_id, index.to_records()).await?;
        emit(
            &self.events,
            SyncEvent::Classified {
                to_upload: actions.to_upload.len(),
                to_download: actions.to_download.len(),
                to_remove: actions.to_remove.len(),
                conflicts: actions.conflicts.len(),
            },
        );
        for record in &actions.conflicts {
            warn!("Conflict on {}, leaving both copies untouched", record.path);
            emit(
                &self.events,
                SyncEvent::Conflict {
                    record: record.clone(),
                },
            );
        }

        let mut report = SyncReport::default();

        for record in &actions.to_download {
            let bytes = self.download(&mut conn, &session_id, record, &mut index).await?;
            report.downloaded += 1;
            emit(
                &self.events,
                SyncEvent::Downloaded {
                    path: record.path.clone(),
                    bytes,
                },
            );
        }

        for record in &actions.to_remove {
            self.remove_local(record, &mut index).await?;
            report.removed += 1;
            emit(
                &self.events,
                SyncEvent::Removed {
                    path: record.path.clone(),
                },
            );
        }

        for record in &actions.to_upload {
            let bytes = self.upload(&mut conn, &session_id, record, &mut index).await?;
            report.uploaded += 1;
            emit(
                &self.events,
                SyncEvent::Uploaded {
                    path: record.path.clone(),
                    bytes,
                },
            );
        }

        let finish = self.finish_session(&mut conn, &session_id).await?;
        report.conflicts = finish.conflicts;

        // Only now is the run durable on both sides.
        index.store().await?;

        let _ = codec::write_frame(&mut conn.writer, Command::Disconnect, &()).await;

        info!(
            "Sync complete: {} down, {} up, {} removed, {} conflicts",
            report.downloaded,
            report.uploaded,
            report.removed,
            report.conflicts.len()
        );
        emit(
            &self.events,
            SyncEvent::Finished {
                downloaded: report.downloaded,
                uploaded: report.uploaded,
                removed: report.removed,
                conflicts: report.conflicts.len(),
            },
        );

        Ok(report)
    }

    async fn get_session(&self, conn: &mut Conn) -> Result<String> {
        let request = GetSessionRequest {
            owner: self.config.owner.clone(),
            version: mirra_proto::PROTOCOL_VERSION.to_string(),
        };
        codec::write_frame(&mut conn.writer, Command::GetSession, &request).await?;

        let response: GetSessionResponse =
            codec::read_frame(&mut conn.reader, Command::GetSession).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Server(error));
        }
        response
            .session_id
            .ok_or(ClientError::MissingField("session_id"))
    }

    async fn get_sync_list(
        &self,
        conn: &mut Conn,
        session_id: &str,
        files: Vec<FileRecord>,
    ) -> Result<ActionSet> {
        let request = GetSyncListRequest {
            session_id: session_id.to_string(),
            files,
        };
        codec::write_frame(&mut conn.writer, Command::GetSyncList, &request).await?;

        let response: GetSyncListResponse =
            codec::read_frame(&mut conn.reader, Command::GetSyncList).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Server(error));
        }
        response.actions.ok_or(ClientError::MissingField("actions"))
    }

    /// Fetch one file, verify its digest against the trailer, then move
    /// it into the live tree. The body lands in a temp file first so a
    /// failed verification never touches the live copy.
    async fn download(
        &self,
        conn: &mut Conn,
        session_id: &str,
        record: &FileRecord,
        index: &mut SyncIndex,
    ) -> Result<u64> {
        let request = GetFileRequest {
            session_id: session_id.to_string(),
            path: record.path.clone(),
        };
        codec::write_frame(&mut conn.writer, Command::GetFile, &request).await?;

        let response: GetFileResponse =
            codec::read_frame(&mut conn.reader, Command::GetFile).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Server(error));
        }
        let size = response.size.ok_or(ClientError::MissingField("size"))?;

        let index_dir = self.config.root.join(INDEX_DIR_NAME);
        tokio::fs::create_dir_all(&index_dir).await?;
        let temp_path = index_dir.join(format!(
            "download.tmp.{}",
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut digester = self.digest.start();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = conn.reader.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(mirra_proto::ProtoError::ConnectionClosed.into());
            }
            digester.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let claimed = codec::read_digest_trailer(&mut conn.reader).await?;
        let computed = digester.finish();
        if claimed != computed {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ClientError::IntegrityMismatch {
                path: record.path.clone(),
                expected: claimed,
                actual: computed,
            });
        }

        let live = self.config.root.join(from_wire_path(&record.path)?);
        if let Some(parent) = live.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&temp_path, &live).await?;

        index.upsert(FileRecord::new(
            record.path.clone(),
            computed,
            FileState::NotChanged,
        ));
        debug!("Downloaded {} ({} bytes)", record.path, size);
        Ok(size)
    }

    /// Delete a file the server removed, dropping its ledger record.
    async fn remove_local(&self, record: &FileRecord, index: &mut SyncIndex) -> Result<()> {
        let live = self.config.root.join(from_wire_path(&record.path)?);
        match tokio::fs::remove_file(&live).await {
            Ok(()) => debug!("Removed {}", record.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Removal target already gone: {}", record.path);
            }
            Err(e) => return Err(e.into()),
        }
        index.remove(&record.path);
        Ok(())
    }

    /// Stream one local file to the server with its digest trailer.
    async fn upload(
        &self,
        conn: &mut Conn,
        session_id: &str,
        record: &FileRecord,
        index: &mut SyncIndex,
    ) -> Result<u64> {
        let live = self.config.root.join(from_wire_path(&record.path)?);
        let mut file = match tokio::fs::File::open(&live).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClientError::MissingLocalFile(record.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        let request = SendFileRequest {
            session_id: session_id.to_string(),
            path: record.path.clone(),
            size,
        };
        codec::write_frame(&mut conn.writer, Command::SendFile, &request).await?;

        let mut digester = self.digest.start();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut remaining = size;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(mirra_proto::ProtoError::ConnectionClosed.into());
            }
            digester.update(&buf[..n]);
            conn.writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        let digest = digester.finish();
        codec::write_digest_trailer(&mut conn.writer, &digest).await?;

        let response: SendFileResponse =
            codec::read_frame(&mut conn.reader, Command::SendFile).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Server(error));
        }

        index.upsert(FileRecord::new(
            record.path.clone(),
            digest,
            FileState::NotChanged,
        ));
        debug!("Uploaded {} ({} bytes)", record.path, size);
        Ok(size)
    }

    async fn finish_session(
        &self,
        conn: &mut Conn,
        session_id: &str,
    ) -> Result<FinishSessionResponse> {
        let request = FinishSessionRequest {
            session_id: session_id.to_string(),
        };
        codec::write_frame(&mut conn.writer, Command::FinishSession, &request).await?;

        let response: FinishSessionResponse =
            codec::read_frame(&mut conn.reader, Command::FinishSession).await?;
        if let Some(error) = response.error {
            return Err(ClientError::Server(error));
        }
        Ok(response)
    }
}
