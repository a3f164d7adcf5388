//! End-to-end synchronization scenarios over a real TCP connection

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use mirra_client::{ClientConfig, SyncClient};
use mirra_daemon::{ServerConfig, ServerHandle, StaticRoot, SyncServer};
use mirra_index::{hash_bytes, Blake3Provider, INDEX_DIR_NAME, LEDGER_FILE_NAME};
use mirra_proto::{
    codec, Command, FileRecord, FileState, GetSessionRequest, GetSessionResponse,
    GetSyncListRequest, GetSyncListResponse, SendFileRequest, SendFileResponse,
    PROTOCOL_VERSION,
};
use mirra_sync::SessionConfig;

struct TestServer {
    addr: SocketAddr,
    handle: ServerHandle,
    task: JoinHandle<mirra_daemon::Result<()>>,
}

impl TestServer {
    async fn start(root: &Path) -> Self {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            session: SessionConfig {
                timeout: Duration::from_secs(60),
                min_create_interval: Duration::ZERO,
            },
            shutdown_timeout: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(30),
        };
        let resolver = Arc::new(StaticRoot::new(root, "test-server"));
        let server = SyncServer::bind(config, resolver).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        let task = tokio::spawn(server.run());
        Self { addr, handle, task }
    }

    async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap().unwrap();
    }
}

fn client_for(root: &Path, addr: SocketAddr) -> SyncClient {
    SyncClient::new(ClientConfig {
        server_addr: addr,
        root: root.to_path_buf(),
        owner: "test-client".to_string(),
    })
}

async fn write_file(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, content).await.unwrap();
}

async fn read_file(root: &Path, rel: &str) -> Vec<u8> {
    tokio::fs::read(root.join(rel)).await.unwrap()
}

fn setup() -> (TempDir, TempDir) {
    (tempdir().unwrap(), tempdir().unwrap())
}

#[tokio::test]
async fn scenario_a_new_file_reaches_server() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"testcontent1").await;

    let report = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.downloaded, 0);
    assert!(report.conflicts.is_empty());

    assert_eq!(read_file(server_dir.path(), "file1.txt").await, b"testcontent1");
    server.stop().await;
}

#[tokio::test]
async fn scenario_b_modified_file_replaces_server_copy() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"testcontent1").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    write_file(client_dir.path(), "file1.txt", b"testcontent1-appended").await;
    let report = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.uploaded, 1);

    // Exactly the new content, not double-appended.
    assert_eq!(
        read_file(server_dir.path(), "file1.txt").await,
        b"testcontent1-appended"
    );
    server.stop().await;
}

#[tokio::test]
async fn scenario_c_deleted_file_removed_from_server() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"testcontent1").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert!(server_dir.path().join("file1.txt").exists());

    tokio::fs::remove_file(client_dir.path().join("file1.txt")).await.unwrap();
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    assert!(!server_dir.path().join("file1.txt").exists());
    server.stop().await;
}

#[tokio::test]
async fn scenario_d_rename_propagates_as_delete_plus_add() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"testcontent1").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    tokio::fs::rename(
        client_dir.path().join("file1.txt"),
        client_dir.path().join("file22.txt"),
    )
    .await
    .unwrap();
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    assert!(!server_dir.path().join("file1.txt").exists());
    assert_eq!(read_file(server_dir.path(), "file22.txt").await, b"testcontent1");
    server.stop().await;
}

#[tokio::test]
async fn second_client_downloads_server_state() {
    let (server_dir, client_dir) = setup();
    let other_dir = tempdir().unwrap();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "shared/notes.txt", b"from the first client").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    let report = client_for(other_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.downloaded, 1);

    assert_eq!(
        read_file(other_dir.path(), "shared/notes.txt").await,
        b"from the first client"
    );
    server.stop().await;
}

#[tokio::test]
async fn both_sides_modified_is_a_conflict_and_left_untouched() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"common").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    write_file(server_dir.path(), "file1.txt", b"server edit").await;
    write_file(client_dir.path(), "file1.txt", b"client edit").await;

    let report = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].path, "file1.txt");

    // Neither copy is clobbered.
    assert_eq!(read_file(server_dir.path(), "file1.txt").await, b"server edit");
    assert_eq!(read_file(client_dir.path(), "file1.txt").await, b"client edit");

    // Nobody resolved anything, so the next run must surface the same
    // conflict instead of quietly declaring both sides clean.
    let second = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(second.conflicts.len(), 1);
    assert_eq!(second.conflicts[0].path, "file1.txt");
    assert_eq!(second.downloaded, 0);
    assert_eq!(second.uploaded, 0);
    assert_eq!(read_file(server_dir.path(), "file1.txt").await, b"server edit");
    assert_eq!(read_file(client_dir.path(), "file1.txt").await, b"client edit");
    server.stop().await;
}

#[tokio::test]
async fn server_side_edit_downloads_once() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "file1.txt", b"v1").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    write_file(server_dir.path(), "file1.txt", b"v2").await;
    let report = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(read_file(client_dir.path(), "file1.txt").await, b"v2");

    // Both ledgers now agree; nothing moves again.
    let settled = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(settled.downloaded, 0);
    assert_eq!(settled.uploaded, 0);
    assert!(settled.conflicts.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn clean_rerun_transfers_nothing() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "a.txt", b"alpha").await;
    write_file(client_dir.path(), "b/c.txt", b"gamma").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    let report = client_for(client_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.downloaded, 0);
    assert_eq!(report.removed, 0);
    assert!(report.conflicts.is_empty());
    server.stop().await;
}

/// Staging without `FinishSession` must leave the server's live tree and
/// ledger exactly as they were, across a server restart.
#[tokio::test]
async fn abandoned_session_leaves_live_tree_untouched() {
    let (server_dir, client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    write_file(client_dir.path(), "keep.txt", b"committed earlier").await;
    client_for(client_dir.path(), server.addr).run().await.unwrap();

    // Speak the wire protocol directly: open a session, announce a new
    // file, stream its body, then vanish before FinishSession.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    codec::write_frame(
        &mut writer,
        Command::GetSession,
        &GetSessionRequest {
            owner: "rude-client".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await
    .unwrap();
    let open: GetSessionResponse = codec::read_frame(&mut reader, Command::GetSession)
        .await
        .unwrap();
    let session_id = open.session_id.unwrap();

    let body = b"never committed";
    let digest = hash_bytes(&Blake3Provider, body);
    let ghost = FileRecord::new("ghost.txt", digest.clone(), FileState::New);

    codec::write_frame(
        &mut writer,
        Command::GetSyncList,
        &GetSyncListRequest {
            session_id: session_id.clone(),
            files: vec![
                FileRecord::new(
                    "keep.txt",
                    hash_bytes(&Blake3Provider, b"committed earlier"),
                    FileState::NotChanged,
                ),
                ghost.clone(),
            ],
        },
    )
    .await
    .unwrap();
    let list: GetSyncListResponse = codec::read_frame(&mut reader, Command::GetSyncList)
        .await
        .unwrap();
    assert!(list.error.is_none());

    codec::write_frame(
        &mut writer,
        Command::SendFile,
        &SendFileRequest {
            session_id,
            path: "ghost.txt".to_string(),
            size: body.len() as u64,
        },
    )
    .await
    .unwrap();
    writer.write_all(body).await.unwrap();
    codec::write_digest_trailer(&mut writer, &digest).await.unwrap();
    let sent: SendFileResponse = codec::read_frame(&mut reader, Command::SendFile)
        .await
        .unwrap();
    assert!(sent.error.is_none());

    // Connection dies here, as if the client process crashed.
    drop(reader);
    drop(writer);
    server.stop().await;

    // Live tree: only the previously committed file.
    assert!(!server_dir.path().join("ghost.txt").exists());
    assert_eq!(
        read_file(server_dir.path(), "keep.txt").await,
        b"committed earlier"
    );
    // Ledger was not rewritten either.
    let ledger = read_file(
        server_dir.path(),
        &format!("{}/{}", INDEX_DIR_NAME, LEDGER_FILE_NAME),
    )
    .await;
    assert!(!String::from_utf8(ledger).unwrap().contains("ghost.txt"));

    // A restarted server serves the old state as if nothing happened.
    let server = TestServer::start(server_dir.path()).await;
    let fresh_dir = tempdir().unwrap();
    let report = client_for(fresh_dir.path(), server.addr).run().await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert!(fresh_dir.path().join("keep.txt").exists());
    assert!(!fresh_dir.path().join("ghost.txt").exists());
    server.stop().await;
}

#[tokio::test]
async fn mismatched_protocol_version_is_refused() {
    let (server_dir, _client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    codec::write_frame(
        &mut writer,
        Command::GetSession,
        &GetSessionRequest {
            owner: "stale-client".to_string(),
            version: "0.0.1".to_string(),
        },
    )
    .await
    .unwrap();
    let open: GetSessionResponse = codec::read_frame(&mut reader, Command::GetSession)
        .await
        .unwrap();
    assert!(open.session_id.is_none());
    assert!(open.error.is_some());

    // Same connection, right version: accepted.
    codec::write_frame(
        &mut writer,
        Command::GetSession,
        &GetSessionRequest {
            owner: "stale-client".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await
    .unwrap();
    let open: GetSessionResponse = codec::read_frame(&mut reader, Command::GetSession)
        .await
        .unwrap();
    assert!(open.session_id.is_some());

    drop(reader);
    drop(writer);
    server.stop().await;
}

#[tokio::test]
async fn unknown_session_is_refused_but_connection_survives() {
    let (server_dir, _client_dir) = setup();
    let server = TestServer::start(server_dir.path()).await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    codec::write_frame(
        &mut writer,
        Command::GetSyncList,
        &GetSyncListRequest {
            session_id: "does-not-exist".to_string(),
            files: vec![],
        },
    )
    .await
    .unwrap();
    let response: GetSyncListResponse = codec::read_frame(&mut reader, Command::GetSyncList)
        .await
        .unwrap();
    assert!(response.actions.is_none());
    assert!(response.error.is_some());

    // The connection is still usable for a proper session.
    codec::write_frame(
        &mut writer,
        Command::GetSession,
        &GetSessionRequest {
            owner: "late-client".to_string(),
            version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await
    .unwrap();
    let open: GetSessionResponse = codec::read_frame(&mut reader, Command::GetSession)
        .await
        .unwrap();
    assert!(open.session_id.is_some());

    drop(reader);
    drop(writer);
    server.stop().await;
}
