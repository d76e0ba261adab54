//! Shared test plumbing: configs, a wire-level test client, response
//! decoding

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use loomdb::protocol::codec::PayloadWriter;
use loomdb::server::{handle_conn, ServerCtx};
use loomdb::{CollectionManager, CommandKind, Config};

pub const ROOT_PASSWORD: &str = "test-root-pw";

/// A config rooted in a fresh temp dir, tuned for tests
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.path().join("data");
    config.storage.save_interval_secs = 3600; // ticks off during tests
    config.expiry.sweep_interval_secs = 1;
    config.auth.root_password = ROOT_PASSWORD.to_string();
    config
}

/// Same, with the background saver disabled (crash-shaped tests)
pub fn crash_config(dir: &TempDir) -> Config {
    let mut config = test_config(dir);
    config.storage.snapshots_enabled = false;
    config
}

pub async fn open_manager(config: Config) -> Arc<CollectionManager> {
    CollectionManager::open(config).await.expect("manager opens")
}

/// A decoded response frame
#[derive(Debug)]
pub struct TestResponse {
    pub status: u8,
    pub msg: String,
    pub data: Vec<u8>,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.data).expect("response data is JSON")
    }

    pub fn data_str(&self) -> &str {
        std::str::from_utf8(&self.data).expect("response data is UTF-8")
    }
}

pub const STATUS_OK: u8 = 1;
pub const STATUS_NOT_FOUND: u8 = 2;
pub const STATUS_ERROR: u8 = 3;
pub const STATUS_BAD_COMMAND: u8 = 4;
pub const STATUS_UNAUTHORIZED: u8 = 5;
pub const STATUS_BAD_REQUEST: u8 = 6;

/// Wire-level client over an in-memory duplex to a spawned dispatcher
pub struct TestClient {
    stream: DuplexStream,
    server: tokio::task::JoinHandle<()>,
}

impl TestClient {
    /// Connect from a loopback peer
    pub fn connect(ctx: Arc<ServerCtx>) -> Self {
        Self::connect_from(ctx, "127.0.0.1:50000".parse().unwrap())
    }

    /// Connect from an arbitrary peer address
    pub fn connect_from(ctx: Arc<ServerCtx>, peer: SocketAddr) -> Self {
        let (client, server_side) = tokio::io::duplex(1 << 20);
        let server = tokio::spawn(handle_conn(server_side, peer, ctx));
        Self {
            stream: client,
            server,
        }
    }

    pub async fn send_raw(&mut self, frame: &[u8]) -> TestResponse {
        self.stream.write_all(frame).await.expect("frame written");
        self.read_response().await
    }

    pub async fn send(&mut self, kind: CommandKind, payload: PayloadWriter) -> TestResponse {
        let frame = payload.into_frame(kind);
        self.send_raw(&frame).await
    }

    async fn read_response(&mut self) -> TestResponse {
        let status = self.stream.read_u8().await.expect("status byte");
        let msg_len = self.stream.read_u32_le().await.expect("msg len");
        let mut msg = vec![0u8; msg_len as usize];
        self.stream.read_exact(&mut msg).await.expect("msg body");
        let data_len = self.stream.read_u32_le().await.expect("data len");
        let mut data = vec![0u8; data_len as usize];
        self.stream.read_exact(&mut data).await.expect("data body");
        TestResponse {
            status,
            msg: String::from_utf8_lossy(&msg).into_owned(),
            data,
        }
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> TestResponse {
        self.send(
            CommandKind::Authenticate,
            PayloadWriter::new().put_string(username).put_string(password),
        )
        .await
    }

    pub async fn authenticate_root(&mut self) {
        let resp = self.authenticate("root", ROOT_PASSWORD).await;
        assert_eq!(resp.status, STATUS_OK, "root auth failed: {}", resp.msg);
    }

    pub async fn item_set(&mut self, collection: &str, key: &str, doc: &str) -> TestResponse {
        self.send(
            CommandKind::CollectionItemSet,
            PayloadWriter::new()
                .put_string(collection)
                .put_string(key)
                .put_i64(0)
                .put_bytes(doc.as_bytes()),
        )
        .await
    }

    pub async fn item_get(&mut self, collection: &str, key: &str) -> TestResponse {
        self.send(
            CommandKind::CollectionItemGet,
            PayloadWriter::new().put_string(collection).put_string(key),
        )
        .await
    }

    pub async fn query(&mut self, collection: &str, query: &str) -> TestResponse {
        self.send(
            CommandKind::CollectionQuery,
            PayloadWriter::new()
                .put_string(collection)
                .put_bytes(query.as_bytes()),
        )
        .await
    }

    /// Close the client side and wait for the dispatcher to finish
    pub async fn close(mut self) {
        self.stream.shutdown().await.ok();
        drop(self.stream);
        self.server.await.ok();
    }
}
