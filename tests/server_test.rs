//! Wire-level tests: the dispatcher driven over an in-memory stream

mod common;

use serde_json::json;
use tempfile::TempDir;

use common::{TestClient, STATUS_BAD_COMMAND, STATUS_BAD_REQUEST, STATUS_NOT_FOUND, STATUS_OK, STATUS_UNAUTHORIZED};
use loomdb::protocol::codec::PayloadWriter;
use loomdb::server::ServerCtx;
use loomdb::CommandKind;

#[tokio::test]
async fn authenticate_then_set_and_get() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    let resp = client.item_set("users", "u1", r#"{"name":"Ada"}"#).await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(resp.data_str(), "u1");

    let resp = client.item_get("users", "u1").await;
    assert_eq!(resp.status, STATUS_OK);
    let doc = resp.json();
    assert_eq!(doc["_id"], json!("u1"));
    assert_eq!(doc["name"], json!("Ada"));
    assert!(doc["created_at"].is_string());

    let resp = client.item_get("users", "missing").await;
    assert_eq!(resp.status, STATUS_NOT_FOUND);

    // Deletes are idempotent over the wire
    for _ in 0..2 {
        let resp = client
            .send(
                CommandKind::CollectionItemDelete,
                PayloadWriter::new().put_string("users").put_string("u1"),
            )
            .await;
        assert_eq!(resp.status, STATUS_OK);
    }
    let resp = client.item_get("users", "u1").await;
    assert_eq!(resp.status, STATUS_NOT_FOUND);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_require_authentication() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    let resp = client.item_get("users", "u1").await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    // Bad credentials are also refused
    let resp = client.authenticate("root", "wrong").await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);
    let resp = client.authenticate("nobody", "x").await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn root_refused_from_non_loopback() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect_from(ctx, "192.0.2.7:9999".parse().unwrap());
    let resp = client.authenticate("root", common::ROOT_PASSWORD).await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_command_type_survives_connection() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    // Type 250 does not exist; payload is length-prefixed and drained
    let mut frame = vec![250u8];
    frame.extend_from_slice(&4u32.to_le_bytes());
    frame.extend_from_slice(b"junk");
    let resp = client.send_raw(&frame).await;
    assert_eq!(resp.status, STATUS_BAD_COMMAND);

    // The connection still works
    let resp = client.item_set("c", "k", r#"{"x":1}"#).await;
    assert_eq!(resp.status, STATUS_OK);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_collection_name_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    let resp = client
        .send(
            CommandKind::CollectionCreate,
            PayloadWriter::new().put_string(""),
        )
        .await;
    assert_eq!(resp.status, STATUS_BAD_REQUEST);

    let resp = client.item_set("", "k", r#"{"x":1}"#).await;
    assert_eq!(resp.status, STATUS_BAD_REQUEST);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn transaction_rollback_scenario() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    let resp = client.send(CommandKind::Begin, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_OK);

    let resp = client.item_set("k", "a", r#"{"v":1}"#).await;
    assert_eq!(resp.status, STATUS_OK);

    // Read-your-writes inside the transaction returns a complete,
    // reserved-field-stamped document like any other read
    let resp = client.item_get("k", "a").await;
    assert_eq!(resp.status, STATUS_OK);
    let doc = resp.json();
    assert_eq!(doc["_id"], json!("a"));
    assert_eq!(doc["v"], json!(1));
    assert!(doc["created_at"].is_string());
    assert!(doc["updated_at"].is_string());

    let resp = client.send(CommandKind::Rollback, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_OK);

    let resp = client.item_get("k", "a").await;
    assert_eq!(resp.status, STATUS_NOT_FOUND);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn transaction_commit_applies_buffered_ops() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    client.item_set("c", "doomed", r#"{"x":1}"#).await;

    client.send(CommandKind::Begin, PayloadWriter::new()).await;
    client.item_set("c", "kept", r#"{"x":2}"#).await;
    let resp = client
        .send(
            CommandKind::CollectionItemDelete,
            PayloadWriter::new().put_string("c").put_string("doomed"),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);

    // Not visible outside the buffer yet
    let coll = mgr.collection("c").unwrap();
    assert!(coll.get("kept").await.unwrap().is_none());

    let resp = client.send(CommandKind::Commit, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_OK);

    assert!(coll.get("kept").await.unwrap().is_some());
    assert!(coll.get("doomed").await.unwrap().is_none());

    // Committing again without a transaction is an error
    let resp = client.send(CommandKind::Commit, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_BAD_REQUEST);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn connection_close_rolls_back_open_transaction() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx.clone());
    client.authenticate_root().await;
    client.send(CommandKind::Begin, PayloadWriter::new()).await;
    client.item_set("c", "ghost", r#"{"x":1}"#).await;
    client.close().await;

    let coll = mgr.collection("c").unwrap();
    assert!(coll.get("ghost").await.unwrap().is_none());
    assert_eq!(ctx.pool.in_use(), 0);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn rbac_permissions_are_enforced() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    // Root provisions a user with read on logs, write on notes
    let mut root = TestClient::connect(ctx.clone());
    root.authenticate_root().await;
    let resp = root
        .send(
            CommandKind::UserCreate,
            PayloadWriter::new()
                .put_string("ada")
                .put_string("pw")
                .put_bytes(br#"{"logs":"read","notes":"write"}"#),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);
    root.item_set("logs", "l1", r#"{"line":"boot"}"#).await;
    root.close().await;

    let mut ada = TestClient::connect(ctx.clone());
    let resp = ada.authenticate("ada", "pw").await;
    assert_eq!(resp.status, STATUS_OK);

    // Reads allowed on logs, writes not
    let resp = ada.item_get("logs", "l1").await;
    assert_eq!(resp.status, STATUS_OK);
    let resp = ada.item_set("logs", "l2", r#"{"line":"nope"}"#).await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    // Write permission implies read
    let resp = ada.item_set("notes", "n1", r#"{"text":"hi"}"#).await;
    assert_eq!(resp.status, STATUS_OK);
    let resp = ada.item_get("notes", "n1").await;
    assert_eq!(resp.status, STATUS_OK);

    // No grant at all
    let resp = ada.item_get("secrets", "s1").await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    // System collection and root-only commands are out of reach
    let resp = ada.item_get("_system", "user:root").await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);
    let resp = ada.send(CommandKind::Backup, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);
    let resp = ada
        .send(
            CommandKind::UserDelete,
            PayloadWriter::new().put_string("root"),
        )
        .await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);

    // Collection listing only shows what ada can read
    let resp = ada.send(CommandKind::CollectionList, PayloadWriter::new()).await;
    assert_eq!(resp.status, STATUS_OK);
    let names: Vec<String> = serde_json::from_slice(&resp.data).unwrap();
    assert_eq!(names, vec!["logs".to_string(), "notes".to_string()]);

    ada.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn wire_query_and_index_management() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    for (id, age) in [("p1", 20), ("p2", 30), ("p3", 40)] {
        let doc = format!(r#"{{"age":{}}}"#, age);
        client.item_set("people", id, &doc).await;
    }

    let resp = client
        .send(
            CommandKind::CollectionIndexCreate,
            PayloadWriter::new().put_string("people").put_string("age"),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);

    let resp = client
        .send(
            CommandKind::CollectionIndexList,
            PayloadWriter::new().put_string("people"),
        )
        .await;
    let fields: Vec<String> = serde_json::from_slice(&resp.data).unwrap();
    assert_eq!(fields, vec!["age".to_string()]);

    let resp = client
        .query("people", r#"{"filter":{"field":"age","op":">","value":25}}"#)
        .await;
    assert_eq!(resp.status, STATUS_OK);
    let docs: Vec<serde_json::Value> = serde_json::from_slice(&resp.data).unwrap();
    let mut ages: Vec<i64> = docs.iter().map(|d| d["age"].as_i64().unwrap()).collect();
    ages.sort();
    assert_eq!(ages, vec![30, 40]);

    let resp = client
        .send(
            CommandKind::CollectionIndexDelete,
            PayloadWriter::new().put_string("people").put_string("age"),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);
    let resp = client
        .send(
            CommandKind::CollectionIndexDelete,
            PayloadWriter::new().put_string("people").put_string("age"),
        )
        .await;
    assert_eq!(resp.status, STATUS_NOT_FOUND);

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn main_store_is_root_only() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut root = TestClient::connect(ctx.clone());
    root.authenticate_root().await;
    let resp = root
        .send(
            CommandKind::UserCreate,
            PayloadWriter::new()
                .put_string("u")
                .put_string("pw")
                .put_bytes(br#"{"*":"write"}"#),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);

    let resp = root
        .send(
            CommandKind::Set,
            PayloadWriter::new()
                .put_string("flag")
                .put_i64(0)
                .put_bytes(b"on"),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);
    let resp = root
        .send(CommandKind::Get, PayloadWriter::new().put_string("flag"))
        .await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(resp.data, b"on");
    root.close().await;

    // Even a wildcard-write user cannot touch the main store
    let mut user = TestClient::connect(ctx);
    user.authenticate("u", "pw").await;
    let resp = user
        .send(CommandKind::Get, PayloadWriter::new().put_string("flag"))
        .await;
    assert_eq!(resp.status, STATUS_UNAUTHORIZED);
    user.close().await;

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn item_list_pages_over_wire() {
    let dir = TempDir::new().unwrap();
    // No background saver: each manual flush appends exactly one record,
    // so the cold file order equals the insertion order
    let mgr = common::open_manager(common::crash_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;

    let coll = mgr.collection("paged").unwrap();
    for i in 0..5 {
        let resp = client
            .item_set("paged", &format!("k{}", i), &format!(r#"{{"n":{}}}"#, i))
            .await;
        assert_eq!(resp.status, STATUS_OK);
        coll.flush_hot(0).await.unwrap();
    }

    let list = |offset: i64, limit: i64| {
        PayloadWriter::new()
            .put_string("paged")
            .put_i64(offset)
            .put_i64(limit)
    };
    let ids_of = |resp: &common::TestResponse| -> Vec<String> {
        serde_json::from_slice::<Vec<serde_json::Value>>(&resp.data)
            .unwrap()
            .iter()
            .map(|d| d["_id"].as_str().unwrap().to_string())
            .collect()
    };

    // A negative limit lists everything
    let resp = client.send(CommandKind::CollectionItemList, list(0, -1)).await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(ids_of(&resp), vec!["k0", "k1", "k2", "k3", "k4"]);
    let docs: Vec<serde_json::Value> = serde_json::from_slice(&resp.data).unwrap();
    assert_eq!(docs[3]["n"], json!(3));

    // A bounded page
    let resp = client.send(CommandKind::CollectionItemList, list(1, 2)).await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(ids_of(&resp), vec!["k1", "k2"]);

    // Boundaries: zero limit and an offset past the end are empty lists
    let resp = client.send(CommandKind::CollectionItemList, list(0, 0)).await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(ids_of(&resp), Vec::<String>::new());
    let resp = client.send(CommandKind::CollectionItemList, list(10, -1)).await;
    assert_eq!(resp.status, STATUS_OK);
    assert_eq!(ids_of(&resp), Vec::<String>::new());

    client.close().await;
    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn bulk_update_partial_miss_over_wire() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    let ctx = ServerCtx::new(mgr.clone());

    let mut client = TestClient::connect(ctx);
    client.authenticate_root().await;
    client.item_set("c", "x", r#"{"n":0}"#).await;

    let resp = client
        .send(
            CommandKind::CollectionItemUpdateMany,
            PayloadWriter::new()
                .put_string("c")
                .put_bytes(br#"[{"_id":"x","patch":{"n":1}},{"_id":"y","patch":{"n":2}}]"#),
        )
        .await;
    assert_eq!(resp.status, STATUS_OK);
    let body = resp.json();
    assert_eq!(body["updated"], json!(1));
    assert_eq!(body["failed_keys"], json!(["y"]));

    let resp = client.item_get("c", "x").await;
    assert_eq!(resp.json()["n"], json!(1));

    client.close().await;
    mgr.shutdown().await.unwrap();
}
