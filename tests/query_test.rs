//! Query engine coverage over a live manager: planner, tiers, pipeline

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use loomdb::{CollectionManager, QueryEngine};

async fn seed_people(mgr: &Arc<CollectionManager>) {
    let coll = mgr.collection("people").unwrap();
    let people = [
        ("p1", json!({"name":"Ada","age":20,"city":"London"})),
        ("p2", json!({"name":"Brian","age":30,"city":"Paris"})),
        ("p3", json!({"name":"Cleo","age":40,"city":"London"})),
        ("p4", json!({"name":"Dan","age":50,"city":"Berlin"})),
        ("p5", json!({"name":"Eve","city":"London"})), // no age
    ];
    for (id, doc) in people {
        coll.put_document(id, &serde_json::to_vec(&doc).unwrap(), 0)
            .await
            .unwrap();
    }
}

fn ids_of(result: &[u8]) -> Vec<String> {
    let docs: Vec<Value> = serde_json::from_slice(result).unwrap();
    let mut ids: Vec<String> = docs
        .iter()
        .map(|d| d["_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn indexed_range_query_scenario() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;
    mgr.create_index("people", "age").await.unwrap();

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute(
            "people",
            br#"{"filter":{"field":"age","op":">","value":25}}"#,
        )
        .await
        .unwrap();
    assert_eq!(ids_of(&result), vec!["p2", "p3", "p4"]);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn index_consistency_with_scan() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    let engine = QueryEngine::new(mgr.clone());
    let queries: [&[u8]; 5] = [
        br#"{"filter":{"field":"age","op":"=","value":30}}"#,
        br#"{"filter":{"field":"age","op":">=","value":30}}"#,
        br#"{"filter":{"field":"age","op":"between","value":[25,45]}}"#,
        br#"{"filter":{"field":"age","op":"in","value":[20,50]}}"#,
        br#"{"filter":{"and":[{"field":"age","op":">","value":25},{"field":"city","op":"=","value":"London"}]}}"#,
    ];

    // Run each query unindexed, then indexed; results must agree
    let mut unindexed = Vec::new();
    for q in queries {
        unindexed.push(ids_of(&engine.execute("people", q).await.unwrap()));
    }

    mgr.create_index("people", "age").await.unwrap();
    for (i, q) in queries.iter().enumerate() {
        let indexed = ids_of(&engine.execute("people", q).await.unwrap());
        assert_eq!(indexed, unindexed[i], "query {} diverged with index", i);
    }

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn query_sees_cold_documents() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    // Evict everything cold, then add one hot document
    let coll = mgr.collection("people").unwrap();
    coll.flush_hot(0).await.unwrap();
    coll.put_document("p6", &serde_json::to_vec(&json!({"age":60,"city":"Oslo"})).unwrap(), 0)
        .await
        .unwrap();

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute("people", br#"{"filter":{"field":"age","op":">=","value":40}}"#)
        .await
        .unwrap();
    assert_eq!(ids_of(&result), vec!["p3", "p4", "p6"]);

    // Same with an index built after eviction
    mgr.create_index("people", "age").await.unwrap();
    let result = engine
        .execute("people", br#"{"filter":{"field":"age","op":">=","value":40}}"#)
        .await
        .unwrap();
    assert_eq!(ids_of(&result), vec!["p3", "p4", "p6"]);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn like_and_or_filters() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute("people", br#"{"filter":{"field":"name","op":"like","value":"%a%"}}"#)
        .await
        .unwrap();
    // Ada, Brian, Dan (case-insensitive)
    assert_eq!(ids_of(&result), vec!["p1", "p2", "p4"]);

    let result = engine
        .execute(
            "people",
            br#"{"filter":{"or":[{"field":"city","op":"=","value":"Paris"},{"field":"age","op":"=","value":50}]}}"#,
        )
        .await
        .unwrap();
    assert_eq!(ids_of(&result), vec!["p2", "p4"]);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn sort_paginate_and_boundaries() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    let engine = QueryEngine::new(mgr.clone());

    let result = engine
        .execute(
            "people",
            br#"{"order_by":[{"field":"age","direction":"desc"}],"limit":2}"#,
        )
        .await
        .unwrap();
    let docs: Vec<Value> = serde_json::from_slice(&result).unwrap();
    assert_eq!(docs[0]["_id"], json!("p4"));
    assert_eq!(docs[1]["_id"], json!("p3"));

    // Missing age sorts before present ones, ascending
    let result = engine
        .execute("people", br#"{"order_by":[{"field":"age"}],"limit":1}"#)
        .await
        .unwrap();
    let docs: Vec<Value> = serde_json::from_slice(&result).unwrap();
    assert_eq!(docs[0]["_id"], json!("p5"));

    // limit = 0 yields an empty list
    let result = engine.execute("people", br#"{"limit":0}"#).await.unwrap();
    assert_eq!(serde_json::from_slice::<Vec<Value>>(&result).unwrap().len(), 0);

    // offset beyond the result size yields an empty list
    let result = engine.execute("people", br#"{"offset":100}"#).await.unwrap();
    assert_eq!(serde_json::from_slice::<Vec<Value>>(&result).unwrap().len(), 0);

    // count ignores pagination
    let result = engine
        .execute("people", br#"{"count":true,"filter":{"field":"city","op":"=","value":"London"}}"#)
        .await
        .unwrap();
    assert_eq!(
        serde_json::from_slice::<Value>(&result).unwrap(),
        json!({"count": 3})
    );

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn aggregate_group_and_having() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute(
            "people",
            br#"{
                "group_by": ["city"],
                "aggregations": {
                    "n": {"func": "count", "field": "*"},
                    "avg_age": {"func": "avg", "field": "age"}
                },
                "having": {"field": "n", "op": ">", "value": 1},
                "order_by": [{"field": "city"}]
            }"#,
        )
        .await
        .unwrap();

    let rows: Vec<Value> = serde_json::from_slice(&result).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["city"], json!("London"));
    assert_eq!(rows[0]["n"], json!(3));
    assert_eq!(rows[0]["avg_age"], json!(30.0));

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn distinct_values() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;
    seed_people(&mgr).await;

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute("people", br#"{"distinct":"city"}"#)
        .await
        .unwrap();
    let mut values: Vec<String> = serde_json::from_slice::<Vec<Value>>(&result)
        .unwrap()
        .into_iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    values.sort();
    assert_eq!(values, vec!["Berlin", "London", "Paris"]);

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn lookup_join_scenario() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;

    let users = mgr.collection("users").unwrap();
    users
        .put_document("u1", br#"{"name":"Ada"}"#, 0)
        .await
        .unwrap();
    let orders = mgr.collection("orders").unwrap();
    orders
        .put_document("o1", br#"{"user_id":"u1","total":9.5}"#, 0)
        .await
        .unwrap();
    orders
        .put_document("o2", br#"{"user_id":"nobody","total":1.0}"#, 0)
        .await
        .unwrap();

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute(
            "orders",
            br#"{
                "lookups": [{"from":"users","localField":"user_id","foreignField":"_id","as":"user"}],
                "order_by": [{"field":"_id"}],
                "filter": {"field":"total","op":">","value":0}
            }"#,
        )
        .await
        .unwrap();

    let docs: Vec<Value> = serde_json::from_slice(&result).unwrap();
    assert_eq!(docs.len(), 2);
    // Single match unwraps to an object
    assert_eq!(docs[0]["user"]["name"], json!("Ada"));
    assert_eq!(docs[0]["user"]["_id"], json!("u1"));
    // No match attaches an empty array
    assert_eq!(docs[1]["user"], json!([]));

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn projection_shapes_output() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;

    let coll = mgr.collection("docs").unwrap();
    coll.put_document(
        "d1",
        br#"{"name":"Ada","address":{"city":"London","zip":"N1"},"secret":"x"}"#,
        0,
    )
    .await
    .unwrap();

    let engine = QueryEngine::new(mgr.clone());
    let result = engine
        .execute("docs", br#"{"projection":["name","address.city"]}"#)
        .await
        .unwrap();
    let docs: Vec<Value> = serde_json::from_slice(&result).unwrap();
    assert_eq!(
        docs[0],
        json!({"name":"Ada","address":{"city":"London"}})
    );

    mgr.shutdown().await.unwrap();
}

#[tokio::test]
async fn query_on_missing_collection_is_empty() {
    let dir = TempDir::new().unwrap();
    let mgr = common::open_manager(common::test_config(&dir)).await;

    let engine = QueryEngine::new(mgr.clone());
    let result = engine.execute("ghost", b"{}").await.unwrap();
    assert_eq!(result, b"[]");
    let result = engine.execute("ghost", br#"{"count":true}"#).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&result).unwrap(), json!({"count":0}));

    mgr.shutdown().await.unwrap();
}
