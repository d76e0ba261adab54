//! Property-based checks: codec framing and document round trips

mod common;

use proptest::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

use loomdb::protocol::codec::{PayloadReader, PayloadWriter};

fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::from(n as i64)),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(depth, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4).prop_map(|m| {
                Value::Object(m.into_iter().collect())
            }),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn payload_primitives_round_trip(
        s in "[\\PC]{0,64}",
        n in any::<i64>(),
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        list in prop::collection::vec("[\\PC]{0,16}", 0..8),
    ) {
        let payload = PayloadWriter::new()
            .put_string(&s)
            .put_i64(n)
            .put_bytes(&bytes)
            .put_string_list(&list)
            .finish();

        let mut r = PayloadReader::new(&payload);
        prop_assert_eq!(r.read_string().unwrap(), s);
        prop_assert_eq!(r.read_i64().unwrap(), n);
        prop_assert_eq!(r.read_bytes().unwrap(), bytes);
        prop_assert_eq!(r.read_string_list().unwrap(), list);
        prop_assert_eq!(r.remaining(), 0);
    }
}

proptest! {
    // Each case boots a manager (and a bcrypt bootstrap), keep it small
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn set_get_round_trip_preserves_payload(
        fields in prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", arb_json(2), 0..6),
        key in "[a-zA-Z0-9_-]{1,16}",
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let dir = TempDir::new().unwrap();
            let mgr = common::open_manager(common::crash_config(&dir)).await;
            let coll = mgr.collection("props").unwrap();

            // Reserved fields are server-owned, drop them from the input
            let mut input: serde_json::Map<String, Value> =
                fields.into_iter().collect();
            input.remove("_id");
            input.remove("created_at");
            input.remove("updated_at");

            let raw = serde_json::to_vec(&Value::Object(input.clone())).unwrap();
            coll.put_document(&key, &raw, 0).await.unwrap();

            let stored = coll.get(&key).await.unwrap().expect("stored");
            let mut stored: Value = serde_json::from_slice(&stored).unwrap();
            let obj = stored.as_object_mut().unwrap();

            assert_eq!(obj.remove("_id"), Some(Value::from(key.clone())));
            assert!(obj.remove("created_at").is_some());
            assert!(obj.remove("updated_at").is_some());
            assert_eq!(obj, &input);
        });
    }
}
