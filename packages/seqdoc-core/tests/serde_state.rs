#[cfg(feature = "serde")]
#[test]
fn state_vector_json_roundtrips_as_an_entries_map() {
    use seqdoc_core::{ReplicaId, StateVector};

    let mut sv = StateVector::new();
    sv.set(ReplicaId::new(7), 3);
    sv.set(ReplicaId::new(2), 11);

    let bytes = serde_json::to_vec(&sv).expect("serialize StateVector");
    let json = std::str::from_utf8(&bytes).expect("StateVector JSON must be UTF-8");
    assert!(
        json.contains("\"entries\"") && json.contains("\"7\""),
        "expected StateVector to serialize as an entries map, got: {json}"
    );

    let roundtrip: StateVector = serde_json::from_slice(&bytes).expect("deserialize StateVector");
    assert_eq!(roundtrip, sv);
}

#[cfg(feature = "serde")]
#[test]
fn doc_options_fill_in_defaults() {
    use seqdoc_core::{options::DEFAULT_MAX_PENDING_BLOCKS, DocOptions, ReplicaId};

    let options: DocOptions =
        serde_json::from_str(r#"{"replica": 9}"#).expect("deserialize DocOptions");
    assert_eq!(options, DocOptions::new(ReplicaId::new(9)));
    assert!(options.gc);
    assert_eq!(options.max_pending_blocks, DEFAULT_MAX_PENDING_BLOCKS);
}

#[cfg(feature = "serde")]
#[test]
fn snapshot_json_roundtrips() {
    use seqdoc_core::{BranchRef, DocSnapshot, Document, ReplicaId, Value};

    let list = BranchRef::root("list");
    let mut doc = Document::new(ReplicaId::new(1));
    doc.transact(|txn| {
        txn.insert_values(&list, 0, vec![Value::Int(1), Value::String("two".into())])?;
        let nested = txn.insert_branch(&list, 2)?;
        txn.insert_text(&nested, 0, "three")?;
        txn.map_set(&list, "flag", true)
    })
    .expect("build document");

    let snapshot = doc.snapshot();
    let json = serde_json::to_string(&snapshot).expect("serialize DocSnapshot");
    let roundtrip: DocSnapshot = serde_json::from_str(&json).expect("deserialize DocSnapshot");
    assert_eq!(roundtrip, snapshot);
}
