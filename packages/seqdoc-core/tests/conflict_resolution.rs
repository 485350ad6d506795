use seqdoc_core::{BranchRef, Document, ReplicaId, Value};

fn full_sync(from: &Document, to: &mut Document) {
    let update = from.encode_state_as_update(Some(&to.state_vector()));
    to.apply_update(&update).unwrap();
}

#[test]
fn concurrent_inserts_at_start_order_lower_replica_first() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));

    a.transact(|txn| txn.insert_text(&text, 0, "ab")).unwrap();
    b.transact(|txn| txn.insert_text(&text, 0, "X")).unwrap();

    full_sync(&a, &mut b);
    full_sync(&b, &mut a);

    assert_eq!(a.text("t"), "abX");
    assert_eq!(b.text("t"), "abX");
}

#[test]
fn concurrent_inserts_between_shared_neighbours() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(7));
    let mut b = Document::new(ReplicaId::new(3));
    let mut c = Document::new(ReplicaId::new(5));

    a.transact(|txn| txn.insert_text(&text, 0, "ab")).unwrap();
    full_sync(&a, &mut b);
    full_sync(&a, &mut c);

    a.transact(|txn| txn.insert_text(&text, 1, "A")).unwrap();
    b.transact(|txn| txn.insert_text(&text, 1, "B")).unwrap();
    c.transact(|txn| txn.insert_text(&text, 1, "C")).unwrap();

    for _ in 0..2 {
        full_sync(&a, &mut b);
        full_sync(&b, &mut c);
        full_sync(&c, &mut a);
    }
    assert_eq!(a.text("t"), "aBCAb");
    assert_eq!(b.text("t"), a.text("t"));
    assert_eq!(c.text("t"), a.text("t"));
}

#[test]
fn runs_typed_concurrently_do_not_interleave() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));

    for (i, ch) in ["h", "e", "y"].into_iter().enumerate() {
        a.transact(|txn| txn.insert_text(&text, i as u32, ch)).unwrap();
    }
    for (i, ch) in ["y", "o"].into_iter().enumerate() {
        b.transact(|txn| txn.insert_text(&text, i as u32, ch)).unwrap();
    }
    full_sync(&a, &mut b);
    full_sync(&b, &mut a);

    assert_eq!(a.text("t"), "heyyo");
    assert_eq!(b.text("t"), "heyyo");
}

#[test]
fn concurrent_map_writes_resolve_to_one_value() {
    let meta = BranchRef::root("meta");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));

    a.transact(|txn| txn.map_set(&meta, "color", "red")).unwrap();
    b.transact(|txn| txn.map_set(&meta, "color", "blue")).unwrap();
    full_sync(&a, &mut b);
    full_sync(&b, &mut a);

    assert_eq!(a.map_get(&meta, "color"), Some(Value::from("blue")));
    assert_eq!(b.map_get(&meta, "color"), Some(Value::from("blue")));

    // a later write from either side overrides the settled value
    a.transact(|txn| txn.map_set(&meta, "color", "green")).unwrap();
    full_sync(&a, &mut b);
    assert_eq!(b.map_get(&meta, "color"), Some(Value::from("green")));
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn insert_next_to_concurrently_deleted_text_survives() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));

    a.transact(|txn| txn.insert_text(&text, 0, "abcd")).unwrap();
    full_sync(&a, &mut b);

    a.transact(|txn| txn.remove_range(&text, 1, 2)).unwrap();
    b.transact(|txn| txn.insert_text(&text, 2, "X")).unwrap();
    full_sync(&a, &mut b);
    full_sync(&b, &mut a);

    assert_eq!(a.text("t"), "aXd");
    assert_eq!(b.text("t"), "aXd");
}
