use seqdoc_core::{BranchRef, DocOptions, Document, Error, ReplicaId, StateVector};

fn updates_from(replica: u64, chunks: &[&str]) -> Vec<Vec<u8>> {
    let text = BranchRef::root("t");
    let mut doc = Document::new(ReplicaId::new(replica));
    let mut out = Vec::new();
    for chunk in chunks {
        let before = doc.state_vector();
        let len = doc.len(&text);
        doc.transact(|txn| txn.insert_text(&text, len, chunk)).unwrap();
        out.push(doc.encode_state_as_update(Some(&before)));
    }
    out
}

#[test]
fn buffers_update_until_predecessor_arrives() {
    let updates = updates_from(1, &["hello", " there"]);
    let mut doc = Document::new(ReplicaId::new(2));

    doc.apply_update(&updates[1]).unwrap();
    assert!(doc.has_pending());
    assert_eq!(doc.text("t"), "");
    let missing: StateVector = [(ReplicaId::new(1), 5)].into_iter().collect();
    assert_eq!(doc.pending_missing(), Some(&missing));

    doc.apply_update(&updates[0]).unwrap();
    assert!(!doc.has_pending());
    assert_eq!(doc.pending_missing(), None);
    assert_eq!(doc.text("t"), "hello there");
}

#[test]
fn buffers_insert_whose_origin_is_on_another_replica() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));
    a.transact(|txn| txn.insert_text(&text, 0, "ab")).unwrap();
    let first = a.encode_state_as_update(None);
    b.apply_update(&first).unwrap();
    b.transact(|txn| txn.insert_text(&text, 1, "-")).unwrap();
    let second = b.encode_state_as_update(Some(&a.state_vector()));

    let mut c = Document::new(ReplicaId::new(3));
    c.apply_update(&second).unwrap();
    let missing: StateVector = [(ReplicaId::new(1), 1)].into_iter().collect();
    assert_eq!(c.pending_missing(), Some(&missing));

    c.apply_update(&first).unwrap();
    assert_eq!(c.text("t"), "a-b");
    assert!(!c.has_pending());
}

#[test]
fn deletions_of_unknown_content_wait_for_it() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    a.transact(|txn| txn.insert_text(&text, 0, "abc")).unwrap();
    let insert = a.encode_state_as_update(None);
    let sv = a.state_vector();
    a.transact(|txn| txn.remove_range(&text, 0, 1)).unwrap();
    let delete = a.encode_state_as_update(Some(&sv));

    let mut b = Document::new(ReplicaId::new(2));
    b.apply_update(&delete).unwrap();
    assert!(b.has_pending());
    b.apply_update(&insert).unwrap();
    assert_eq!(b.text("t"), "bc");
    assert!(!b.has_pending());
    assert_eq!(b.delete_set(), a.delete_set());
}

#[test]
fn overflowing_the_pending_buffer_rejects_the_update() {
    let updates = updates_from(1, &["a", "b", "c"]);
    let options = DocOptions::new(ReplicaId::new(2)).with_max_pending_blocks(1);
    let mut doc = Document::with_options(options);

    doc.apply_update(&updates[2]).unwrap();
    assert!(doc.has_pending());
    let before = doc.snapshot();

    let err = doc.apply_update(&updates[1]).unwrap_err();
    match err {
        Error::UnresolvedDependency { missing } => {
            assert_eq!(missing.get(ReplicaId::new(1)), 1);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // the rejected update left the buffer as it was
    assert_eq!(doc.snapshot(), before);
    assert!(doc.has_pending());

    doc.apply_update(&updates[0]).unwrap();
    doc.apply_update(&updates[1]).unwrap();
    assert_eq!(doc.text("t"), "abc");
    assert!(!doc.has_pending());
}

#[test]
fn buffered_delete_ranges_count_toward_the_pending_limit() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    a.transact(|txn| txn.insert_text(&text, 0, "abcdef")).unwrap();
    let insert = a.encode_state_as_update(None);
    let sv = a.state_vector();
    a.transact(|txn| txn.remove_range(&text, 0, 1)).unwrap();
    let first_delete = a.encode_state_as_update(Some(&sv));
    a.transact(|txn| txn.remove_range(&text, 1, 1)).unwrap();
    let both_deletes = a.encode_state_as_update(Some(&sv));

    let options = DocOptions::new(ReplicaId::new(2)).with_max_pending_blocks(1);
    let mut doc = Document::with_options(options);
    doc.apply_update(&first_delete).unwrap();
    assert!(doc.has_pending());
    let missing = doc.pending_missing().cloned();

    // a second, disjoint range would make two buffered entries
    let err = doc.apply_update(&both_deletes).unwrap_err();
    assert!(matches!(err, Error::UnresolvedDependency { .. }));
    assert_eq!(doc.pending_missing().cloned(), missing);
    assert!(doc.delete_set().is_empty());

    doc.apply_update(&insert).unwrap();
    doc.apply_update(&both_deletes).unwrap();
    assert_eq!(doc.text("t"), "bdef");
    assert!(!doc.has_pending());
    assert_eq!(doc.delete_set(), a.delete_set());
}

#[test]
fn duplicate_and_overlapping_updates_are_idempotent() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    a.transact(|txn| txn.insert_text(&text, 0, "abc")).unwrap();
    let first = a.encode_state_as_update(None);
    a.transact(|txn| txn.insert_text(&text, 3, "def")).unwrap();
    let everything = a.encode_state_as_update(None);

    let mut b = Document::new(ReplicaId::new(2));
    b.apply_update(&first).unwrap();
    b.apply_update(&first).unwrap();
    b.apply_update(&everything).unwrap();
    b.apply_update(&everything).unwrap();
    assert_eq!(b.text("t"), "abcdef");
    assert_eq!(b.state_vector(), a.state_vector());
}
