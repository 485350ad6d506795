use seqdoc_core::{Block, BranchRef, Content, DocOptions, Document, Id, ReplicaId};

fn full_sync(from: &Document, to: &mut Document) {
    let update = from.encode_state_as_update(Some(&to.state_vector()));
    to.apply_update(&update).unwrap();
}

#[test]
fn remote_insert_anchored_in_collected_range_resolves_to_tombstone() {
    let r1 = ReplicaId::new(1);
    let mut one = Document::new(r1);
    let mut two = Document::new(ReplicaId::new(2));

    let nested = one
        .transact(|txn| {
            txn.insert_text(&BranchRef::root("t"), 0, "xy")?;
            let nested = txn.insert_branch(&BranchRef::root("list"), 0)?;
            txn.insert_text(&nested, 0, "cd")?;
            Ok(nested)
        })
        .unwrap();
    assert_eq!(nested, BranchRef::Nested(Id::new(r1, 2)));
    full_sync(&one, &mut two);

    // replica 2 anchors an insert on {1,3}
    two.transact(|txn| txn.insert_text(&nested, 1, "Z")).unwrap();
    let anchored = two.encode_state_as_update(Some(&one.state_vector()));

    // replica 1 deletes [2, 5): the branch item and everything in it
    one.transact(|txn| txn.delete_range(Id::new(r1, 2), 3)).unwrap();
    assert!(matches!(one.block(&Id::new(r1, 3)), Some(Block::Gc(_))));
    match one.block(&Id::new(r1, 2)) {
        Some(Block::Item(item)) => {
            assert!(item.deleted);
            assert_eq!(item.content, Content::Deleted(1));
        }
        other => panic!("expected collapsed branch item, got {other:?}"),
    }

    one.apply_update(&anchored).unwrap();
    assert!(!one.has_pending());
    assert!(matches!(
        one.block(&Id::new(ReplicaId::new(2), 0)),
        Some(Block::Gc(_))
    ));

    full_sync(&one, &mut two);
    assert_eq!(one.snapshot(), two.snapshot());
    assert_eq!(one.text("t"), "xy");
    assert!(one.values(&nested).is_empty());
    assert_eq!(one.delete_set(), two.delete_set());
    assert_eq!(one.delete_set(), &one.store().deleted_ranges());
    assert_eq!(two.delete_set(), &two.store().deleted_ranges());
}

#[test]
fn collapsed_items_still_anchor_concurrent_inserts() {
    let text = BranchRef::root("t");
    let mut a = Document::new(ReplicaId::new(1));
    let mut b = Document::new(ReplicaId::new(2));
    a.transact(|txn| txn.insert_text(&text, 0, "hello")).unwrap();
    full_sync(&a, &mut b);

    a.transact(|txn| txn.remove_range(&text, 1, 3)).unwrap();
    b.transact(|txn| txn.insert_text(&text, 3, "_")).unwrap();
    full_sync(&b, &mut a);
    full_sync(&a, &mut b);

    assert_eq!(a.text("t"), "h_o");
    assert_eq!(b.text("t"), "h_o");
}

#[test]
fn gc_changes_footprint_not_content() {
    let text = BranchRef::root("t");
    let mut keep = Document::with_options(DocOptions::new(ReplicaId::new(1)).with_gc(false));
    for i in 0..20u32 {
        keep.transact(|txn| txn.insert_text(&text, i, "ab")).unwrap();
    }
    keep.transact(|txn| {
        let list = txn.insert_branch(&BranchRef::root("list"), 0)?;
        txn.insert_text(&list, 0, "nested")?;
        txn.remove_range(&text, 5, 20)
    })
    .unwrap();
    keep.transact(|txn| txn.remove_range(&BranchRef::root("list"), 0, 1))
        .unwrap();

    let mut collected = Document::with_options(DocOptions::new(ReplicaId::new(2)));
    collected
        .apply_update(&keep.encode_state_as_update(None))
        .unwrap();
    assert_eq!(collected.snapshot(), keep.snapshot());

    let before = keep.snapshot();
    let blocks_before = keep.block_count();
    keep.gc().unwrap();
    assert_eq!(keep.snapshot(), before);
    assert!(keep.block_count() <= blocks_before);
    assert_eq!(keep.delete_set(), &keep.store().deleted_ranges());

    // both forms still sync to a third replica
    let mut third = Document::new(ReplicaId::new(3));
    third
        .apply_update(&collected.encode_state_as_update(None))
        .unwrap();
    assert_eq!(third.snapshot(), before);
}
