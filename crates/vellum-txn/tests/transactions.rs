//! Integration tests for snapshot isolation, durability and rollback.

mod common;

use std::sync::mpsc;
use std::thread;

use vellum_common::config::DbConfig;
use vellum_common::types::{ColumnAttrs, ColumnType, Mixed, ObjKey};
use vellum_replication::{Instruction, RecordingHandler};
use vellum_txn::collection::List;
use vellum_txn::{Db, TransactStage, TxnError};

use common::{init_tracing, memory_db};

#[test]
fn test_reader_pinned_at_version_zero() {
    let db = memory_db();
    let mut reader = db.start_read(None).unwrap();
    assert_eq!(reader.version(), 0);

    let mut w = db.start_write().unwrap();
    let t = w.add_table("items").unwrap();
    for k in 1..=3 {
        w.create_object_with_key(t, ObjKey::new(k)).unwrap();
    }
    assert_eq!(w.commit().unwrap(), 1);

    // version 0 predates the table, so it holds no objects at all
    assert!(reader.find_table("items").unwrap().is_none());
    assert!(reader.table_keys().unwrap().is_empty());

    reader.advance_read(None, None).unwrap();
    assert_eq!(reader.version(), 1);
    assert_eq!(
        reader.object_keys(t).unwrap(),
        vec![ObjKey::new(1), ObjKey::new(2), ObjKey::new(3)]
    );
}

#[test]
fn test_durable_database_reopens() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("items.vellum");
    let config = DbConfig::with_path(&path).with_node_sizes(4, 4);

    let (t, name, nums) = {
        let db = Db::open(config.clone()).unwrap();
        let mut w = db.start_write().unwrap();
        let t = w.add_table("items").unwrap();
        let name = w
            .add_column(t, ColumnType::String, "name", ColumnAttrs::NONE)
            .unwrap();
        let nums = w
            .add_column(t, ColumnType::Int, "nums", ColumnAttrs::LIST)
            .unwrap();
        for k in 0..40 {
            w.create_object_with_key(t, ObjKey::new(k)).unwrap();
            w.set(t, name, ObjKey::new(k), format!("item-{k}")).unwrap();
        }
        let list = List::<i64>::new(t, nums, ObjKey::new(7));
        for v in 0..25 {
            list.add(&mut w, v * 10).unwrap();
        }
        w.commit().unwrap();

        let mut w = db.start_write().unwrap();
        w.remove_object(t, ObjKey::new(3)).unwrap();
        w.commit().unwrap();
        (t, name, nums)
    };

    let db = Db::open(config).unwrap();
    assert_eq!(db.latest_version(), 2);
    let r = db.start_read(None).unwrap();
    assert_eq!(r.table_size(t).unwrap(), 39);
    assert!(!r.has_object(t, ObjKey::new(3)).unwrap());
    assert_eq!(
        r.get(t, name, ObjKey::new(21)).unwrap(),
        Mixed::from("item-21")
    );
    let list = List::<i64>::new(t, nums, ObjKey::new(7));
    assert_eq!(list.size(&r).unwrap(), 25);
    assert_eq!(list.get(&r, 24).unwrap(), 240);
}

#[test]
fn test_rollback_reports_inverse_changes() {
    let db = memory_db();
    let mut w = db.start_write().unwrap();
    let t = w.add_table("items").unwrap();
    w.commit_and_continue_as_read().unwrap();

    w.promote_to_write(None).unwrap();
    let k = w.create_object(t).unwrap();
    let mut observer = RecordingHandler::new();
    w.rollback_and_continue_as_read(Some(&mut observer)).unwrap();

    assert_eq!(w.stage(), TransactStage::Reading);
    assert_eq!(w.table_size(t).unwrap(), 0);
    assert!(observer
        .instructions
        .iter()
        .any(|i| *i == Instruction::RemoveObject(k)));
    assert!(!w.holds_write_lock());
}

#[test]
fn test_frozen_snapshot_crosses_threads() {
    let db = memory_db();
    let mut w = db.start_write().unwrap();
    let t = w.add_table("items").unwrap();
    w.create_object_with_key(t, ObjKey::new(5)).unwrap();
    w.commit_and_continue_as_read().unwrap();

    let frozen = w.freeze().unwrap();
    assert!(frozen.is_frozen());
    assert!(matches!(
        frozen.duplicate().unwrap().stage(),
        TransactStage::Frozen
    ));

    w.promote_to_write(None).unwrap();
    w.create_object_with_key(t, ObjKey::new(6)).unwrap();
    w.commit().unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        tx.send(frozen.object_keys(t).unwrap()).unwrap();
    });
    handle.join().unwrap();
    assert_eq!(rx.recv().unwrap(), vec![ObjKey::new(5)]);
}

#[test]
fn test_second_writer_waits() {
    let db = memory_db();
    let w = db.start_write().unwrap();
    assert!(db.try_start_write().unwrap().is_none());

    let db2 = db.clone();
    let waiter = thread::spawn(move || {
        let mut w = db2.start_write().unwrap();
        w.add_table("later").unwrap();
        w.commit().unwrap()
    });
    drop(w);
    assert_eq!(waiter.join().unwrap(), 1);
}

#[test]
fn test_frozen_transaction_rejects_advance() {
    let db = memory_db();
    let mut frozen = db.start_frozen(None).unwrap();
    assert!(matches!(
        frozen.advance_read(None, None),
        Err(TxnError::IllegalOperation(_))
    ));
}
