use runwatch_storage::keys::{tracked_key, tracked_prefix};
use runwatch_storage::{read_json, write_json, KeyIndex, KvStore, SqliteStore};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[test]
fn index_survives_reopen() {
    let file = NamedTempFile::new().expect("temp db");
    {
        let store = Arc::new(SqliteStore::open(file.path(), "runwatch").expect("open"));
        let index = KeyIndex::new(store.clone());
        index
            .add(&tracked_prefix(7), &tracked_key(7, 42))
            .expect("add");
        write_json(store.as_ref(), &tracked_key(7, 42), &"payload").expect("write");
    }

    let store = Arc::new(SqliteStore::open(file.path(), "runwatch").expect("reopen"));
    let index = KeyIndex::new(store.clone());
    assert_eq!(
        index.list_keys(&tracked_prefix(7)).expect("list"),
        vec![tracked_key(7, 42)]
    );
    let value: Option<String> = read_json(store.as_ref(), &tracked_key(7, 42)).expect("read");
    assert_eq!(value.as_deref(), Some("payload"));
}

#[test]
fn evicted_entries_stay_listed_but_read_as_absent() {
    let store = Arc::new(
        SqliteStore::open_in_memory("runwatch")
            .expect("open")
            .with_max_entries(3),
    );
    let index = KeyIndex::new(store.clone());

    for run_id in [1, 2, 3] {
        write_json(store.as_ref(), &tracked_key(7, run_id), &run_id).expect("write");
    }
    for run_id in [1, 2, 3] {
        index
            .add(&tracked_prefix(7), &tracked_key(7, run_id))
            .expect("add");
    }

    assert_eq!(store.len().expect("len"), 3);
    assert_eq!(index.list_keys(&tracked_prefix(7)).expect("list").len(), 3);

    let present = index
        .list_keys(&tracked_prefix(7))
        .expect("list")
        .into_iter()
        .filter_map(|key| read_json::<u64>(store.as_ref(), &key).expect("read"))
        .collect::<Vec<_>>();
    assert!(present.len() < 3, "oldest entries were evicted: {present:?}");
}

#[test]
fn namespaces_share_a_file_without_overlap() {
    let file = NamedTempFile::new().expect("temp db");
    let left = SqliteStore::open(file.path(), "left").expect("open left");
    let right = SqliteStore::open(file.path(), "right").expect("open right");

    left.set("runs:1", "[]").expect("set");
    assert_eq!(right.get("runs:1").expect("get"), None);

    right.clear().expect("clear right");
    assert_eq!(left.get("runs:1").expect("get").as_deref(), Some("[]"));
}
