//! End-to-end tests for the in-memory store.

use super::*;
use constel_query::Schema;
use serde_json::json;
use tempfile::tempdir;

fn blog_schema() -> Schema {
    Schema::from_json(&json!({
        "entity_types": [
            {
                "name": "post",
                "roles": [
                    {"name": "slug", "kind": "scalar", "identifying": true},
                    {"name": "title", "kind": "scalar"},
                    {"name": "author", "kind": "to_one", "target": "author", "reverse": "post"},
                    {"name": "comment", "kind": "to_many", "target": "comment", "reverse": "post"}
                ]
            },
            {"name": "author", "roles": [{"name": "name", "kind": "scalar", "identifying": true}]},
            {"name": "comment", "roles": [{"name": "body", "kind": "scalar"}]}
        ]
    }))
    .unwrap()
}

#[test]
fn links_read_the_same_from_both_ends() {
    let store = MemoryStore::new(blog_schema());
    let post = store
        .seed_entity("post", &[("slug", json!("hello"))])
        .unwrap();
    let author = store
        .seed_entity("author", &[("name", json!("Bloggs"))])
        .unwrap();
    store.seed_link(post, "author", author).unwrap();

    assert_eq!(store.fetch_associated(post, "author").unwrap(), vec![author]);
    assert_eq!(store.fetch_associated(author, "post").unwrap(), vec![post]);
}

#[test]
fn to_one_link_replaces_the_previous_partner() {
    let store = MemoryStore::new(blog_schema());
    let post = store.seed_entity("post", &[("slug", json!("p"))]).unwrap();
    let a = store
        .seed_entity("author", &[("name", json!("Bloggs"))])
        .unwrap();
    let b = store
        .seed_entity("author", &[("name", json!("Smith"))])
        .unwrap();

    store.seed_link(post, "author", a).unwrap();
    store.seed_link(post, "author", b).unwrap();

    assert_eq!(store.fetch_associated(post, "author").unwrap(), vec![b]);
    // The displaced author keeps existing, just without the association.
    assert_eq!(store.fetch_associated(a, "post").unwrap(), Vec::<u64>::new());
}

#[test]
fn failed_batch_leaves_no_trace() {
    let store = MemoryStore::new(blog_schema());
    let before = store.revision();

    let mut batch = ChangeBatch::default();
    let temp = batch.next_temp();
    batch.ops.push(ChangeOp::CreateEntity {
        temp,
        entity_type: "post".to_string(),
    });
    batch.ops.push(ChangeOp::SetScalar {
        entity: EntityRef::Existing(9999),
        role: "title".to_string(),
        value: json!("boom"),
    });

    assert!(store.apply(batch, None).is_err());
    assert_eq!(store.revision(), before);
    assert!(store.fetch_matching("post", &[]).unwrap().is_empty());
}

#[test]
fn compare_and_swap_rejects_a_moved_revision() {
    let store = MemoryStore::new(blog_schema());
    let observed = store.revision();
    store.seed_entity("post", &[("slug", json!("racer"))]).unwrap();

    let mut batch = ChangeBatch::default();
    let temp = batch.next_temp();
    batch.ops.push(ChangeOp::CreateEntity {
        temp,
        entity_type: "post".to_string(),
    });
    let err = store.apply(batch, Some(observed)).unwrap_err();
    assert!(matches!(err, StoreError::RevisionConflict { .. }));
}

#[test]
fn every_commit_lands_in_the_change_log() {
    let store = MemoryStore::new(blog_schema());
    store.seed_entity("post", &[("slug", json!("a"))]).unwrap();
    store.seed_entity("post", &[("slug", json!("b"))]).unwrap();

    let log = store.changes();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].revision, 1);
    assert_eq!(log[1].revision, 2);
    assert!(log[1].summary.contains("create:1"));
}

#[test]
fn snapshot_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.json");

    let store = MemoryStore::new(blog_schema());
    let post = store
        .seed_entity("post", &[("slug", json!("hello")), ("title", json!("Hi"))])
        .unwrap();
    let author = store
        .seed_entity("author", &[("name", json!("Bloggs"))])
        .unwrap();
    store.seed_link(post, "author", author).unwrap();
    store.save_to(&path).unwrap();

    let loaded = MemoryStore::load_from(blog_schema(), &path).unwrap();
    assert_eq!(
        loaded.fetch_scalar(post, "title").unwrap(),
        Some(json!("Hi"))
    );
    assert_eq!(
        loaded.fetch_associated(author, "post").unwrap(),
        vec![post]
    );
    assert_eq!(loaded.to_snapshot().entities.len(), 2);
}

#[test]
fn snapshot_against_wrong_schema_fails_loudly() {
    let store = MemoryStore::new(blog_schema());
    store.seed_entity("post", &[("slug", json!("x"))]).unwrap();
    let snapshot = store.to_snapshot();

    let other = Schema::from_json(&json!({
        "entity_types": [{"name": "topic", "roles": [{"name": "name", "kind": "scalar"}]}]
    }))
    .unwrap();
    assert!(matches!(
        MemoryStore::from_snapshot(other, &snapshot),
        Err(persistence::PersistError::UnknownEntityType(_))
    ));
}
