mod common;

use common::HashEmbedder;
use memoir::db::{MemoryOp, MemoryStore, MemoryType, NewMemory};
use memoir::error::MemoryError;

const DIM: usize = 64;

fn test_store() -> MemoryStore {
    MemoryStore::open(":memory:").expect("in-memory store")
}

fn new_mem(key: &str, value: &str) -> NewMemory {
    NewMemory {
        kind: MemoryType::Fact,
        category: "general".into(),
        key: key.into(),
        value: value.into(),
        confidence: 0.9,
        source_turn: 1,
    }
}

fn embed(text: &str) -> Vec<f32> {
    HashEmbedder::new(DIM).embed_sync(text)
}

#[test]
fn add_and_get_roundtrip() {
    let store = test_store();
    let id = store.add(new_mem("User_Name", "Alex"), &embed("user_name: Alex")).unwrap();
    let mem = store.get_by_id(&id).unwrap().unwrap();
    assert_eq!(mem.key, "user_name", "keys are canonicalized to lowercase");
    assert_eq!(mem.value, "Alex");
    assert_eq!(mem.source_turn, 1);
    assert_eq!(mem.last_used_turn, 0);
    assert!(mem.is_active);
    assert_eq!(store.active_count().unwrap(), 1);
}

#[test]
fn duplicate_active_key_is_rejected_atomically() {
    let store = test_store();
    store.add(new_mem("user_name", "Alex"), &embed("user_name: Alex")).unwrap();
    let err = store.add(new_mem("user_name", "Sam"), &embed("user_name: Sam")).unwrap_err();
    assert!(matches!(err, MemoryError::DuplicateKey(_)));

    // The failed insert must leave nothing behind in any index.
    assert_eq!(store.active_count().unwrap(), 1);
    let integrity = store.integrity().unwrap();
    assert!(integrity.ok, "{integrity:?}");
}

#[test]
fn expired_key_can_be_reused() {
    let store = test_store();
    let id = store.add(new_mem("user_name", "Alex"), &embed("user_name: Alex")).unwrap();
    store.expire(&id).unwrap();
    store.add(new_mem("user_name", "Sam"), &embed("user_name: Sam")).unwrap();

    let active = store.get_active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].value, "Sam");
    // The old row is retained for audit, inactive.
    let old = store.get_by_id(&id).unwrap().unwrap();
    assert!(!old.is_active);
}

#[test]
fn expire_key_soft_deletes_the_active_holder() {
    let store = test_store();
    let id = store.add(new_mem("user_name", "Alex"), &embed("user_name: Alex")).unwrap();
    store.expire_key("user_name").unwrap();
    assert!(!store.get_by_id(&id).unwrap().unwrap().is_active);
    assert_eq!(store.active_count().unwrap(), 0);

    // Expiring a key with no active holder is an error, like expire by id.
    assert!(matches!(store.expire_key("user_name"), Err(MemoryError::NotFound(_))));
}

#[test]
fn update_mutates_in_place_preserving_source_turn() {
    let store = test_store();
    let id = store.add(new_mem("home_city", "Pune"), &embed("home_city: Pune")).unwrap();
    let updated = store
        .update(&id, Some("Berlin"), Some(0.95), Some(&embed("home_city: Berlin")))
        .unwrap();
    assert_eq!(updated.value, "Berlin");
    assert_eq!(updated.source_turn, 1);
    assert!(updated.updated_at >= updated.created_at);

    // FTS follows the new value.
    assert!(!store.search_fts("berlin", 5).is_empty());
    assert!(store.search_fts("pune", 5).is_empty());
}

#[test]
fn update_of_inactive_memory_fails() {
    let store = test_store();
    let id = store.add(new_mem("home_city", "Pune"), &embed("home_city: Pune")).unwrap();
    store.expire(&id).unwrap();
    assert!(matches!(
        store.update(&id, Some("Berlin"), None, None),
        Err(MemoryError::NotFound(_))
    ));
}

#[test]
fn expire_removes_from_both_aux_indexes() {
    let store = test_store();
    let id = store.add(new_mem("allergy", "peanuts"), &embed("allergy: peanuts")).unwrap();
    let before = store.integrity().unwrap();
    assert_eq!((before.active, before.vector_indexed, before.fts_indexed), (1, 1, 1));

    store.expire(&id).unwrap();
    let after = store.integrity().unwrap();
    assert_eq!((after.active, after.vector_indexed, after.fts_indexed), (0, 0, 0));
    assert!(store.search_vector(&embed("allergy: peanuts"), 5).is_empty());
}

#[test]
fn touch_never_decreases_last_used_turn() {
    let store = test_store();
    let id = store.add(new_mem("user_name", "Alex"), &embed("user_name: Alex")).unwrap();
    store.touch(&id, 7).unwrap();
    assert_eq!(store.get_by_id(&id).unwrap().unwrap().last_used_turn, 7);
    store.touch(&id, 3).unwrap();
    assert_eq!(store.get_by_id(&id).unwrap().unwrap().last_used_turn, 7);
    store.touch(&id, 12).unwrap();
    assert_eq!(store.get_by_id(&id).unwrap().unwrap().last_used_turn, 12);
}

#[test]
fn search_vector_orders_by_distance_over_active_only() {
    let store = test_store();
    let a = store
        .add(new_mem("favorite_food", "spicy ramen"), &embed("favorite_food: spicy ramen"))
        .unwrap();
    let b = store
        .add(new_mem("commute_mode", "bicycle"), &embed("commute_mode: bicycle"))
        .unwrap();

    let hits = store.search_vector(&embed("favorite_food: spicy ramen"), 10);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, a);
    assert!(hits[0].1 <= hits[1].1);

    store.expire(&b).unwrap();
    assert_eq!(store.search_vector(&embed("bicycle"), 10).len(), 1);
}

#[test]
fn apply_ops_is_all_or_nothing() {
    let store = test_store();
    let ops = vec![
        MemoryOp::Add {
            fields: new_mem("user_name", "Alex"),
            embedding: embed("user_name: Alex"),
        },
        MemoryOp::Update {
            id: "mem_doesnotexist".into(),
            value: Some("x".into()),
            confidence: None,
            embedding: None,
        },
    ];
    assert!(store.apply_ops(ops).is_err());

    // First op must have rolled back with the second.
    assert_eq!(store.active_count().unwrap(), 0);
    assert!(store.integrity().unwrap().ok);
}

#[test]
fn apply_ops_expire_then_add_reuses_key_in_one_transaction() {
    let store = test_store();
    let old = store.add(new_mem("favorite_color", "blue"), &embed("favorite_color: blue")).unwrap();

    let report = store
        .apply_ops(vec![
            MemoryOp::Expire { id: old.clone() },
            MemoryOp::Add {
                fields: NewMemory { confidence: 0.95, ..new_mem("favorite_color", "red") },
                embedding: embed("favorite_color: red"),
            },
        ])
        .unwrap();
    assert_eq!((report.added, report.updated, report.expired), (1, 0, 1));

    let active = store.get_active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].value, "red");
    assert!(!store.get_by_id(&old).unwrap().unwrap().is_active);
    assert!(store.integrity().unwrap().ok);
}

#[test]
fn profile_mirrors_high_confidence_preferences() {
    let store = test_store();
    let pref = NewMemory {
        kind: MemoryType::Preference,
        category: "style".into(),
        key: "writing_tone".into(),
        value: "casual".into(),
        confidence: 0.9,
        source_turn: 2,
    };
    let id = store.add(pref, &embed("writing_tone: casual")).unwrap();
    assert_eq!(store.profile_snapshot().unwrap().get("writing_tone").unwrap(), "casual");

    store.expire(&id).unwrap();
    assert!(store.profile_snapshot().unwrap().is_empty());

    // Low-confidence preferences stay out of the profile.
    let hunch = NewMemory {
        kind: MemoryType::Preference,
        category: "style".into(),
        key: "writing_tone".into(),
        value: "formal".into(),
        confidence: 0.5,
        source_turn: 3,
    };
    store.add(hunch, &embed("writing_tone: formal")).unwrap();
    assert!(store.profile_snapshot().unwrap().is_empty());
}

#[test]
fn restart_preserves_turns_memories_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memoir.db");
    let path = path.to_str().unwrap();

    let id;
    {
        let store = MemoryStore::open(path).unwrap();
        id = store.add(new_mem("user_name", "Alex"), &embed("user_name: Alex")).unwrap();
        store.log_turn("user", "my name is Alex", &[id.clone()]).unwrap();
        store.log_turn("assistant", "hi Alex", &[]).unwrap();
        store.touch(&id, 1).unwrap();
    }

    let store = MemoryStore::open(path).unwrap();
    assert_eq!(store.last_turn_id().unwrap(), 2);
    assert_eq!(store.active_count().unwrap(), 1);
    assert_eq!(store.get_by_id(&id).unwrap().unwrap().last_used_turn, 1);

    // Both indexes answer identically after reopen.
    let vec_hits = store.search_vector(&embed("user_name: Alex"), 5);
    assert_eq!(vec_hits.first().map(|(i, _)| i.clone()), Some(id.clone()));
    let fts_hits = store.search_fts("alex", 5);
    assert_eq!(fts_hits.first().map(|(i, _)| i.clone()), Some(id.clone()));

    // Turn ids stay dense across the restart.
    assert_eq!(store.log_turn("user", "hello again", &[]).unwrap(), 3);
}

#[test]
fn index_coherence_holds_through_mixed_operations() {
    let store = test_store();
    let mut ids = Vec::new();
    for i in 0..6 {
        let key = format!("fact_{i}");
        let value = format!("value number {i}");
        ids.push(store.add(new_mem(&key, &value), &embed(&format!("{key}: {value}"))).unwrap());
        assert!(store.integrity().unwrap().ok);
    }
    store.update(&ids[0], Some("rewritten"), None, Some(&embed("fact_0: rewritten"))).unwrap();
    store.expire(&ids[1]).unwrap();
    store.expire(&ids[2]).unwrap();

    let integrity = store.integrity().unwrap();
    assert!(integrity.ok, "{integrity:?}");
    assert_eq!(integrity.active, 4);
    assert_eq!(integrity.vector_indexed, 4);
    assert_eq!(integrity.fts_indexed, 4);
}
