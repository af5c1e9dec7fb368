use std::time::Duration;

use shared::domain::{
    ConstraintName, ConstraintValue, Orientation, Position, Reflection, TagOrIndex,
};

use super::*;

fn populated(name: &str) -> CalculationState {
    let mut state = CalculationState::new(name);
    state.reflections.push(Reflection {
        hkl: [0.0, 0.0, 1.0],
        position: Position {
            delta: 60.0,
            eta: 30.0,
            chi: 90.0,
            ..Position::default()
        },
        wavelength: 1.0,
        tag: Some("refl1".to_string()),
    });
    state.reflections.push(Reflection {
        hkl: [0.1, 0.2, 0.30000000000000004],
        position: Position::default(),
        wavelength: 1.2,
        tag: None,
    });
    state.orientations.push(Orientation {
        hkl: [1.0, 0.0, 0.0],
        xyz: [0.0, 1.0, 0.0],
        position: Position::default(),
        tag: Some("plane".to_string()),
    });
    state
        .constraints
        .set(ConstraintName::Delta, ConstraintValue::Value(0.0));
    state
        .constraints
        .set(ConstraintName::Bisect, ConstraintValue::Flag(true));
    state.constraints.clear(ConstraintName::Mu);
    state.ub = Some([[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1.0 / 3.0]]);
    state
}

#[test]
fn codec_round_trips_full_state() {
    let state = populated("xtal");
    let bytes = codec::encode(&state).expect("encode");
    let decoded = codec::decode("xtal", &bytes).expect("decode");
    assert_eq!(decoded, state);
    assert!(decoded.constraints.is_cleared(ConstraintName::Mu));
    assert_eq!(
        decoded.constraints.get(ConstraintName::Delta),
        Some(ConstraintValue::Value(0.0))
    );
    assert_eq!(
        decoded.reflection_index(&TagOrIndex::Tag("refl1".to_string())),
        Some(0)
    );
}

#[test]
fn codec_rejects_foreign_and_future_blobs() {
    let bytes = codec::encode(&CalculationState::new("first")).expect("encode");
    let err = codec::decode("second", &bytes).expect_err("name mismatch");
    assert!(matches!(err, CodecError::NameMismatch { .. }));

    let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
    envelope["format_version"] = serde_json::json!(99);
    let bumped = serde_json::to_vec(&envelope).expect("json");
    let err = codec::decode("first", &bumped).expect_err("version");
    assert!(matches!(err, CodecError::UnsupportedVersion(99)));

    assert!(matches!(
        codec::decode("first", b"not json"),
        Err(CodecError::Json(_))
    ));
}

#[test]
fn rejects_names_that_escape_the_root() {
    for bad in ["", "   ", "../etc", "a/b", "a\\b", ".hidden", "tab\there"] {
        assert!(
            matches!(validate_name(bad), Err(StoreError::InvalidName { .. })),
            "{bad:?} should be rejected"
        );
    }
    assert!(validate_name(&"x".repeat(MAX_NAME_BYTES + 1)).is_err());
    assert!(validate_name("LaMnO3_2024-01").is_ok());
}

async fn exercise_lifecycle(store: &dyn CalculationStore) {
    assert!(matches!(
        store.load("xtal").await,
        Err(StoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete("xtal").await,
        Err(StoreError::NotFound(_))
    ));

    store.create("xtal").await.expect("create");
    assert!(store.exists("xtal").await.expect("exists"));
    assert_eq!(
        store.load("xtal").await.expect("load"),
        CalculationState::new("xtal")
    );
    assert!(matches!(
        store.create("xtal").await,
        Err(StoreError::AlreadyExists(_))
    ));

    let state = populated("xtal");
    store.save("xtal", &state).await.expect("save");
    assert_eq!(store.load("xtal").await.expect("reload"), state);

    store.create("other").await.expect("create other");
    assert_eq!(
        store.list().await.expect("list"),
        vec!["other".to_string(), "xtal".to_string()]
    );

    store.delete("xtal").await.expect("delete");
    assert!(!store.exists("xtal").await.expect("exists"));
    store.create("xtal").await.expect("recreate");
    assert_eq!(
        store.load("xtal").await.expect("load"),
        CalculationState::new("xtal")
    );
}

#[tokio::test]
async fn memory_store_lifecycle() {
    let store = MemoryStore::new();
    exercise_lifecycle(&store).await;
    let location = store.delete("other").await.expect("delete");
    assert_eq!(location.as_str(), "memory://other");
}

#[tokio::test]
async fn file_store_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::new(dir.path().join("nested")).expect("store");
    exercise_lifecycle(&store).await;

    let location = store.delete("other").await.expect("delete");
    assert!(location.as_str().ends_with("other.json"));
}

#[tokio::test]
async fn file_store_save_leaves_no_temporary_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::new(dir.path()).expect("store");
    store.create("xtal").await.expect("create");
    for _ in 0..3 {
        store
            .save("xtal", &populated("xtal"))
            .await
            .expect("save");
    }

    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(entries.len(), 1, "unexpected files: {entries:?}");
}

#[tokio::test]
async fn file_store_reports_corrupt_blobs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::new(dir.path()).expect("store");
    std::fs::write(dir.path().join("broken.json"), b"{").expect("write");
    assert!(matches!(
        store.load("broken").await,
        Err(StoreError::Codec { .. })
    ));
}

#[tokio::test]
async fn file_store_rejects_invalid_names_before_io() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileStore::new(dir.path()).expect("store");
    assert!(matches!(
        store.create("../escape").await,
        Err(StoreError::InvalidName { .. })
    ));
    assert!(!dir.path().join("../escape.json").exists());
}

#[tokio::test]
async fn name_lock_is_exclusive_per_name() {
    let locks = NameLocks::new();
    let guard = locks.write("xtal").await;

    let blocked = tokio::time::timeout(Duration::from_millis(50), locks.read("xtal")).await;
    assert!(blocked.is_err(), "reader must wait for the writer");

    let other = tokio::time::timeout(Duration::from_millis(50), locks.write("other")).await;
    assert!(other.is_ok(), "different names must not block");
    drop(other);

    drop(guard);
    let _first = locks.read("xtal").await;
    let second = tokio::time::timeout(Duration::from_millis(50), locks.read("xtal")).await;
    assert!(second.is_ok(), "readers share the lock");
}

#[tokio::test]
async fn name_locks_are_released_when_unused() {
    let locks = NameLocks::new();
    {
        let _a = locks.write("a").await;
        let _b = locks.read("b").await;
        assert_eq!(locks.tracked().await, 2);
    }
    assert_eq!(locks.tracked().await, 0);
}
