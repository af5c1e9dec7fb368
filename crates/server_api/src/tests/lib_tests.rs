use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use geometry::FourCircleSolver;
use shared::{error::ErrorCode, protocol::ScanOutcome};
use storage::{MemoryStore, StoreError, StoreLocation};

use super::*;

fn context_with(policy: ScanFailurePolicy) -> (ApiContext, MemoryStore) {
    let store = MemoryStore::new();
    let ctx = ApiContext::new(
        Arc::new(store.clone()),
        Arc::new(FourCircleSolver),
        ServiceConfig {
            scan_failure_policy: policy,
            ..ServiceConfig::default()
        },
    );
    (ctx, store)
}

fn context() -> (ApiContext, MemoryStore) {
    context_with(ScanFailurePolicy::FailFast)
}

fn reflection(hkl: Vector, chi: f64, tag: &str) -> AddReflectionParams {
    AddReflectionParams {
        hkl,
        position: Position {
            delta: 60.0,
            eta: 30.0,
            chi,
            ..Position::default()
        },
        wavelength: 1.0,
        tag: Some(tag.to_string()),
    }
}

/// Cubic a = 1 crystal with UB computed and a bisecting mode set.
async fn oriented(ctx: &ApiContext, name: &str) {
    create_entity(ctx, name).await.expect("create");
    set_lattice(
        ctx,
        name,
        LatticeParams {
            a: Some(1.0),
            ..LatticeParams::default()
        },
    )
    .await
    .expect("lattice");
    add_reflection(ctx, name, reflection([0.0, 0.0, 1.0], 90.0, "r1"))
        .await
        .expect("r1");
    add_reflection(ctx, name, reflection([1.0, 0.0, 0.0], 0.0, "r2"))
        .await
        .expect("r2");
    compute_ub(ctx, name, None, None).await.expect("ub");
    set_constraints(
        ctx,
        name,
        BTreeMap::from([
            ("nu".to_string(), ConstraintValue::Value(0.0)),
            ("mu".to_string(), ConstraintValue::Value(0.0)),
            ("bisect".to_string(), ConstraintValue::Value(1.0)),
        ]),
    )
    .await
    .expect("constraints");
}

#[tokio::test]
async fn create_then_describe_is_empty() {
    let (ctx, _) = context();
    let location = create_entity(&ctx, "xtal").await.expect("create");
    assert_eq!(location, "memory://xtal");

    let summary = describe(&ctx, "xtal").await.expect("describe");
    assert_eq!(summary.name, "xtal");
    assert!(summary.lattice.is_none());
    assert!(summary.reflections.is_empty());
    assert!(summary.orientations.is_empty());
    assert!(summary.constraints.is_empty());
    assert!(summary.ub.is_none());
}

#[tokio::test]
async fn lifecycle_errors() {
    let (ctx, _) = context();
    create_entity(&ctx, "xtal").await.expect("create");
    let err = create_entity(&ctx, "xtal").await.expect_err("twice");
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    delete_entity(&ctx, "xtal").await.expect("delete");
    let err = delete_entity(&ctx, "xtal").await.expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);
    let err = describe(&ctx, "xtal").await.expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);
    let err = set_constraint(&ctx, "xtal", "delta", ConstraintValue::Value(1.0))
        .await
        .expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);

    create_entity(&ctx, "xtal").await.expect("recreate");
    assert!(describe(&ctx, "xtal").await.expect("describe").reflections.is_empty());
    assert_eq!(list_entities(&ctx).await.expect("list"), vec!["xtal".to_string()]);
}

#[tokio::test]
async fn validation_runs_before_the_store() {
    let (ctx, _) = context();
    let err = set_lattice(&ctx, "missing", LatticeParams::default())
        .await
        .expect_err("empty lattice");
    assert_eq!(err.code, ErrorCode::InvalidParameters);

    let err = set_constraint(&ctx, "missing", "gamma", ConstraintValue::Value(1.0))
        .await
        .expect_err("unknown constraint");
    assert_eq!(err.code, ErrorCode::UnknownConstraint);

    let err = modify_property(&ctx, "missing", "colour", [0.0, 0.0, 1.0])
        .await
        .expect_err("unknown property");
    assert_eq!(err.code, ErrorCode::InvalidProperty);

    let err = position_from_hkl(&ctx, "missing", [0.0, 0.0, 0.0], 1.0)
        .await
        .expect_err("zero hkl");
    assert_eq!(err.code, ErrorCode::InvalidParameters);

    let err = create_entity(&ctx, "../escape").await.expect_err("bad name");
    assert_eq!(err.code, ErrorCode::InvalidParameters);
}

#[tokio::test]
async fn duplicate_tag_does_not_change_stored_state() {
    let (ctx, store) = context();
    create_entity(&ctx, "xtal").await.expect("create");
    add_reflection(&ctx, "xtal", reflection([0.0, 0.0, 1.0], 90.0, "r1"))
        .await
        .expect("add");
    let before = store.load("xtal").await.expect("load");

    let err = add_reflection(&ctx, "xtal", reflection([1.0, 0.0, 0.0], 0.0, "r1"))
        .await
        .expect_err("duplicate");
    assert_eq!(err.code, ErrorCode::DuplicateTag);
    assert_eq!(store.load("xtal").await.expect("load"), before);
}

#[tokio::test]
async fn constraints_coerce_and_clear() {
    let (ctx, store) = context();
    create_entity(&ctx, "xtal").await.expect("create");

    let stored = set_constraint(&ctx, "xtal", "bisect", ConstraintValue::Value(1.0))
        .await
        .expect("bisect");
    assert_eq!(stored, ConstraintValue::Flag(true));
    set_constraint(&ctx, "xtal", "delta", ConstraintValue::Value(0.0))
        .await
        .expect("delta");
    set_constraint(&ctx, "xtal", "chi", ConstraintValue::Value(0.0))
        .await
        .expect("chi");
    remove_constraint(&ctx, "xtal", "chi").await.expect("remove");

    let active = get_constraints(&ctx, "xtal").await.expect("constraints");
    assert_eq!(
        active,
        BTreeMap::from([
            (ConstraintName::Delta, ConstraintValue::Value(0.0)),
            (ConstraintName::Bisect, ConstraintValue::Flag(true)),
        ])
    );

    let state = store.load("xtal").await.expect("load");
    assert!(state.constraints.is_cleared(ConstraintName::Chi));
    assert_eq!(
        state.constraints.get(ConstraintName::Delta),
        Some(ConstraintValue::Value(0.0))
    );
}

#[tokio::test]
async fn bulk_constraints_replace_previous_ones() {
    let (ctx, store) = context();
    create_entity(&ctx, "xtal").await.expect("create");
    set_constraint(&ctx, "xtal", "psi", ConstraintValue::Value(10.0))
        .await
        .expect("psi");

    set_constraints(
        &ctx,
        "xtal",
        BTreeMap::from([("a_eq_b".to_string(), ConstraintValue::Value(0.0))]),
    )
    .await
    .expect("replace");
    let active = get_constraints(&ctx, "xtal").await.expect("constraints");
    assert!(active.is_empty(), "a_eq_b=false is not active: {active:?}");
    let stored = store.load("xtal").await.expect("load").constraints;
    assert!(stored.is_cleared(ConstraintName::Psi));

    let err = set_constraints(
        &ctx,
        "xtal",
        BTreeMap::from([("sideways".to_string(), ConstraintValue::Value(0.0))]),
    )
    .await
    .expect_err("unknown");
    assert_eq!(err.code, ErrorCode::UnknownConstraint);
}

#[tokio::test]
async fn property_assignment_switches_frame() {
    let (ctx, _) = context();
    create_entity(&ctx, "xtal").await.expect("create");
    modify_property(&ctx, "xtal", "n_hkl", [0.0, 0.0, 1.0])
        .await
        .expect("n_hkl");
    modify_property(&ctx, "xtal", "n_phi", [0.0, 1.0, 0.0])
        .await
        .expect("n_phi");

    let summary = describe(&ctx, "xtal").await.expect("describe");
    assert_eq!(
        summary.vectors.reference,
        Some(shared::domain::FrameVector::Phi([0.0, 1.0, 0.0]))
    );
    assert!(summary.vectors.surface.is_none());
}

#[tokio::test]
async fn compute_ub_is_rounded_and_stored() {
    let (ctx, store) = context();
    create_entity(&ctx, "xtal").await.expect("create");
    let err = compute_ub(&ctx, "xtal", None, None).await.expect_err("no data");
    assert_eq!(err.code, ErrorCode::UnderDetermined);

    oriented(&ctx, "cubic").await;
    let ub = compute_ub(
        &ctx,
        "cubic",
        Some(TagOrIndex::Tag("r2".to_string())),
        Some(TagOrIndex::Index(1)),
    )
    .await
    .expect("ub");
    assert_eq!(ub[0][0], 6.283185);
    assert_eq!(ub[0][1], 0.0);
    assert!(store.load("cubic").await.expect("load").u.is_some());
}

#[tokio::test]
async fn positions_round_trip_through_hkl() {
    let (ctx, _) = context();
    oriented(&ctx, "cubic").await;

    let records = position_from_hkl(&ctx, "cubic", [1.0, 0.0, 1.0], 1.0)
        .await
        .expect("positions");
    assert!(!records.is_empty());
    let found = records
        .iter()
        .find(|record| record.position.delta > 0.0 && record.position.chi.abs() < 90.0)
        .expect("positive delta");
    assert!((found.position.delta - 90.0).abs() < 1e-9);
    assert!(found.virtual_angles.contains_key("theta"));

    let hkl = hkl_from_position(&ctx, "cubic", found.position, 1.0)
        .await
        .expect("hkl");
    for (got, want) in hkl.iter().zip([1.0, 0.0, 1.0]) {
        assert!((got - want).abs() < 1e-9, "{hkl:?}");
    }
}

#[tokio::test]
async fn scans_leave_stored_state_untouched() {
    let (ctx, store) = context_with(ScanFailurePolicy::Isolate);
    oriented(&ctx, "cubic").await;
    set_constraints(
        &ctx,
        "cubic",
        BTreeMap::from([
            ("nu".to_string(), ConstraintValue::Value(0.0)),
            ("mu".to_string(), ConstraintValue::Value(0.0)),
            ("chi".to_string(), ConstraintValue::Value(60.0)),
        ]),
    )
    .await
    .expect("constraints");
    let before = store.load("cubic").await.expect("load");

    let results = scan_constraint(&ctx, "cubic", "chi", 30.0, 90.0, 30.0, [0.2, 0.1, 0.3], 1.0)
        .await
        .expect("scan");
    let keys: Vec<&str> = results.keys().collect();
    assert_eq!(keys, ["30.0", "60.0", "90.0"]);

    scan_hkl(&ctx, "cubic", [0.1, 0.0, 0.1], [0.3, 0.0, 0.3], [0.1, 0.0, 0.1], 1.0)
        .await
        .expect("hkl scan");
    assert_eq!(store.load("cubic").await.expect("load"), before);
}

#[tokio::test]
async fn hkl_box_scan_covers_every_combination() {
    let (ctx, _) = context();
    oriented(&ctx, "cubic").await;

    let results = scan_hkl(&ctx, "cubic", [1.0, 0.0, 1.0], [2.0, 0.0, 2.0], [0.1, 0.0, 0.1], 0.5)
        .await
        .expect("scan");
    assert_eq!(results.len(), 121);
    assert!(matches!(
        results.get("(1.0, 0.0, 1.0)"),
        Some(ScanOutcome::Positions(records)) if !records.is_empty()
    ));
    assert!(results.get("(2.0, 0.0, 2.0)").is_some());
    assert!(results.get("(1.5, 0.0, 1.3)").is_some());
}

#[tokio::test]
async fn wavelength_scan_fails_fast_unless_isolated() {
    let (ctx, _) = context();
    oriented(&ctx, "cubic").await;
    let err = scan_wavelength(&ctx, "cubic", 0.3, 0.9, 0.3, [2.0, 0.0, 2.0])
        .await
        .expect_err("0.9 cannot reach (2, 0, 2)");
    assert_eq!(err.code, ErrorCode::SolverError);
    assert!(err.message.contains("0.9"));

    let (ctx, _) = context_with(ScanFailurePolicy::Isolate);
    oriented(&ctx, "cubic").await;
    let results = scan_wavelength(&ctx, "cubic", 0.3, 0.9, 0.3, [2.0, 0.0, 2.0])
        .await
        .expect("isolated");
    assert!(matches!(results.get("0.3"), Some(ScanOutcome::Positions(_))));
    assert!(matches!(
        results.get("0.9"),
        Some(ScanOutcome::Failed { error }) if error.code == ErrorCode::SolverError
    ));
}

#[tokio::test]
async fn scan_constraint_rejects_flags_and_unknown_names() {
    let (ctx, _) = context();
    oriented(&ctx, "cubic").await;
    let err = scan_constraint(&ctx, "cubic", "bisect", 0.0, 1.0, 1.0, [1.0, 0.0, 1.0], 1.0)
        .await
        .expect_err("flag");
    assert_eq!(err.code, ErrorCode::InvalidParameters);
    let err = scan_constraint(&ctx, "cubic", "warp", 0.0, 1.0, 1.0, [1.0, 0.0, 1.0], 1.0)
        .await
        .expect_err("unknown");
    assert_eq!(err.code, ErrorCode::UnknownConstraint);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutations_keep_every_update() {
    let (ctx, store) = context();
    create_entity(&ctx, "xtal").await.expect("create");

    let tasks = (0..16).map(|i| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            add_reflection(&ctx, "xtal", reflection([0.0, 0.0, 1.0], 90.0, &format!("r{i}"))).await
        })
    });
    for outcome in join_all(tasks).await {
        outcome.expect("join").expect("add");
    }
    assert_eq!(store.load("xtal").await.expect("load").reflections.len(), 16);
}

/// Memory store whose saves finish on a detached task after a delay, like
/// the file store's blocking writes.
#[derive(Clone)]
struct DelayedSaves {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl CalculationStore for DelayedSaves {
    async fn create(&self, name: &str) -> Result<StoreLocation, StoreError> {
        self.inner.create(name).await
    }

    async fn load(&self, name: &str) -> Result<CalculationState, StoreError> {
        self.inner.load(name).await
    }

    async fn save(&self, name: &str, state: &CalculationState) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let name = name.to_string();
        let state = state.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.save(&name, &state).await
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    async fn delete(&self, name: &str) -> Result<StoreLocation, StoreError> {
        self.inner.delete(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        self.inner.exists(name).await
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn cancelled_mutation_holds_the_lock_until_saved() {
    let inner = MemoryStore::new();
    let ctx = ApiContext::new(
        Arc::new(DelayedSaves {
            inner: inner.clone(),
            delay: Duration::from_millis(200),
        }),
        Arc::new(FourCircleSolver),
        ServiceConfig::default(),
    );
    create_entity(&ctx, "xtal").await.expect("create");

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        add_reflection(&ctx, "xtal", reflection([0.0, 0.0, 1.0], 90.0, "a")),
    )
    .await;
    assert!(abandoned.is_err(), "first add should still be saving");

    add_reflection(&ctx, "xtal", reflection([1.0, 0.0, 0.0], 0.0, "b"))
        .await
        .expect("b");

    let tags: Vec<Option<String>> = inner
        .load("xtal")
        .await
        .expect("load")
        .reflections
        .into_iter()
        .map(|reflection| reflection.tag)
        .collect();
    assert_eq!(tags, vec![Some("a".to_string()), Some("b".to_string())]);
}

#[tokio::test]
async fn different_names_do_not_block_each_other() {
    let (ctx, _) = context();
    create_entity(&ctx, "busy").await.expect("create");
    let _held = ctx.locks.write("busy").await;

    tokio::time::timeout(Duration::from_secs(1), create_entity(&ctx, "free"))
        .await
        .expect("not blocked")
        .expect("create");
    let blocked = tokio::time::timeout(Duration::from_millis(50), describe(&ctx, "busy")).await;
    assert!(blocked.is_err());
}
