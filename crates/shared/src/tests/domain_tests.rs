use super::*;

#[test]
fn constraint_names_round_trip_through_text_and_serde() {
    assert_eq!(ConstraintName::ALL.len(), 18);
    for name in ConstraintName::ALL {
        assert_eq!(name.as_str().parse::<ConstraintName>(), Ok(*name));
        let json = serde_json::to_string(name).expect("serialize");
        assert_eq!(json, format!("\"{}\"", name.as_str()));
    }
    assert_eq!(
        "theta".parse::<ConstraintName>(),
        Err("'theta' is not a valid constraint".to_string())
    );
}

#[test]
fn flag_constraints_are_the_known_four() {
    let flags: Vec<&str> = ConstraintName::ALL
        .iter()
        .filter(|name| name.is_boolean())
        .map(|name| name.as_str())
        .collect();
    assert_eq!(flags, ["mu_is_nu", "a_eq_b", "bin_eq_bout", "bisect"]);
    assert_eq!(ConstraintName::Qaz.category(), ConstraintCategory::Detector);
    assert_eq!(ConstraintName::Psi.category(), ConstraintCategory::Reference);
    assert_eq!(ConstraintName::Omega.category(), ConstraintCategory::Sample);
}

#[test]
fn cleared_constraint_survives_serialization() {
    let mut constraints = Constraints::default();
    constraints.set(ConstraintName::Delta, ConstraintValue::Value(0.0));
    constraints.set(ConstraintName::Bisect, ConstraintValue::Flag(false));
    constraints.set(ConstraintName::Chi, ConstraintValue::Value(90.0));
    constraints.clear(ConstraintName::Chi);

    let json = serde_json::to_string(&constraints).expect("serialize");
    assert_eq!(json, r#"{"delta":0.0,"chi":null,"bisect":false}"#);
    let back: Constraints = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, constraints);
    assert!(back.is_cleared(ConstraintName::Chi));

    let active: Vec<_> = back.active().collect();
    assert_eq!(
        active,
        vec![(ConstraintName::Delta, ConstraintValue::Value(0.0))]
    );
}

#[test]
fn tag_or_index_parsing() {
    assert_eq!(TagOrIndex::parse(" 2 "), TagOrIndex::Index(2));
    assert_eq!(TagOrIndex::parse("refl1"), TagOrIndex::Tag("refl1".to_string()));
    assert_eq!(TagOrIndex::parse("-1"), TagOrIndex::Tag("-1".to_string()));

    let from_json: TagOrIndex = serde_json::from_str("3").expect("index");
    assert_eq!(from_json, TagOrIndex::Index(3));
    let from_json: TagOrIndex = serde_json::from_str("\"3\"").expect("tag");
    assert_eq!(from_json, TagOrIndex::Tag("3".to_string()));
}

#[test]
fn lookup_is_one_based() {
    let mut state = CalculationState::new("xtal");
    for tag in ["a", "b"] {
        state.reflections.push(Reflection {
            hkl: [0.0, 0.0, 1.0],
            position: Position::default(),
            wavelength: 1.0,
            tag: Some(tag.to_string()),
        });
    }
    assert_eq!(state.reflection_index(&TagOrIndex::Index(1)), Some(0));
    assert_eq!(state.reflection_index(&TagOrIndex::Index(2)), Some(1));
    assert_eq!(state.reflection_index(&TagOrIndex::Index(0)), None);
    assert_eq!(state.reflection_index(&TagOrIndex::Index(3)), None);
    assert_eq!(state.reflection_index(&TagOrIndex::Tag("b".into())), Some(1));
    assert!(state.reflection_tag_in_use("a"));
    assert!(!state.orientation_tag_in_use("a"));
}

#[test]
fn property_whitelist() {
    assert_eq!("n_phi".parse::<Property>(), Ok(Property::NPhi));
    let err = "lattice".parse::<Property>().expect_err("not mutable");
    assert!(err.contains("n_hkl, n_phi, surf_nhkl, surf_nphi"));

    let mut vectors = ReferenceVectors::default();
    vectors.assign(Property::SurfNhkl, [0.0, 0.0, 1.0]);
    vectors.assign(Property::SurfNphi, [0.0, 1.0, 0.0]);
    assert_eq!(vectors.surface, Some(FrameVector::Phi([0.0, 1.0, 0.0])));
    assert_eq!(vectors.reference, None);
}
