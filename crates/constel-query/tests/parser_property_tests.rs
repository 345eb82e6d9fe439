//! Property tests for the query parser: no input panics, and well-formed
//! inputs map onto the model shapes they denote.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use constel_query::{
    parse_query, FilterOp, MatchArm, MatchMode, NodePayload, Schema,
};

fn blog_schema() -> Schema {
    Schema::from_json(&json!({
        "entity_types": [
            {
                "name": "post",
                "roles": [
                    {"name": "slug", "kind": "scalar"},
                    {"name": "score", "kind": "scalar"},
                    {"name": "author", "kind": "to_one", "target": "author", "reverse": "post"}
                ]
            },
            {"name": "author", "roles": [{"name": "name", "kind": "scalar"}]}
        ]
    }))
    .unwrap()
}

/// Arbitrary JSON, bounded in depth and width.
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z*<>=!~]{0,6}".prop_map(Value::from),
    ];
    leaf.prop_recursive(4, 32, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            proptest::collection::btree_map("[a-z*<>=!~]{0,6}", inner, 0..6).prop_map(|m| {
                Value::Object(m.into_iter().collect::<Map<String, Value>>())
            }),
        ]
    })
}

fn operator_token() -> impl Strategy<Value = &'static str> {
    proptest::sample::select(vec!["<", "<=", "=", "!=", ">=", ">", "~"])
}

proptest! {
    /// The parser is total: any JSON either parses or fails with a typed
    /// error, never a panic.
    #[test]
    fn arbitrary_json_never_panics(raw in json_value()) {
        let schema = blog_schema();
        let _ = parse_query(&raw, &schema);
    }

    #[test]
    fn literal_arrays_parse_arm_for_arm(lits in proptest::collection::vec("[a-z]{1,8}", 1..5)) {
        let schema = blog_schema();
        let raw = json!({"post": {"slug": lits}});
        let model = parse_query(&raw, &schema).unwrap();
        let slug = &model.roots[0].children()[0];
        let NodePayload::Match { mode: MatchMode::AnyOf(arms), .. } = &slug.payload else {
            panic!("expected an any-of match");
        };
        prop_assert_eq!(arms.len(), lits.len());
        for (arm, lit) in arms.iter().zip(&lits) {
            prop_assert_eq!(arm, &MatchArm::Literal(json!(lit)));
        }
    }

    #[test]
    fn operator_objects_parse_to_the_matching_filter(
        token in operator_token(),
        operand in any::<i32>(),
    ) {
        let schema = blog_schema();
        let raw = json!({"post": {"score": {(token): operand}}});
        let model = parse_query(&raw, &schema).unwrap();
        let score = &model.roots[0].children()[0];
        let NodePayload::Match { mode: MatchMode::Required, children } = &score.payload else {
            panic!("expected a required match");
        };
        prop_assert_eq!(children.len(), 1);
        let NodePayload::Filter { op, operand: parsed } = &children[0].payload else {
            panic!("expected a filter child");
        };
        prop_assert_eq!(*op, FilterOp::from_token(token).unwrap());
        prop_assert_eq!(parsed, &json!(operand));
    }

    /// Parsed models survive a serde round trip unchanged; mutation requests
    /// carry them as JSON.
    #[test]
    fn models_round_trip_through_serde(lits in proptest::collection::vec("[a-z]{1,8}", 1..4)) {
        let schema = blog_schema();
        let raw = json!({"post": {"slug": lits, "author": {"name": []}}});
        let model = parse_query(&raw, &schema).unwrap();
        let encoded = serde_json::to_string(&model).unwrap();
        let decoded: constel_query::QueryModel = serde_json::from_str(&encoded).unwrap();
        prop_assert_eq!(decoded, model);
    }
}
