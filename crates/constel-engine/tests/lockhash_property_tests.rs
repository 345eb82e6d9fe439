//! Property tests for the lock hash: deterministic, order-independent over
//! sibling order, and sensitive to any value or identity change.

use proptest::prelude::*;
use serde_json::json;

use constel_engine::lockhash::{lock_hash, LOCK_HASH_PREFIX};
use constel_engine::{Constellation, ResultNode};

fn constellation_of(items: &[(u64, String)]) -> Constellation {
    let entities = items
        .iter()
        .map(|(id, title)| ResultNode::Entity {
            id: *id,
            fields: vec![("title".to_string(), ResultNode::Scalar(json!(title)))],
        })
        .collect();
    Constellation {
        roots: vec![("item".to_string(), ResultNode::Many(entities))],
    }
}

/// Entities with unique ids, in an original and a shuffled order.
fn permuted_items() -> impl Strategy<Value = (Vec<(u64, String)>, Vec<(u64, String)>)> {
    proptest::collection::btree_map(any::<u64>(), "[a-z]{0,8}", 1..8).prop_flat_map(|by_id| {
        let items: Vec<(u64, String)> = by_id.into_iter().collect();
        (Just(items.clone()), Just(items).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn hash_is_deterministic((items, _) in permuted_items()) {
        let c = constellation_of(&items);
        prop_assert_eq!(lock_hash(&c), lock_hash(&c));
    }

    #[test]
    fn hash_has_the_declared_shape((items, _) in permuted_items()) {
        let hash = lock_hash(&constellation_of(&items));
        prop_assert!(hash.starts_with(LOCK_HASH_PREFIX));
        prop_assert_eq!(hash.len(), LOCK_HASH_PREFIX.len() + 64);
        prop_assert!(hash[LOCK_HASH_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sibling_order_does_not_matter((items, shuffled) in permuted_items()) {
        prop_assert_eq!(
            lock_hash(&constellation_of(&items)),
            lock_hash(&constellation_of(&shuffled))
        );
    }

    #[test]
    fn changing_one_value_changes_the_hash((mut items, _) in permuted_items()) {
        let before = lock_hash(&constellation_of(&items));
        items[0].1.push('!');
        prop_assert_ne!(before, lock_hash(&constellation_of(&items)));
    }

    #[test]
    fn changing_one_identity_changes_the_hash((mut items, _) in permuted_items()) {
        let before = lock_hash(&constellation_of(&items));
        let fresh = items.iter().map(|(id, _)| *id).max().unwrap_or(0).wrapping_add(1);
        prop_assume!(!items.iter().any(|(id, _)| *id == fresh));
        items[0].0 = fresh;
        prop_assert_ne!(before, lock_hash(&constellation_of(&items)));
    }

    #[test]
    fn integral_floats_hash_like_integers(n in any::<i32>()) {
        let as_int = Constellation {
            roots: vec![("score".to_string(), ResultNode::Scalar(json!(n)))],
        };
        let as_float = Constellation {
            roots: vec![("score".to_string(), ResultNode::Scalar(json!(f64::from(n))))],
        };
        prop_assert_eq!(lock_hash(&as_int), lock_hash(&as_float));
    }

    #[test]
    fn nested_sequence_order_does_not_matter_either(
        tags in proptest::collection::btree_set("[a-z]{1,6}", 1..6)
    ) {
        let build = |tags: Vec<&String>| Constellation {
            roots: vec![(
                "item".to_string(),
                ResultNode::Entity {
                    id: 1,
                    fields: vec![(
                        "tag".to_string(),
                        ResultNode::Many(
                            tags.iter().map(|t| ResultNode::Scalar(json!(t))).collect(),
                        ),
                    )],
                },
            )],
        };
        let forward: Vec<&String> = tags.iter().collect();
        let backward: Vec<&String> = tags.iter().rev().collect();
        prop_assert_eq!(lock_hash(&build(forward)), lock_hash(&build(backward)));
    }
}
