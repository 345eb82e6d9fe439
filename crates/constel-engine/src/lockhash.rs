//! Lock hash: an order-independent SHA-256 digest over a constellation.
//!
//! Per-node digest = H(tag ‖ role ‖ entity id ‖ canonical scalar ‖ sorted
//! child digests). Child digests are sorted bytewise before being combined,
//! so store-side enumeration order never affects the hash; two resolutions
//! of the same query against equal state always agree, and any change to a
//! matched value or to the identity set of a matched association changes it.
//!
//! Rendered as `"sha256:<64 lowercase hex digits>"`.

use sha2::{Digest, Sha256};

use crate::constellation::{Constellation, ResultNode};
use crate::value::canonical;

/// Prefix used in serialized lock hashes.
pub const LOCK_HASH_PREFIX: &str = "sha256:";

/// Compute the lock hash of a resolved constellation.
pub fn lock_hash(constellation: &Constellation) -> String {
    let mut digests: Vec<[u8; 32]> = constellation
        .roots
        .iter()
        .map(|(role, node)| node_digest(role, node))
        .collect();
    digests.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(b"constellation");
    for d in &digests {
        hasher.update(d);
    }
    let out = hasher.finalize();
    format!("{LOCK_HASH_PREFIX}{}", hex(&out))
}

fn node_digest(role: &str, node: &ResultNode) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update([0u8]);
    match node {
        ResultNode::Scalar(value) => {
            hasher.update(b"s");
            hasher.update(canonical(value).as_bytes());
        }
        ResultNode::Absent => {
            hasher.update(b"a");
        }
        ResultNode::Entity { id, fields } => {
            hasher.update(b"e");
            hasher.update(id.to_be_bytes());
            let mut children: Vec<[u8; 32]> = fields
                .iter()
                .map(|(name, child)| node_digest(name, child))
                .collect();
            children.sort_unstable();
            for c in &children {
                hasher.update(c);
            }
        }
        ResultNode::Many(items) => {
            hasher.update(b"m");
            let mut children: Vec<[u8; 32]> =
                items.iter().map(|item| node_digest("", item)).collect();
            children.sort_unstable();
            for c in &children {
                hasher.update(c);
            }
        }
    }
    hasher.finalize().into()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(id: u64, title: &str) -> ResultNode {
        ResultNode::Entity {
            id,
            fields: vec![("title".to_string(), ResultNode::Scalar(json!(title)))],
        }
    }

    #[test]
    fn has_prefix_and_width() {
        let c = Constellation {
            roots: vec![("post".to_string(), ResultNode::Many(vec![post(1, "a")]))],
        };
        let h = lock_hash(&c);
        assert!(h.starts_with(LOCK_HASH_PREFIX));
        assert_eq!(h.len(), LOCK_HASH_PREFIX.len() + 64);
    }

    #[test]
    fn order_of_to_many_elements_is_irrelevant() {
        let forward = Constellation {
            roots: vec![(
                "post".to_string(),
                ResultNode::Many(vec![post(1, "a"), post(2, "b")]),
            )],
        };
        let backward = Constellation {
            roots: vec![(
                "post".to_string(),
                ResultNode::Many(vec![post(2, "b"), post(1, "a")]),
            )],
        };
        assert_eq!(lock_hash(&forward), lock_hash(&backward));
    }

    #[test]
    fn value_change_changes_the_hash() {
        let a = Constellation {
            roots: vec![("post".to_string(), ResultNode::Many(vec![post(1, "a")]))],
        };
        let b = Constellation {
            roots: vec![("post".to_string(), ResultNode::Many(vec![post(1, "b")]))],
        };
        assert_ne!(lock_hash(&a), lock_hash(&b));
    }

    #[test]
    fn identity_change_changes_the_hash() {
        let a = Constellation {
            roots: vec![("post".to_string(), ResultNode::Many(vec![post(1, "a")]))],
        };
        let b = Constellation {
            roots: vec![("post".to_string(), ResultNode::Many(vec![post(2, "a")]))],
        };
        assert_ne!(lock_hash(&a), lock_hash(&b));
    }

    #[test]
    fn absence_differs_from_null_scalar() {
        let absent = Constellation {
            roots: vec![("post".to_string(), ResultNode::Absent)],
        };
        let null = Constellation {
            roots: vec![("post".to_string(), ResultNode::Scalar(json!(null)))],
        };
        assert_ne!(lock_hash(&absent), lock_hash(&null));
    }
}
