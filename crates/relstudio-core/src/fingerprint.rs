use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub fn sha256_hex(s: &str) -> String {
    let mut h = Sha256::new();
    h.update(s.as_bytes());
    hex::encode(h.finalize())
}

/// Content-addressed scenario id: identical workspace and values always yield the same id.
///
/// The hashed form is a JSON array, so separators inside keys or values stay escaped.
pub fn scenario_id(workspace_id: &str, values: &BTreeMap<String, String>) -> String {
    // BTreeMap serializes key-sorted, which keeps the rendering canonical.
    let canonical = serde_json::json!([workspace_id, values]);
    sha256_hex(&canonical.to_string())
}

/// Content-addressed judgement id. At most one judgement exists per tuple.
pub fn judgement_id(workspace_id: &str, scenario_id: &str, index: &str, doc_id: &str) -> String {
    let canonical = serde_json::json!([workspace_id, scenario_id, index, doc_id]);
    sha256_hex(&canonical.to_string())
}

/// Identity of an index at a point in time.
#[derive(Debug, Clone)]
pub struct IndexState {
    pub name: String,
    pub uuid: String,
    pub doc_count: u64,
}

/// Fingerprint of the indices an evaluation ran against. Order-insensitive.
pub fn index_fingerprint(indices: &[IndexState]) -> String {
    let mut lines: Vec<String> = indices
        .iter()
        .map(|i| format!("{}:{}:{}", i.name, i.uuid, i.doc_count))
        .collect();
    lines.sort();
    sha256_hex(&lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_id_is_stable_and_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("text".to_string(), "running shoes".to_string());
        a.insert("brand".to_string(), "acme".to_string());

        let mut b = BTreeMap::new();
        b.insert("brand".to_string(), "acme".to_string());
        b.insert("text".to_string(), "running shoes".to_string());

        assert_eq!(scenario_id("ws1", &a), scenario_id("ws1", &b));
        assert_ne!(scenario_id("ws1", &a), scenario_id("ws2", &a));
    }

    #[test]
    fn test_judgement_id_distinguishes_docs() {
        let a = judgement_id("ws", "sc", "products", "1");
        let b = judgement_id("ws", "sc", "products", "2");
        assert_ne!(a, b);
        assert_eq!(a, judgement_id("ws", "sc", "products", "1"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_scenario_id_separators_in_values_do_not_collide() {
        let mut folded = BTreeMap::new();
        folded.insert("a".to_string(), "1\nb=2".to_string());

        let mut split = BTreeMap::new();
        split.insert("a".to_string(), "1".to_string());
        split.insert("b".to_string(), "2".to_string());

        assert_ne!(scenario_id("ws", &folded), scenario_id("ws", &split));

        let mut keyed = BTreeMap::new();
        keyed.insert("a=1\nb".to_string(), "2".to_string());
        assert_ne!(scenario_id("ws", &keyed), scenario_id("ws", &split));
    }

    #[test]
    fn test_judgement_id_separators_do_not_collide() {
        assert_ne!(
            judgement_id("ws", "sc", "products\ndoc_id=1", "2"),
            judgement_id("ws", "sc", "products", "1\ndoc_id=2")
        );
        assert_ne!(
            judgement_id("ws", "sc\nindex=products", "x", "1"),
            judgement_id("ws", "sc", "products", "1")
        );
    }

    #[test]
    fn test_index_fingerprint_order_insensitive() {
        let x = IndexState {
            name: "a".into(),
            uuid: "u1".into(),
            doc_count: 10,
        };
        let y = IndexState {
            name: "b".into(),
            uuid: "u2".into(),
            doc_count: 3,
        };
        assert_eq!(
            index_fingerprint(&[x.clone(), y.clone()]),
            index_fingerprint(&[y, x])
        );
    }
}
