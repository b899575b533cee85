use crate::InferItem;

/// Deterministic item fingerprint:
/// - pairs are visited in key order (the map is sorted)
/// - hash bytes: "<key_len>:<key><value_len>:<value>" for each pair
///
/// Every field takes part, so items that differ only in an auxiliary field
/// get different fingerprints.
pub fn item_fingerprint(item: &InferItem) -> String {
    let mut hasher = blake3::Hasher::new();
    for (k, v) in item {
        hasher.update(k.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(k.as_bytes());
        hasher.update(v.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(v.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(pairs: &[(&str, &str)]) -> InferItem {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let a = item(&[("text", "hello"), ("source", "web")]);
        let b = item(&[("source", "web"), ("text", "hello")]);
        assert_eq!(item_fingerprint(&a), item_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_on_auxiliary_field() {
        let a = item(&[("text", "hello"), ("source", "web")]);
        let b = item(&[("text", "hello"), ("source", "mail")]);
        assert_ne!(item_fingerprint(&a), item_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let a = item(&[("ab", "c")]);
        let b = item(&[("a", "bc")]);
        assert_ne!(item_fingerprint(&a), item_fingerprint(&b));
    }
}
