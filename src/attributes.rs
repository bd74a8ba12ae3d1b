//! Message attribute helpers
//!
//! Attribute maps are merged with last-write-wins precedence and may be
//! stamped with the time the message originated.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Message attributes (string keys, string values)
pub type Attributes = HashMap<String, String>;

/// Attribute carrying the Unix epoch seconds at which a message was published
pub const ORIGINATED_AT: &str = "OriginatedAt";

/// Merge attribute maps into a single map.
///
/// Precedence is by argument position: when a key appears in more than one
/// map, the value from the last map containing it wins. Merging nothing
/// yields an empty map.
pub fn merge<I, M>(maps: I) -> Attributes
where
    I: IntoIterator<Item = M>,
    M: IntoIterator<Item = (String, String)>,
{
    let mut merged = Attributes::new();
    for map in maps {
        merged.extend(map);
    }
    merged
}

/// Insert [`ORIGINATED_AT`] unless the caller already supplied one.
///
/// Returns true when the attribute was added.
pub fn stamp_originated_at(attributes: &mut Attributes, now: SystemTime) -> bool {
    if attributes.contains_key(ORIGINATED_AT) {
        return false;
    }

    let seconds = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    attributes.insert(ORIGINATED_AT.to_string(), seconds.to_string());
    true
}

/// Parse an [`ORIGINATED_AT`] attribute back into epoch seconds
pub fn originated_at(attributes: &Attributes) -> Option<u64> {
    attributes.get(ORIGINATED_AT)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_of_nothing_is_empty() {
        let merged = merge(Vec::<Attributes>::new());
        assert!(merged.is_empty());
    }

    #[test]
    fn merge_of_one_map_is_identity() {
        let merged = merge([attrs(&[("k", "v")])]);
        assert_eq!(merged, attrs(&[("k", "v")]));
    }

    #[test]
    fn merge_combines_disjoint_maps() {
        let merged = merge([
            attrs(&[("key", "value")]),
            attrs(&[("key2", "value2")]),
            attrs(&[("key3", "value3"), ("key4", "value4")]),
        ]);

        assert_eq!(merged.len(), 4);
        assert_eq!(merged["key"], "value");
        assert_eq!(merged["key4"], "value4");
    }

    #[test]
    fn merge_last_map_wins_on_collision() {
        let merged = merge([
            attrs(&[("k", "v1"), ("only-first", "a")]),
            attrs(&[("k", "v2")]),
            attrs(&[("other", "x")]),
        ]);

        assert_eq!(merged["k"], "v2");
        assert_eq!(merged["only-first"], "a");
        assert_eq!(merged["other"], "x");
    }

    #[test]
    fn merge_precedence_ignores_value_length() {
        let merged = merge([attrs(&[("k", "a-much-longer-value")]), attrs(&[("k", "b")])]);
        assert_eq!(merged["k"], "b");
    }

    #[test]
    fn stamp_adds_epoch_seconds() {
        let mut attributes = Attributes::new();
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        assert!(stamp_originated_at(&mut attributes, now));
        assert_eq!(attributes[ORIGINATED_AT], "1700000000");
        assert_eq!(originated_at(&attributes), Some(1_700_000_000));
    }

    #[test]
    fn stamp_preserves_existing_value() {
        let mut attributes = attrs(&[(ORIGINATED_AT, "42")]);

        assert!(!stamp_originated_at(&mut attributes, SystemTime::now()));
        assert_eq!(attributes[ORIGINATED_AT], "42");
    }

    #[test]
    fn originated_at_rejects_garbage() {
        assert_eq!(originated_at(&attrs(&[(ORIGINATED_AT, "yesterday")])), None);
        assert_eq!(originated_at(&Attributes::new()), None);
    }
}
