//! Immutable metadata bags.
//!
//! A [`Metadata`] value is a snapshot: it can be cloned and shared between concurrent calls,
//! and every modification returns a new bag. Two calls that start from the same base bag can
//! therefore never observe each other's trace headers.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tonic::metadata::MetadataMap;

/// Key to ordered values mapping attached to an RPC call.
///
/// Keys are stored lower-cased, the way gRPC metadata keys are compared.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Arc<BTreeMap<String, Vec<String>>>,
}

impl Metadata {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a bag from key/value pairs. Repeated keys keep every value, in order.
    pub fn pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut entries: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in pairs {
            entries
                .entry(key.as_ref().to_ascii_lowercase())
                .or_default()
                .push(value.into());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// All values stored under `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    /// The values under `key` concatenated with no separator, the way a header split
    /// across several entries is reassembled.
    pub fn get_joined(&self, key: &str) -> Option<String> {
        self.get(key).map(|values| values.concat())
    }

    /// Returns `true` if `key` has at least one value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the bag holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over keys and their values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Returns a copy of this bag where `key` maps to `value` alone.
    pub fn with_value(&self, key: &str, value: impl Into<String>) -> Self {
        let mut entries = BTreeMap::clone(&self.entries);
        entries.insert(key.to_ascii_lowercase(), vec![value.into()]);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Returns a copy of this bag with `value` appended under `key`.
    pub fn with_appended(&self, key: &str, value: impl Into<String>) -> Self {
        let mut entries = BTreeMap::clone(&self.entries);
        entries
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Returns `true` if both bags are the same snapshot, not merely equal.
    pub fn ptr_eq(&self, other: &Metadata) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Converts the bag into tonic metadata.
    ///
    /// Keys or values that are not valid HTTP/2 header text are dropped.
    pub fn to_metadata_map(&self) -> MetadataMap {
        let mut headers = HeaderMap::new();
        for (key, values) in self.iter() {
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                tracing::debug!(key, "dropping metadata entry with an invalid key");
                continue;
            };
            for value in values {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.append(name.clone(), value);
                    }
                    Err(_) => tracing::debug!(key, "dropping metadata value that is not header text"),
                }
            }
        }
        MetadataMap::from_headers(headers)
    }
}

impl From<&MetadataMap> for Metadata {
    fn from(map: &MetadataMap) -> Self {
        let headers = map.clone().into_headers();
        Metadata::pairs(headers.iter().filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str(), value.to_owned()))
        }))
    }
}

impl From<MetadataMap> for Metadata {
    fn from(map: MetadataMap) -> Self {
        Metadata::from(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_keep_repeated_values_in_order() {
        let md = Metadata::pairs([("A", "1"), ("b", "2"), ("a", "3")]);
        assert_eq!(md.get("a"), Some(&["1".to_owned(), "3".to_owned()][..]));
        assert_eq!(md.get_joined("A").as_deref(), Some("13"));
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn with_value_leaves_the_original_alone() {
        let base = Metadata::pairs([("authorization", "token"), ("x-cloud-trace-context", "old")]);
        let shared = base.clone();

        let updated = base.with_value("x-cloud-trace-context", "new");

        assert_eq!(base.get_joined("x-cloud-trace-context").as_deref(), Some("old"));
        assert_eq!(updated.get_joined("x-cloud-trace-context").as_deref(), Some("new"));
        assert_eq!(updated.get_joined("authorization").as_deref(), Some("token"));
        assert!(base.ptr_eq(&shared));
        assert!(!base.ptr_eq(&updated));
    }

    #[test]
    fn with_appended_adds_a_value() {
        let base = Metadata::pairs([("k", "1")]);
        let updated = base.with_appended("K", "2");
        assert_eq!(base.get("k").map(<[String]>::len), Some(1));
        assert_eq!(updated.get("k").map(<[String]>::len), Some(2));
    }

    #[test]
    fn converts_through_tonic_metadata() {
        let md = Metadata::pairs([
            ("x-cloud-trace-context", "abc/42;o=1"),
            ("x-multi", "one"),
            ("x-multi", "two"),
        ]);

        let map = md.to_metadata_map();
        assert_eq!(
            map.get("x-cloud-trace-context").and_then(|v| v.to_str().ok()),
            Some("abc/42;o=1")
        );
        assert_eq!(map.get_all("x-multi").iter().count(), 2);

        assert_eq!(Metadata::from(&map), md);
    }

    #[test]
    fn invalid_header_text_is_dropped() {
        let md = Metadata::pairs([("bad key", "v"), ("good", "line\nbreak"), ("ok", "fine")]);
        let map = md.to_metadata_map();
        assert!(map.get("ok").is_some());
        assert!(map.get("good").is_none());
        assert_eq!(map.len(), 1);
    }
}
