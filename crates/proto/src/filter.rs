//! Subscription filters.
//!
//! A filter is a structured predicate over event attributes. The pool treats
//! filters as opaque: they are built here and passed through to relays.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Filter for REQ subscriptions. Absent fields are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed by `#`-prefixed tag name (e.g. `#e`, `#p`).
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query. The key is the bare tag name without `#`.
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Match events referencing the given event ids (`#e`).
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Match events referencing the given pubkeys (`#p`).
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_fields() {
        let filter = Filter::new()
            .kinds(vec![1, 4])
            .authors(vec!["author1".to_string()])
            .since(1000)
            .until(2000)
            .limit(100)
            .event_refs(vec!["event1".to_string()]);

        assert_eq!(filter.kinds, Some(vec![1, 4]));
        assert_eq!(filter.since, Some(1000));
        assert_eq!(filter.until, Some(2000));
        assert_eq!(filter.limit, Some(100));
        assert_eq!(filter.tags.get("#e"), Some(&vec!["event1".to_string()]));
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let filter = Filter::new().kinds(vec![1]).limit(10);
        let json = serde_json::to_string(&filter).unwrap();

        assert!(json.contains("\"kinds\":[1]"));
        assert!(json.contains("\"limit\":10"));
        assert!(!json.contains("authors"));
        assert!(!json.contains("since"));
    }

    #[test]
    fn tag_queries_flatten_on_the_wire() {
        let filter = Filter::new().pubkey_refs(vec!["ab".to_string()]);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"#p\":[\"ab\"]"));
    }

    #[test]
    fn deserializes_tag_queries() {
        let filter: Filter =
            serde_json::from_str(r##"{"kinds":[1],"#e":["abc"],"limit":5}"##).unwrap();
        assert_eq!(filter.kinds, Some(vec![1]));
        assert_eq!(filter.tags.get("#e"), Some(&vec!["abc".to_string()]));
    }
}
