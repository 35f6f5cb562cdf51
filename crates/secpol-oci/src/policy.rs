//! Security policy document types.
//!
//! These are the types the guest runtime consumes. Every list in the document
//! is encoded as an indexed collection:
//!
//! ```json
//! {"length": 2, "elements": {"0": "/bin/sh", "1": "-c"}}
//! ```
//!
//! The explicit count lets the enforcement side detect truncated documents,
//! and the string keys let additional entries be merged in without
//! renumbering.

use std::collections::HashMap;
use std::fmt;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An ordered collection keyed by decimal indices, with an element count.
///
/// Keys are always `"0"..="len-1"` in insertion order and the count always
/// matches; both are derived from the backing vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elements<T> {
    items: Vec<T>,
}

impl<T> Elements<T> {
    /// Create an empty collection.
    #[must_use]
    pub const fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Number of elements (the `length` field).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an element, returning the key it was stored under.
    pub fn push(&mut self, item: T) -> String {
        self.items.push(item);
        (self.items.len() - 1).to_string()
    }

    /// Look up an element by its string key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&T> {
        key.parse::<usize>().ok().and_then(|i| self.items.get(i))
    }

    /// The keys, in index order.
    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.items.len()).map(|i| i.to_string())
    }

    /// The elements, in index order.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Consume the collection, returning the elements in index order.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for Elements<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for Elements<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T> FromIterator<T> for Elements<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T> Extend<T> for Elements<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

impl<T: Serialize> Serialize for Elements<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Elements", 2)?;
        state.serialize_field("length", &self.items.len())?;
        state.serialize_field("elements", &IndexedMap(&self.items))?;
        state.end()
    }
}

struct IndexedMap<'a, T>(&'a [T]);

impl<T: Serialize> Serialize for IndexedMap<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (i, item) in self.0.iter().enumerate() {
            map.serialize_entry(&i.to_string(), item)?;
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawElements<T> {
    length: usize,
    elements: Option<HashMap<String, T>>,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Elements<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawElements::<T>::deserialize(deserializer)?;
        let mut elements = raw.elements.unwrap_or_default();

        if elements.len() != raw.length {
            return Err(serde::de::Error::custom(format!(
                "length is {} but {} elements are present",
                raw.length,
                elements.len()
            )));
        }

        let mut items = Vec::with_capacity(raw.length);
        for i in 0..raw.length {
            let item = elements
                .remove(&i.to_string())
                .ok_or_else(|| serde::de::Error::custom(format!("missing element {i}")))?;
            items.push(item);
        }

        Ok(Self { items })
    }
}

/// How an environment variable rule is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvRuleStrategy {
    /// Exact `NAME=value` match.
    #[default]
    String,
    /// Regular expression match against `NAME=value`.
    Re2,
}

impl fmt::Display for EnvRuleStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Re2 => write!(f, "re2"),
        }
    }
}

/// A compiled environment variable rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRule {
    /// Matching strategy.
    pub strategy: EnvRuleStrategy,
    /// `NAME=value` (or a pattern over it).
    pub rule: String,
}

impl EnvRule {
    /// Build a rule from a name and value.
    ///
    /// The name is used verbatim; a name containing `=` yields an ambiguous
    /// rule string.
    #[must_use]
    pub fn from_pair(name: &str, value: &str, strategy: EnvRuleStrategy) -> Self {
        Self {
            strategy,
            rule: format!("{name}={value}"),
        }
    }
}

/// A permitted mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConstraint {
    /// Host path.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Mount type, e.g. `bind`.
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Mount options, e.g. `rbind`, `ro`.
    pub options: Elements<String>,
}

/// Compiled policy for a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPolicy {
    /// Permitted argv.
    pub command: Elements<String>,
    /// Permitted environment variables.
    pub env_rules: Elements<EnvRule>,
    /// Layer root digests, base layer first.
    pub layers: Elements<String>,
    /// Permitted working directory.
    pub working_dir: String,
    /// Permitted mounts.
    pub mounts: Elements<MountConstraint>,
    /// Mount points the container waits on before starting.
    pub wait_mount_points: Elements<String>,
    /// Whether the container may run privileged.
    pub allow_elevated: bool,
}

/// The security policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// When set, every container is permitted and `containers` is empty.
    pub allow_all: bool,
    /// Compiled container policies, in matching order.
    pub containers: Elements<ContainerPolicy>,
}

impl SecurityPolicy {
    /// The open-door policy: permit everything.
    #[must_use]
    pub const fn open_door() -> Self {
        Self {
            allow_all: true,
            containers: Elements::new(),
        }
    }

    /// A policy permitting exactly `containers`.
    #[must_use]
    pub fn new(containers: Vec<ContainerPolicy>) -> Self {
        Self {
            allow_all: false,
            containers: containers.into(),
        }
    }

    /// Whether this is the open-door policy.
    #[must_use]
    pub fn is_open_door(&self) -> bool {
        self.allow_all && self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_container() -> ContainerPolicy {
        ContainerPolicy {
            command: vec!["/pause".to_string()].into(),
            env_rules: vec![EnvRule::from_pair(
                "PATH",
                "/usr/bin",
                EnvRuleStrategy::String,
            )]
            .into(),
            layers: vec!["ab".repeat(32)].into(),
            working_dir: "/".to_string(),
            mounts: Elements::new(),
            wait_mount_points: Elements::new(),
            allow_elevated: false,
        }
    }

    #[test]
    fn open_door_document() {
        let json = serde_json::to_string(&SecurityPolicy::open_door()).unwrap();
        insta::assert_snapshot!(json, @r#"{"allow_all":true,"containers":{"length":0,"elements":{}}}"#);
    }

    #[test]
    fn elements_encoding_is_indexed() {
        let elements: Elements<String> = ["a", "b", "c"].into_iter().map(String::from).collect();
        let value = serde_json::to_value(&elements).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"length": 3, "elements": {"0": "a", "1": "b", "2": "c"}})
        );
    }

    #[test]
    fn push_continues_the_index_sequence() {
        let mut elements: Elements<u32> = vec![10, 20].into();
        assert_eq!(elements.push(30), "2");
        assert_eq!(elements.push(40), "3");
        assert_eq!(elements.len(), 4);
        assert_eq!(elements.get("3"), Some(&40));
        assert_eq!(elements.get("4"), None);
        assert_eq!(elements.keys().collect::<Vec<_>>(), ["0", "1", "2", "3"]);
    }

    #[test]
    fn container_policy_round_trips() {
        let policy = SecurityPolicy::new(vec![sample_container()]);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: SecurityPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
        assert!(!parsed.is_open_door());
    }

    #[test]
    fn strategy_is_lowercase() {
        let rule = EnvRule::from_pair("TERM", "xterm", EnvRuleStrategy::Re2);
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value, serde_json::json!({"strategy": "re2", "rule": "TERM=xterm"}));
    }

    #[test]
    fn mismatched_length_is_rejected() {
        let json = r#"{"length": 2, "elements": {"0": "a"}}"#;
        assert!(serde_json::from_str::<Elements<String>>(json).is_err());

        let json = r#"{"length": 1, "elements": {"1": "a"}}"#;
        assert!(serde_json::from_str::<Elements<String>>(json).is_err());
    }

    #[test]
    fn null_elements_mean_empty() {
        let json = r#"{"length": 0, "elements": null}"#;
        let elements: Elements<String> = serde_json::from_str(json).unwrap();
        assert!(elements.is_empty());
    }

    #[test]
    fn element_types_need_not_have_defaults() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Port(u16);

        let elements: Elements<Port> =
            serde_json::from_str(r#"{"length": 2, "elements": {"1": 443, "0": 80}}"#).unwrap();
        assert_eq!(elements.get("0"), Some(&Port(80)));
        assert_eq!(elements.get("1"), Some(&Port(443)));

        let empty: Elements<Port> = serde_json::from_str(r#"{"length": 0}"#).unwrap();
        assert!(empty.is_empty());
    }
}
