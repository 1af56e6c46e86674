//! Immutable connection option maps.
//!
//! An [`OptionMap`] is the bag of tuning parameters handed to connectors and
//! outbound connections. Maps are built once and never mutated; layering is
//! done with [`OptionMap::merge`], where the override map wins on conflicts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known option keys.
pub mod keys {
    pub const SSL_ENABLED: &str = "ssl.enabled";
    pub const SSL_STARTTLS: &str = "ssl.starttls";
    /// Text value: `not-requested` or `requested`.
    pub const SSL_CLIENT_AUTH_MODE: &str = "ssl.client-auth-mode";
    /// Ordered list of mechanism names.
    pub const SASL_MECHANISMS: &str = "sasl.mechanisms";
    pub const SASL_POLICY_NOANONYMOUS: &str = "sasl.policy.noanonymous";
    pub const SASL_POLICY_NOPLAINTEXT: &str = "sasl.policy.noplaintext";
    pub const SASL_POLICY_NOACTIVE: &str = "sasl.policy.noactive";
    pub const SASL_POLICY_NODICTIONARY: &str = "sasl.policy.nodictionary";
    pub const SASL_POLICY_FORWARD_SECRECY: &str = "sasl.policy.forward-secrecy";
    pub const SASL_POLICY_PASS_CREDENTIALS: &str = "sasl.policy.credentials";
    pub const MAX_CONNECTIONS: &str = "connection.max";
    pub const HANDSHAKE_TIMEOUT_MS: &str = "connection.handshake-timeout-ms";
}

/// A single option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<String>),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(v: Vec<String>) -> Self {
        OptionValue::List(v)
    }
}

/// Immutable key/value option bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionMap {
    entries: BTreeMap<String, OptionValue>,
}

impl OptionMap {
    /// An empty map.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a new map.
    pub fn builder() -> OptionMapBuilder {
        OptionMapBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Boolean value for `key`. Text values `"true"`/`"false"` are accepted
    /// because configuration files are not always strict about it.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key)? {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::Text(t) => t.parse().ok(),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Text(t) => t.parse().ok(),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            OptionValue::Text(t) => Some(t),
            _ => None,
        }
    }

    /// List value for `key`. A single text value is treated as a one-element list.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        match self.entries.get(key)? {
            OptionValue::List(l) => Some(l.clone()),
            OptionValue::Text(t) => Some(vec![t.clone()]),
            _ => None,
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Produce a new map holding every entry of `self` and `overrides`.
    /// Keys present in both take the value from `overrides`.
    pub fn merge(&self, overrides: &OptionMap) -> OptionMap {
        let mut entries = self.entries.clone();
        for (k, v) in &overrides.entries {
            entries.insert(k.clone(), v.clone());
        }
        OptionMap { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Builder for [`OptionMap`].
#[derive(Debug, Default)]
pub struct OptionMapBuilder {
    entries: BTreeMap<String, OptionValue>,
}

impl OptionMapBuilder {
    pub fn set(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    /// Copy every entry of `map` into the builder, replacing existing keys.
    pub fn set_all(mut self, map: &OptionMap) -> Self {
        for (k, v) in map.iter() {
            self.entries.insert(k.to_string(), v.clone());
        }
        self
    }

    pub fn build(self) -> OptionMap {
        OptionMap {
            entries: self.entries,
        }
    }
}
