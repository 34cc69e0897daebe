//! Claims decoded from an identity token

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The decoded claims of an identity token
///
/// The shape of the claims varies by tenant configuration, so values are
/// kept as arbitrary JSON.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimsSet(Map<String, Value>);

impl ClaimsSet {
    /// Constructs an empty claims set
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Adds a claim, returning the set
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Gets a claim by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Gets a claim that is expected to hold a string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// The authorization roles carried by these claims
    ///
    /// See [`extract_roles`].
    pub fn roles(&self) -> Vec<String> {
        roles_from_map(&self.0)
    }

    /// Iterates over all claims
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for ClaimsSet {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Derives authorization roles from a decoded claim set
///
/// The `roles` claim is preferred; when it yields no roles, the `groups`
/// claim is used instead. Non-string entries are skipped and duplicates are
/// removed, keeping first-occurrence order. Input that is not a JSON object
/// yields no roles.
pub fn extract_roles(claims: &Value) -> Vec<String> {
    match claims {
        Value::Object(map) => roles_from_map(map),
        _ => Vec::new(),
    }
}

fn roles_from_map(map: &Map<String, Value>) -> Vec<String> {
    let roles = string_entries(map.get("roles"));
    let combined = if roles.is_empty() {
        string_entries(map.get("groups"))
    } else {
        roles
    };

    let mut unique: Vec<String> = Vec::with_capacity(combined.len());
    for entry in combined {
        if !unique.iter().any(|u| u == entry) {
            unique.push(entry.to_owned());
        }
    }
    unique
}

fn string_entries(claim: Option<&Value>) -> Vec<&str> {
    match claim {
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
