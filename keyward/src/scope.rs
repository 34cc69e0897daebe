//! OAuth2 scopes requested from the identity provider

use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};

/// An OAuth2 scope
#[braid(serde)]
pub struct Scope;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopesDto {
    String(String),
    Array(Vec<Scope>),
}

impl From<ScopesDto> for Scopes {
    fn from(dto: ScopesDto) -> Self {
        match dto {
            ScopesDto::String(s) => s.split_whitespace().map(Scope::from).collect(),
            ScopesDto::Array(arr) => arr.into_iter().collect(),
        }
    }
}

impl From<Scopes> for ScopesDto {
    fn from(s: Scopes) -> Self {
        ScopesDto::String(s.to_string())
    }
}

/// An ordered list of scopes to request
///
/// Duplicates are dropped on insertion, keeping the first occurrence. When
/// deserialized, either a space-delimited string or an array of strings is
/// accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "ScopesDto", into = "ScopesDto")]
pub struct Scopes(Vec<Scope>);

impl Scopes {
    /// Produces an empty scope list
    #[inline]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// The basic identity scopes: `openid`, `profile` and `email`
    pub fn openid_defaults() -> Self {
        Self::new()
            .and(Scope::from_static("openid"))
            .and(Scope::from_static("profile"))
            .and(Scope::from_static("email"))
    }

    /// Produces a list holding a single scope
    pub fn single(scope: impl Into<Scope>) -> Self {
        Self::new().and(scope)
    }

    /// Adds a scope to the list
    pub fn insert(&mut self, scope: impl Into<Scope>) {
        let scope = scope.into();
        if !self.0.contains(&scope) {
            self.0.push(scope);
        }
    }

    /// Adds a scope to the list, returning the list
    #[must_use]
    pub fn and(mut self, scope: impl Into<Scope>) -> Self {
        self.insert(scope);
        self
    }

    /// Whether the list holds no scopes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of scopes in the list
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the scopes in request order
    pub fn iter(&self) -> std::slice::Iter<'_, Scope> {
        self.0.iter()
    }
}

impl fmt::Display for Scopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope.as_str())?;
            first = false;
        }
        Ok(())
    }
}

impl<S: Into<Scope>> FromIterator<S> for Scopes {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut scopes = Self::new();
        scopes.extend(iter);
        scopes
    }
}

impl<S: Into<Scope>> Extend<S> for Scopes {
    fn extend<T: IntoIterator<Item = S>>(&mut self, iter: T) {
        for scope in iter {
            self.insert(scope);
        }
    }
}

impl<'a> IntoIterator for &'a Scopes {
    type Item = &'a Scope;
    type IntoIter = std::slice::Iter<'a, Scope>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_from_space_delimited_string() {
        let scopes: Scopes = serde_json::from_str(r#""openid profile  openid""#).unwrap();
        assert_eq!(scopes, Scopes::new().and("openid").and("profile"));
    }

    #[test]
    fn deserializes_from_array() {
        let scopes: Scopes =
            serde_json::from_str(r#"["api://backend/access_as_user", "openid"]"#).unwrap();
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes.to_string(), "api://backend/access_as_user openid");
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Scopes::openid_defaults()).unwrap();
        assert_eq!(json, r#""openid profile email""#);
    }
}
