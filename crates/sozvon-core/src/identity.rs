//! Login-based identity, the sole routing key for connections and messages.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An authenticated user's login.
///
/// Opaque and immutable; two identities are equal iff their logins are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap a login.
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }

    /// Borrow the login.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the login string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(login: &str) -> Self {
        Self::new(login)
    }
}

impl From<String> for Identity {
    fn from(login: String) -> Self {
        Self(login)
    }
}

impl PartialEq<str> for Identity {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Identity {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl PartialEq<String> for Identity {
    fn eq(&self, other: &String) -> bool {
        &self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn display_is_login() {
        assert_eq!(Identity::new("alice").to_string(), "alice");
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(Identity::new("bob"), 1);
        assert_eq!(map.get("bob"), Some(&1));
        assert!(map.get("carol").is_none());
    }

    #[test]
    fn compares_with_strings() {
        let id = Identity::from("alice");
        assert!(id == *"alice");
        assert!(id == "alice".to_string());
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&Identity::new("dave")).unwrap();
        assert_eq!(json, "\"dave\"");
    }
}
