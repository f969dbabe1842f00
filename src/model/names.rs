use std::fmt;

use serde::{Deserialize, Serialize};

/// A case-folded identity: username, hostname, or group name.
///
/// Folding (trim + lowercase) happens once, at construction and on
/// deserialization, so every equality or set-membership check downstream
/// compares normalized values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FoldedName(String);

impl FoldedName {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare against an unfolded string.
    pub fn matches(&self, raw: &str) -> bool {
        self.0 == raw.trim().to_lowercase()
    }
}

impl From<String> for FoldedName {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for FoldedName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<FoldedName> for String {
    fn from(value: FoldedName) -> Self {
        value.0
    }
}

impl fmt::Display for FoldedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_is_case_and_whitespace_insensitive() {
        assert_eq!(FoldedName::new("  HOST1 "), FoldedName::new("host1"));
        assert!(FoldedName::new("Alice").matches("ALICE"));
    }

    #[test]
    fn deserialization_folds() {
        let name: FoldedName = serde_json::from_str("\"Web-Prod\"").unwrap();
        assert_eq!(name.as_str(), "web-prod");
    }
}
