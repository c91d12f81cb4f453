use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::CollectorError;

/// Stable serialization of a collection scope.
///
/// Stored in the `params` column of every raw row; two runs with equal
/// fingerprints own the same rows. Object keys are emitted in sorted order,
/// so field order in the source struct or map does not matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    text: String,
    value: Value,
}

impl Fingerprint {
    pub fn of(params: &impl Serialize) -> Result<Self, CollectorError> {
        // serde_json::Value keeps object keys in a BTreeMap, so round-tripping
        // through it canonicalizes the key order.
        let value = serde_json::to_value(params)?;
        let text = serde_json::to_string(&value)?;
        Ok(Self { text, value })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The fingerprint as JSON, used to render `{params.*}` placeholders.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct RepoScope {
        repo: &'static str,
        connection_id: u64,
    }

    #[derive(Serialize)]
    struct ReorderedScope {
        connection_id: u64,
        repo: &'static str,
    }

    #[test]
    fn field_order_does_not_matter() {
        let a = Fingerprint::of(&RepoScope {
            repo: "a/b",
            connection_id: 1,
        })
        .unwrap();
        let b = Fingerprint::of(&ReorderedScope {
            connection_id: 1,
            repo: "a/b",
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"connection_id":1,"repo":"a/b"}"#);
    }

    #[test]
    fn different_scopes_differ() {
        let a = Fingerprint::of(&json!({"repo": "a"})).unwrap();
        let b = Fingerprint::of(&json!({"repo": "b"})).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.value()["repo"], "a");
    }
}
