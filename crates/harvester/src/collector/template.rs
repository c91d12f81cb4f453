//! URL templates rendered per request.
//!
//! Placeholders are dotted paths in braces, resolved against a JSON context:
//! `{params.owner}`, `{input.name}`, `{page}`, `{skip}`, `{size}`, `{token}`.

use serde_json::Value;

use super::CollectorError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Vec<String>),
}

/// A parsed URL template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl UrlTemplate {
    pub fn parse(raw: &str) -> Result<Self, CollectorError> {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                CollectorError::config(format!("unclosed placeholder in {raw:?}"))
            })?;
            let name = after[..close].trim();
            if name.is_empty() || name.contains('{') {
                return Err(CollectorError::config(format!(
                    "invalid placeholder in {raw:?}"
                )));
            }
            segments.push(Segment::Placeholder(
                name.split('.').map(str::to_string).collect(),
            ));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(CollectorError::config(format!("stray '}}' in {raw:?}")));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitute every placeholder from `context`.
    ///
    /// Strings are inserted as-is; numbers and booleans are formatted.
    pub fn render(&self, context: &Value) -> Result<String, CollectorError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(path) => {
                    let value = path
                        .iter()
                        .try_fold(context, |value, key| value.get(key))
                        .ok_or_else(|| {
                            CollectorError::config(format!(
                                "placeholder {{{}}} has no value",
                                path.join(".")
                            ))
                        })?;
                    match value {
                        Value::String(s) => out.push_str(s),
                        Value::Number(n) => out.push_str(&n.to_string()),
                        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                        other => {
                            return Err(CollectorError::config(format!(
                                "placeholder {{{}}} resolved to non-scalar {other}",
                                path.join(".")
                            )));
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}
