//! Dot-separated field paths into JSON values.
//!
//! A path like `data.items` walks nested objects one key at a time. Lookup
//! failures are returned as [`PathError`] values so fan-out input
//! validation stays an ordinary branch.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("field path '{path}' contains an empty segment")]
    EmptySegment { path: String },

    #[error("field '{segment}' not found (path '{path}')")]
    NotFound { path: String, segment: String },

    #[error("cannot look up '{segment}' in a {found} (path '{path}')")]
    NotAMapping {
        path: String,
        segment: String,
        found: &'static str,
    },
}

/// Parsed, non-empty field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(PathError::EmptySegment {
                path: path.to_string(),
            });
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Walk `value` along the path.
    pub fn resolve<'v>(&self, value: &'v Value) -> Result<&'v Value, PathError> {
        let mut current = value;
        for segment in &self.segments {
            current = match current {
                Value::Object(map) => map.get(segment).ok_or_else(|| PathError::NotFound {
                    path: self.to_string(),
                    segment: segment.clone(),
                })?,
                other => {
                    return Err(PathError::NotAMapping {
                        path: self.to_string(),
                        segment: segment.clone(),
                        found: value_kind(other),
                    });
                }
            };
        }
        Ok(current)
    }
}

impl FromStr for FieldPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Human-readable JSON type name, used in error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
