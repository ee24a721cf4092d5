//! GraphQL errors as they appear in responses.

use crate::resolver::ResolverError;
use gqlmux_core::SourceLocation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::Field(s)
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        Self::Field(s.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// Where an error came from. Drives masking; never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorOrigin {
    /// Syntax, validation and variable errors caused by the request itself.
    Request,
    /// A resolver chose a message meant for clients.
    Public,
    /// Anything else.
    #[default]
    Unexpected,
}

/// A GraphQL error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<SourceLocation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    #[serde(skip)]
    pub origin: ErrorOrigin,
}

impl FieldError {
    /// Creates an unexpected error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
            origin: ErrorOrigin::Unexpected,
        }
    }

    /// Creates an error caused by the request (syntax, validation, variables).
    pub fn request(message: impl Into<String>) -> Self {
        Self::new(message).with_origin(ErrorOrigin::Request)
    }

    /// Creates an error whose message is meant for clients.
    pub fn public(message: impl Into<String>) -> Self {
        Self::new(message).with_origin(ErrorOrigin::Public)
    }

    #[must_use]
    pub fn with_origin(mut self, origin: ErrorOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.locations.get_or_insert_with(Vec::new).push(location);
        self
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    #[must_use]
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", Value::String(code.into()))
    }

    /// Returns true when masking must not touch this error.
    pub fn is_client_safe(&self) -> bool {
        !matches!(self.origin, ErrorOrigin::Unexpected)
    }
}

impl From<ResolverError> for FieldError {
    fn from(error: ResolverError) -> Self {
        let origin = if error.is_public() {
            ErrorOrigin::Public
        } else {
            ErrorOrigin::Unexpected
        };
        FieldError::new(error.to_string()).with_origin(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_error() {
        let error = FieldError::new("Something went wrong")
            .with_path(vec!["user".into(), 0.into(), "name".into()])
            .with_location(SourceLocation { line: 1, column: 3 })
            .with_code("NOT_FOUND");

        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({
                "message": "Something went wrong",
                "locations": [{"line": 1, "column": 3}],
                "path": ["user", 0, "name"],
                "extensions": {"code": "NOT_FOUND"}
            })
        );
    }

    #[test]
    fn test_origin_is_not_serialized() {
        let error = FieldError::public("Not allowed");
        assert_eq!(serde_json::to_value(&error).unwrap(), json!({"message": "Not allowed"}));
        assert!(error.is_client_safe());
    }

    #[test]
    fn test_from_resolver_error() {
        let masked: FieldError = ResolverError::custom("db down").into();
        assert_eq!(masked.origin, ErrorOrigin::Unexpected);

        let public: FieldError = ResolverError::public("Not allowed").into();
        assert_eq!(public.origin, ErrorOrigin::Public);
        assert_eq!(public.message, "Not allowed");
    }
}
