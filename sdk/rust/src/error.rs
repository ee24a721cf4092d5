//! Strongly typed error system for the gqlmux SDK.
//!
//! Every failure the server surface can produce carries an [`ErrorCode`], and
//! every code maps to exactly one HTTP status.

use gqlmux_core::SizeError;
use gqlmux_runtime::{FieldError, SchemaLoadError};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Typed error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Setup errors
    ConfigurationError,
    SchemaLoadError,

    // Request errors
    MalformedRequest,
    ParseError,
    ValidationError,
    MethodNotAllowed,
    PayloadTooLarge,

    // Runtime errors
    ExecutionError,
    TransportError,
    InternalError,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::SchemaLoadError => "SCHEMA_LOAD_ERROR",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::ParseError => "GRAPHQL_PARSE_FAILED",
            Self::ValidationError => "GRAPHQL_VALIDATION_FAILED",
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::InternalError => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Returns true if the request itself is at fault (4xx).
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRequest
                | Self::ParseError
                | Self::ValidationError
                | Self::MethodNotAllowed
                | Self::PayloadTooLarge
        )
    }

    /// Returns true if the server is at fault (5xx).
    pub const fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// The HTTP status a single-shot response carries for this code.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest | Self::ParseError | Self::ValidationError => {
                StatusCode::BAD_REQUEST
            }
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ConfigurationError
            | Self::SchemaLoadError
            | Self::ExecutionError
            | Self::TransportError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strongly typed SDK error.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct SdkError {
    /// Typed error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// The error this one was raised from.
    #[source]
    pub source: Option<Box<SdkError>>,
    /// Extension data for debugging.
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl SdkError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            extensions: None,
        }
    }

    /// Adds a source error.
    #[must_use]
    pub fn with_source(mut self, source: SdkError) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Adds extension data.
    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let extensions = self.extensions.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            extensions.insert(key.into(), v);
        }
        self
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    pub fn schema_load(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaLoadError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedRequest, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodNotAllowed, message)
    }

    pub fn payload_too_large(limit: u64) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("Request body exceeds the limit of {limit} bytes."),
        )
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn is_client_error(&self) -> bool {
        self.code.is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.code.is_server_error()
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// Converts this error into a GraphQL error.
    ///
    /// Client errors keep their message. Server errors become unexpected
    /// errors, which error masking rewrites before they reach a client.
    pub fn to_field_error(&self) -> FieldError {
        let error = if self.is_client_error() {
            FieldError::request(self.message.clone())
        } else {
            FieldError::new(self.message.clone())
        };
        error.with_code(self.code.as_str())
    }
}

impl Serialize for SdkError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("SdkError", 3)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if let Some(ref ext) = self.extensions {
            state.serialize_field("extensions", ext)?;
        }
        state.end()
    }
}

impl From<SchemaLoadError> for SdkError {
    fn from(error: SchemaLoadError) -> Self {
        let mut sdk = SdkError::schema_load(error.message.clone());
        if let Some(source) = error.source.as_ref() {
            sdk = sdk.with_extension("cause", source.to_string());
        }
        sdk
    }
}

impl From<SizeError> for SdkError {
    fn from(error: SizeError) -> Self {
        SdkError::configuration(error.to_string())
    }
}

/// Type alias for SDK results.
pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Converts foreign errors into an [`SdkError`] with a chosen code.
pub trait IntoSdkError {
    fn into_sdk_error(self, code: ErrorCode) -> SdkError;
}

impl<E: std::error::Error> IntoSdkError for E {
    fn into_sdk_error(self, code: ErrorCode) -> SdkError {
        SdkError::new(code, self.to_string())
    }
}

/// Result extension for mapping errors with context.
pub trait ResultExt<T> {
    /// Maps the error to an SdkError with the given code.
    fn map_sdk_err(self, code: ErrorCode) -> SdkResult<T>;

    /// Maps the error to an SdkError with the given code and message.
    fn map_sdk_err_with(self, code: ErrorCode, message: impl Into<String>) -> SdkResult<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn map_sdk_err(self, code: ErrorCode) -> SdkResult<T> {
        self.map_err(|e| e.into_sdk_error(code))
    }

    fn map_sdk_err_with(self, code: ErrorCode, message: impl Into<String>) -> SdkResult<T> {
        self.map_err(|e| {
            SdkError::new(code, message).with_extension("original_error", e.to_string())
        })
    }
}
